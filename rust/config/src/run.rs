//! Per-run job configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ClusterKind, DiagnosticKind, Thresholds};

/// Everything needed to build and judge one diagnostic job.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TestRunConfig {
    #[serde(default)]
    pub cluster: ClusterKind,
    #[serde(default = "default_job_name")]
    pub job_name: String,
    #[serde(default = "default_partition")]
    pub partition: String,
    /// Accelerators (and tasks) per node.
    #[serde(default = "default_gpu_per_node")]
    pub gpu_per_node: u32,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    /// How long the job may stay queued or running before it is cancelled.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default)]
    pub job_comment: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    /// Restrict the allocation to these nodes (scheduler hostlist syntax).
    #[serde(default)]
    pub nodelist: Option<String>,
    /// Keep the allocation off these nodes (scheduler hostlist syntax).
    #[serde(default)]
    pub exclude: Option<String>,
    #[serde(default)]
    pub test_kind: DiagnosticKind,
    /// Python virtualenv activated before launching the worker.
    #[serde(default)]
    pub venv: Option<String>,
    #[serde(default)]
    pub thresholds: ThresholdOverrides,
}

/// Optional per-field replacements for a diagnostic kind's default thresholds.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ThresholdOverrides {
    #[serde(default)]
    pub expected_value: Option<f64>,
    #[serde(default)]
    pub tolerance: Option<f64>,
    #[serde(default)]
    pub max_elapsed_secs: Option<f64>,
}

fn default_job_name() -> String {
    "gpu_tester".to_string()
}
fn default_partition() -> String {
    "compute-od-gpu".to_string()
}
fn default_gpu_per_node() -> u32 {
    8
}
fn default_nodes() -> u32 {
    1
}
fn default_job_timeout_secs() -> u64 {
    150
}

impl Default for TestRunConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterKind::default(),
            job_name: default_job_name(),
            partition: default_partition(),
            gpu_per_node: default_gpu_per_node(),
            nodes: default_nodes(),
            job_timeout_secs: default_job_timeout_secs(),
            job_comment: None,
            account: None,
            nodelist: None,
            exclude: None,
            test_kind: DiagnosticKind::default(),
            venv: None,
            thresholds: ThresholdOverrides::default(),
        }
    }
}

impl TestRunConfig {
    /// Thresholds for this run: the kind's defaults with any overrides applied.
    #[must_use]
    pub fn thresholds(&self) -> Thresholds {
        let base = self.test_kind.default_thresholds();
        Thresholds {
            expected_value: self.thresholds.expected_value.or(base.expected_value),
            tolerance: self.thresholds.tolerance.unwrap_or(base.tolerance),
            max_elapsed_secs: self
                .thresholds
                .max_elapsed_secs
                .unwrap_or(base.max_elapsed_secs),
        }
    }

    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Number of accelerator slots the allocation is expected to expose.
    #[must_use]
    pub fn expected_slots(&self) -> u64 {
        u64::from(self.nodes) * u64::from(self.gpu_per_node)
    }
}
