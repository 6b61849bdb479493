//! Configuration parsing for the GPU tester.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use gpu_tester_config::{ClusterKind, ReportGranularity, TestRunConfig};
use serde::{Deserialize, Serialize};

use crate::{
    controller::PollTiming,
    coordinator::{CoordinatorSettings, StaggerPolicy},
};

/// Configuration after merging the file with command-line overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TesterConfig {
    #[serde(default)]
    pub tester: TesterSettings,
    #[serde(default)]
    pub job: TestRunConfig,
}

/// Invocation-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesterSettings {
    /// Number of independent jobs submitted in this invocation.
    #[serde(default = "default_parallel_runs")]
    pub parallel_runs: usize,
    /// Jobs allowed in flight at once. Defaults to `parallel_runs`.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Delay between two bursts of submissions.
    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,
    /// Submissions per burst.
    #[serde(default = "default_burst_size")]
    pub burst_size: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How long to wait for a cancelled job to leave the queue.
    #[serde(default = "default_cancel_wait_secs")]
    pub cancel_wait_secs: u64,
    /// Bound on a single scheduler status query.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Bound on `sbatch` and `scancel`.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub granularity: ReportGranularity,
    /// Where run directories are created. Defaults to `./results`.
    #[serde(default)]
    pub output_folder: Option<String>,
}

impl Default for TesterSettings {
    fn default() -> Self {
        Self {
            parallel_runs: default_parallel_runs(),
            max_concurrency: None,
            stagger_secs: default_stagger_secs(),
            burst_size: default_burst_size(),
            poll_interval_secs: default_poll_interval_secs(),
            cancel_wait_secs: default_cancel_wait_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            granularity: ReportGranularity::default(),
            output_folder: None,
        }
    }
}

fn default_parallel_runs() -> usize {
    1
}

fn default_stagger_secs() -> u64 {
    10
}

fn default_burst_size() -> usize {
    4
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_cancel_wait_secs() -> u64 {
    30
}

fn default_query_timeout_secs() -> u64 {
    10
}

fn default_command_timeout_secs() -> u64 {
    60
}

/// Merge two TOML tables, with `overlay` values taking precedence.
fn merge_toml(base: &toml::Value, overlay: &toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(
                    k.clone(),
                    if let Some(base_v) = base_map.get(k) {
                        merge_toml(base_v, v)
                    } else {
                        v.clone()
                    },
                );
            }
            toml::Value::Table(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

impl TesterConfig {
    /// Load from an optional TOML file, apply `overrides` on top, and validate.
    ///
    /// `overrides` uses the file's layout (`[tester]` and `[job]` tables).
    pub fn load(path: Option<&Path>, overrides: &toml::Value) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
                toml::from_str::<toml::Value>(&content)
                    .map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            None => toml::Value::Table(toml::map::Map::new()),
        };

        let config: Self = merge_toml(&base, overrides)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the tester cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.job.cluster.is_supported() {
            return Err(ConfigError::UnsupportedCluster(self.job.cluster));
        }
        validate_job(&self.job)?;
        if self.tester.parallel_runs == 0 {
            return Err(ConfigError::Invalid("parallel_runs must be at least 1".into()));
        }
        if self.tester.max_concurrency == Some(0) {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".into()));
        }
        if self.tester.burst_size == 0 {
            return Err(ConfigError::Invalid("burst_size must be at least 1".into()));
        }
        if self.tester.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// Directory holding every run directory.
    #[must_use]
    pub fn output_folder(&self) -> PathBuf {
        self.tester
            .output_folder
            .as_ref()
            .map_or_else(|| PathBuf::from("./results"), PathBuf::from)
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.tester.query_timeout_secs)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.tester.command_timeout_secs)
    }

    /// Coordinator settings derived from `[tester]`.
    #[must_use]
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        let parallel_runs = self.tester.parallel_runs;
        CoordinatorSettings {
            parallel_runs,
            max_concurrency: self.tester.max_concurrency.unwrap_or(parallel_runs),
            stagger: StaggerPolicy {
                delay: Duration::from_secs(self.tester.stagger_secs),
                burst_size: self.tester.burst_size,
            },
            timing: PollTiming {
                poll_interval: Duration::from_secs(self.tester.poll_interval_secs),
                cancel_wait: Duration::from_secs(self.tester.cancel_wait_secs),
            },
            output_folder: self.output_folder(),
        }
    }
}

/// Checks on the job alone, shared by config loading and offline classification.
pub fn validate_job(job: &TestRunConfig) -> Result<(), ConfigError> {
    if job.nodes == 0 {
        return Err(ConfigError::Invalid("nodes must be at least 1".into()));
    }
    if job.gpu_per_node == 0 {
        return Err(ConfigError::Invalid("gpu_per_node must be at least 1".into()));
    }
    let thresholds = job.thresholds();
    if !(thresholds.tolerance >= 0.0) || !(thresholds.max_elapsed_secs >= 0.0) {
        return Err(ConfigError::Invalid(
            "tolerance and max_elapsed_secs must be non-negative".into(),
        ));
    }
    Ok(())
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("cluster kind '{0}' is not supported, only slurm is")]
    UnsupportedCluster(ClusterKind),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use gpu_tester_config::DiagnosticKind;
    use tempfile::tempdir;

    use super::*;

    fn no_overrides() -> toml::Value {
        toml::Value::Table(toml::map::Map::new())
    }

    fn parse_config(toml_str: &str, overrides: &toml::Value) -> Result<TesterConfig, ConfigError> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gpu_tester.toml");
        std::fs::write(&path, toml_str).unwrap();
        TesterConfig::load(Some(&path), overrides)
    }

    #[test]
    fn test_defaults_without_file() {
        let config = TesterConfig::load(None, &no_overrides()).unwrap();
        assert_eq!(config.tester.parallel_runs, 1);
        assert_eq!(config.job.cluster, ClusterKind::Slurm);
        assert_eq!(config.output_folder(), PathBuf::from("./results"));

        let settings = config.coordinator_settings();
        assert_eq!(settings.max_concurrency, 1);
        assert_eq!(settings.timing.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.timing.cancel_wait, Duration::from_secs(30));
        assert_eq!(config.query_timeout(), Duration::from_secs(10));
        assert_eq!(config.command_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(
            r#"
[tester]
parallel_runs = 6
max_concurrency = 3
stagger_secs = 20
burst_size = 2
granularity = "host"
output_folder = "/scratch/gpu"

[job]
partition = "gpu-large"
nodes = 4
gpu_per_node = 4
job_timeout_secs = 300
test_kind = "ddp"
exclude = "node-[7-9]"

[job.thresholds]
max_elapsed_secs = 8.0
"#,
            &no_overrides(),
        )
        .unwrap();

        assert_eq!(config.tester.granularity, ReportGranularity::Host);
        assert_eq!(config.job.partition, "gpu-large");
        assert_eq!(config.job.test_kind, DiagnosticKind::Ddp);
        assert_eq!(config.job.exclude.as_deref(), Some("node-[7-9]"));
        assert_eq!(config.job.thresholds().max_elapsed_secs, 8.0);

        let settings = config.coordinator_settings();
        assert_eq!(settings.parallel_runs, 6);
        assert_eq!(settings.max_concurrency, 3);
        assert_eq!(settings.stagger.offset(5), Duration::from_secs(40));
        assert_eq!(settings.output_folder, PathBuf::from("/scratch/gpu"));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let overrides: toml::Value = toml::from_str(
            r#"
[tester]
parallel_runs = 2

[job]
nodes = 8
"#,
        )
        .unwrap();
        let config = parse_config(
            r#"
[tester]
parallel_runs = 5
stagger_secs = 3

[job]
nodes = 2
partition = "p"
"#,
            &overrides,
        )
        .unwrap();

        assert_eq!(config.tester.parallel_runs, 2);
        assert_eq!(config.tester.stagger_secs, 3);
        assert_eq!(config.job.nodes, 8);
        assert_eq!(config.job.partition, "p");
    }

    #[test]
    fn test_unsupported_cluster_fails_fast() {
        let err = parse_config("[job]\ncluster = \"pbs\"\n", &no_overrides()).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedCluster(ClusterKind::Pbs)));
    }

    #[test]
    fn test_unknown_cluster_is_parse_error() {
        let err = parse_config("[job]\ncluster = \"kubernetes\"\n", &no_overrides()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let err = parse_config("[job]\nnodes = 0\n", &no_overrides()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_job_alone() {
        assert!(validate_job(&TestRunConfig::default()).is_ok());

        let no_gpus = TestRunConfig {
            gpu_per_node: 0,
            ..Default::default()
        };
        assert!(matches!(validate_job(&no_gpus), Err(ConfigError::Invalid(_))));

        let mut negative = TestRunConfig::default();
        negative.thresholds.tolerance = Some(-0.5);
        assert!(matches!(validate_job(&negative), Err(ConfigError::Invalid(_))));

        let mut negative = TestRunConfig::default();
        negative.thresholds.max_elapsed_secs = Some(-1.0);
        assert!(matches!(validate_job(&negative), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_negative_threshold_in_file_rejected() {
        let err = parse_config("[job.thresholds]\ntolerance = -0.1\n", &no_overrides()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = TesterConfig::load(Some(Path::new("/nonexistent/gpu_tester.toml")), &no_overrides())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }
}
