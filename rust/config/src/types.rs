//! Cluster, diagnostic and reporting enums.

use serde::{Deserialize, Serialize};

/// Batch scheduler flavour the tester talks to.
///
/// Only Slurm is driven today; the other variants exist so that a config
/// naming them is rejected with a clear error instead of a parse failure.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    #[default]
    Slurm,
    Pbs,
    Lsf,
}

impl ClusterKind {
    /// Whether a scheduler gateway exists for this cluster kind.
    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Slurm)
    }
}

impl std::fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slurm => write!(f, "slurm"),
            Self::Pbs => write!(f, "pbs"),
            Self::Lsf => write!(f, "lsf"),
        }
    }
}

impl std::str::FromStr for ClusterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slurm" => Ok(Self::Slurm),
            "pbs" => Ok(Self::Pbs),
            "lsf" => Ok(Self::Lsf),
            _ => Err(format!("unknown cluster kind '{s}'. Use: slurm, pbs, lsf")),
        }
    }
}

/// Which diagnostic worker runs on every accelerator.
///
/// Selects both the worker module launched by the batch script and the
/// default thresholds its output is judged against.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    /// Seeded matrix product on a single device.
    #[default]
    SimpleForward,
    /// Short data-parallel training loop across every slot of the allocation.
    Ddp,
    /// Device bring-up probe; the printed value is informational only.
    Probe,
}

impl DiagnosticKind {
    /// Python module name of the worker, relative to the `gpu_tester` package.
    #[must_use]
    pub fn worker_module(self) -> &'static str {
        match self {
            Self::SimpleForward => "simple_forward_worker",
            Self::Ddp => "ddp_worker",
            Self::Probe => "worker",
        }
    }

    /// Thresholds the worker's output is classified against when the
    /// configuration does not override them.
    #[must_use]
    pub fn default_thresholds(self) -> Thresholds {
        match self {
            Self::SimpleForward => Thresholds {
                expected_value: Some(24954.1),
                tolerance: DEFAULT_TOLERANCE,
                max_elapsed_secs: 5.0,
            },
            Self::Ddp => Thresholds {
                expected_value: Some(1.328_598_7),
                tolerance: DEFAULT_TOLERANCE,
                max_elapsed_secs: 5.0,
            },
            Self::Probe => Thresholds {
                expected_value: None,
                tolerance: DEFAULT_TOLERANCE,
                max_elapsed_secs: 5.0,
            },
        }
    }
}

impl std::fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SimpleForward => write!(f, "simple-forward"),
            Self::Ddp => write!(f, "ddp"),
            Self::Probe => write!(f, "probe"),
        }
    }
}

impl std::str::FromStr for DiagnosticKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple-forward" | "simple_forward" | "forward" => Ok(Self::SimpleForward),
            "ddp" => Ok(Self::Ddp),
            "probe" | "worker" => Ok(Self::Probe),
            _ => Err(format!(
                "unknown diagnostic kind '{s}'. Use: simple-forward, ddp, probe"
            )),
        }
    }
}

/// Absolute tolerance applied to the expected value unless overridden.
pub const DEFAULT_TOLERANCE: f64 = 0.01;

/// Classification thresholds for one diagnostic kind.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    /// Value every healthy accelerator must report. `None` means the value is
    /// not checked.
    pub expected_value: Option<f64>,
    /// Allowed absolute distance from `expected_value`.
    pub tolerance: f64,
    /// Longest acceptable elapsed time in seconds.
    pub max_elapsed_secs: f64,
}

/// Granularity of the aggregate report.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum ReportGranularity {
    /// One verdict per accelerator slot.
    #[default]
    Slot,
    /// One verdict per host: the worst verdict among its slots.
    Host,
}

impl std::fmt::Display for ReportGranularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slot => write!(f, "slot"),
            Self::Host => write!(f, "host"),
        }
    }
}

impl std::str::FromStr for ReportGranularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slot" | "gpu" => Ok(Self::Slot),
            "host" | "node" => Ok(Self::Host),
            _ => Err(format!("unknown report granularity '{s}'. Use: slot, host")),
        }
    }
}
