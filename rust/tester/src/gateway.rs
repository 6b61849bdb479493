//! Batch scheduler access.
//!
//! The tester only needs three primitives from the scheduler: submit a
//! script, ask whether a job is still around, and cancel it. Each call is a
//! self-contained CLI invocation, so a gateway can be shared freely between
//! concurrent runs.

use std::{path::Path, process::Output, sync::Arc, time::Duration};

use async_trait::async_trait;
use gpu_tester_config::ClusterKind;
use tokio::process::Command;

/// Marker line printed by `sbatch` on success.
const SUBMITTED_MARKER: &str = "Submitted batch job";

/// Printed by `squeue -j` once the job has left the controller's memory.
const INVALID_JOB_SENTINEL: &str = "invalid job id specified";

/// Default bound on a single status query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on `sbatch` and `scancel`.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Scheduler-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse job state as seen by the tester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Finished,
}

/// Scheduler operations used by a test run.
#[async_trait]
pub trait SchedulerGateway: Send + Sync {
    /// Submit a batch script and return the new job's id.
    async fn submit(&self, script: &Path) -> Result<JobId, GatewayError>;

    /// Query a job. Query failures must be reported as `Running`, never as
    /// `Finished`, so a flaky scheduler cannot end a run early.
    async fn query_status(&self, job: &JobId) -> JobStatus;

    /// Best-effort cancellation. Failures are logged by the implementation.
    async fn cancel(&self, job: &JobId);
}

/// Slurm gateway driving `sbatch`, `squeue` and `scancel`.
#[derive(Debug, Clone)]
pub struct SlurmGateway {
    sbatch: String,
    squeue: String,
    scancel: String,
    query_timeout: Duration,
    command_timeout: Duration,
}

impl Default for SlurmGateway {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            scancel: "scancel".to_string(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl SlurmGateway {
    /// Create a gateway using the Slurm binaries found on `PATH`.
    #[must_use]
    pub fn new(query_timeout: Duration) -> Self {
        Self {
            query_timeout,
            ..Self::default()
        }
    }

    /// Bound `sbatch` and `scancel` by `timeout` instead of the default.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Override the binaries, e.g. to go through a wrapper script.
    #[must_use]
    pub fn with_binaries(
        mut self,
        sbatch: impl Into<String>,
        squeue: impl Into<String>,
        scancel: impl Into<String>,
    ) -> Self {
        self.sbatch = sbatch.into();
        self.squeue = squeue.into();
        self.scancel = scancel.into();
        self
    }
}

#[async_trait]
impl SchedulerGateway for SlurmGateway {
    async fn submit(&self, script: &Path) -> Result<JobId, GatewayError> {
        tracing::debug!("Running: {} {}", self.sbatch, script.display());

        let submit = Command::new(&self.sbatch)
            .arg(script)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.command_timeout, submit).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(GatewayError::Submission {
                    output: format!("failed to run {}: {e}", self.sbatch),
                });
            }
            Err(_) => {
                return Err(GatewayError::Submission {
                    output: format!(
                        "{} did not answer within {:?}",
                        self.sbatch, self.command_timeout
                    ),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_submitted_job_id(&stdout).ok_or_else(|| GatewayError::Submission {
            output: combined_output(&output),
        })
    }

    async fn query_status(&self, job: &JobId) -> JobStatus {
        let query = Command::new(&self.squeue)
            .args(["-j", &job.0])
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.query_timeout, query).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!("{} -j {job} failed to run: {e}", self.squeue);
                return JobStatus::Running;
            }
            Err(_) => {
                tracing::warn!(
                    "{} -j {job} did not answer within {:?}",
                    self.squeue,
                    self.query_timeout
                );
                return JobStatus::Running;
            }
        };

        let text = combined_output(&output);
        tracing::debug!("job {job} status: {}", text.trim());

        if is_invalid_job_response(&text) {
            return JobStatus::Finished;
        }
        if !output.status.success() {
            tracing::warn!(
                "{} -j {job} exited with {:?}: {}",
                self.squeue,
                output.status.code(),
                text.trim()
            );
            return JobStatus::Running;
        }
        if squeue_table_is_empty(&String::from_utf8_lossy(&output.stdout)) {
            JobStatus::Finished
        } else {
            JobStatus::Running
        }
    }

    async fn cancel(&self, job: &JobId) {
        tracing::info!("Cancelling job {job}");
        let cancel = Command::new(&self.scancel)
            .arg(&job.0)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.command_timeout, cancel).await {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => tracing::warn!(
                "{} {job} exited with {:?}: {}",
                self.scancel,
                output.status.code(),
                combined_output(&output).trim()
            ),
            Ok(Err(e)) => tracing::warn!("{} {job} failed to run: {e}", self.scancel),
            Err(_) => tracing::warn!(
                "{} {job} did not answer within {:?}",
                self.scancel,
                self.command_timeout
            ),
        }
    }
}

/// Build the gateway for a cluster kind.
pub fn create_gateway(
    cluster: ClusterKind,
    query_timeout: Duration,
    command_timeout: Duration,
) -> Result<Arc<dyn SchedulerGateway>, GatewayError> {
    match cluster {
        ClusterKind::Slurm => Ok(Arc::new(
            SlurmGateway::new(query_timeout).with_command_timeout(command_timeout),
        )),
        other => Err(GatewayError::UnsupportedCluster(other)),
    }
}

/// Extract the job id from `sbatch` output: the 4th token of the
/// `Submitted batch job <id>` line.
#[must_use]
pub fn parse_submitted_job_id(output: &str) -> Option<JobId> {
    output
        .lines()
        .find(|line| line.contains(SUBMITTED_MARKER))
        .and_then(|line| line.split_whitespace().nth(3))
        .map(|id| JobId(id.to_string()))
}

/// Whether `squeue` says the job id is unknown, i.e. the job is long gone.
#[must_use]
pub fn is_invalid_job_response(output: &str) -> bool {
    output.to_lowercase().contains(INVALID_JOB_SENTINEL)
}

/// Whether an `squeue -j` table holds its header and nothing else. A reply
/// without even the header says nothing about the job.
#[must_use]
pub fn squeue_table_is_empty(output: &str) -> bool {
    output.lines().filter(|l| !l.trim().is_empty()).count() == 1
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text
}

/// Errors surfaced by a scheduler gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("job submission failed: {output}")]
    Submission { output: String },
    #[error("no scheduler gateway for cluster kind '{0}'")]
    UnsupportedCluster(ClusterKind),
}
