//! One diagnostic run: build, submit, poll, cancel on timeout, read, classify.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use gpu_tester_config::TestRunConfig;
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    classify::{RunVerdicts, classify},
    gateway::{GatewayError, JobId, JobStatus, SchedulerGateway},
    protocol::{parse, slots},
    sbatch,
};

/// File names inside a run directory.
const SCRIPT_FILE: &str = "sbatch_file";
const OUTPUT_FILE: &str = "sbatch_output";

/// Polling cadence of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    /// Delay between two status queries.
    pub poll_interval: Duration,
    /// How long to keep polling after a cancel before reading output anyway.
    pub cancel_wait: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            cancel_wait: Duration::from_secs(30),
        }
    }
}

/// Where a run keeps its script and captured output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub script: PathBuf,
    pub output: PathBuf,
}

impl RunPaths {
    /// Paths for run `index`, isolated from every other run.
    #[must_use]
    pub fn for_run(output_folder: &Path, index: usize) -> Self {
        let dir = output_folder.join(format!("run-{index}"));
        Self {
            script: dir.join(SCRIPT_FILE),
            output: dir.join(OUTPUT_FILE),
            dir,
        }
    }
}

/// Controller phase, published for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Waiting,
    Building,
    Submitted,
    Polling,
    Finished,
    TimedOutCancelling,
    Completed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Building => write!(f, "building"),
            Self::Submitted => write!(f, "submitted"),
            Self::Polling => write!(f, "polling"),
            Self::Finished => write!(f, "finished"),
            Self::TimedOutCancelling => write!(f, "cancelling"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Polling,
    /// Left the queue on its own.
    Finished,
    /// Cancel sent, but the job was still listed when the flush wait ran out.
    TimedOut,
    /// Cancel sent and the job left the queue.
    Cancelled,
}

/// A job known to the scheduler.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub output_path: PathBuf,
    pub state: JobState,
}

/// Result of a run that produced verdicts.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub index: usize,
    pub job: Job,
    pub verdicts: RunVerdicts,
}

enum WaitOutcome {
    Finished,
    TimedOut,
    Interrupted,
}

/// Drives a single run end to end.
pub struct TestRunController {
    index: usize,
    config: Arc<TestRunConfig>,
    paths: RunPaths,
    gateway: Arc<dyn SchedulerGateway>,
    timing: PollTiming,
    phase_tx: watch::Sender<RunPhase>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl TestRunController {
    #[must_use]
    pub fn new(
        index: usize,
        config: Arc<TestRunConfig>,
        paths: RunPaths,
        gateway: Arc<dyn SchedulerGateway>,
        timing: PollTiming,
    ) -> Self {
        let (phase_tx, _) = watch::channel(RunPhase::Waiting);
        Self {
            index,
            config,
            paths,
            gateway,
            timing,
            phase_tx,
            shutdown: None,
        }
    }

    /// Treat a `true` on this channel like a timeout: cancel our job and
    /// classify whatever output exists.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Subscribe to phase changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunPhase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&self, phase: RunPhase) {
        self.phase_tx.send_replace(phase);
    }

    /// Run to completion.
    pub async fn run(self) -> Result<CompletedRun, RunError> {
        self.set_phase(RunPhase::Building);
        self.prepare().await?;

        if self.shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
            return Err(RunError::NotStarted("interrupted before submit"));
        }
        let id = self.gateway.submit(&self.paths.script).await?;
        let mut job = Job {
            id,
            output_path: self.paths.output.clone(),
            state: JobState::Submitted,
        };
        self.set_phase(RunPhase::Submitted);
        tracing::info!("run {}: submitted job {}", self.index, job.id);

        job.state = JobState::Polling;
        self.set_phase(RunPhase::Polling);
        let deadline = Instant::now() + self.config.job_timeout();

        match self.wait_for_job(&job.id, deadline, self.shutdown.clone()).await {
            WaitOutcome::Finished => {
                job.state = JobState::Finished;
                self.set_phase(RunPhase::Finished);
                tracing::info!("run {}: job {} finished", self.index, job.id);
            }
            outcome => {
                self.set_phase(RunPhase::TimedOutCancelling);
                if matches!(outcome, WaitOutcome::Interrupted) {
                    tracing::warn!("run {}: interrupted, cancelling job {}", self.index, job.id);
                } else {
                    tracing::warn!(
                        "run {}: job {} still queued or running after {}s, cancelling",
                        self.index,
                        job.id,
                        self.config.job_timeout_secs
                    );
                }

                self.gateway.cancel(&job.id).await;

                let flush_deadline = Instant::now() + self.timing.cancel_wait;
                if matches!(
                    self.wait_for_job(&job.id, flush_deadline, None).await,
                    WaitOutcome::Finished
                ) {
                    job.state = JobState::Cancelled;
                    tracing::info!("run {}: job {} cancelled", self.index, job.id);
                } else {
                    job.state = JobState::TimedOut;
                    tracing::warn!(
                        "run {}: job {} still listed {:?} after cancel, reading output anyway",
                        self.index,
                        job.id,
                        self.timing.cancel_wait
                    );
                }
            }
        }

        let text = tokio::fs::read_to_string(&job.output_path)
            .await
            .map_err(|e| RunError::OutputRead(job.output_path.clone(), e))?;
        let verdicts = evaluate_output(&text, &self.config)?;

        self.set_phase(RunPhase::Completed);
        tracing::info!(
            "run {}: classified {} slots from job {}",
            self.index,
            verdicts.len(),
            job.id
        );

        Ok(CompletedRun {
            index: self.index,
            job,
            verdicts,
        })
    }

    /// Create the run directory and write the launch script.
    async fn prepare(&self) -> Result<(), RunError> {
        tokio::fs::create_dir_all(&self.paths.dir)
            .await
            .map_err(|e| RunError::Prepare(self.paths.dir.clone(), e))?;

        // Stale output from an earlier invocation must not be classified as ours.
        match tokio::fs::remove_file(&self.paths.output).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RunError::Prepare(self.paths.output.clone(), e)),
        }

        let script = sbatch::render(&self.config, &self.paths.output);
        tokio::fs::write(&self.paths.script, script)
            .await
            .map_err(|e| RunError::Prepare(self.paths.script.clone(), e))
    }

    /// Poll until the job is gone, `deadline` passes or shutdown is requested.
    async fn wait_for_job(
        &self,
        job: &JobId,
        deadline: Instant,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> WaitOutcome {
        let poll = async {
            let mut ticker = tokio::time::interval_at(
                Instant::now() + self.timing.poll_interval,
                self.timing.poll_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if self.gateway.query_status(job).await == JobStatus::Finished {
                    return;
                }
            }
        };

        tokio::select! {
            polled = tokio::time::timeout_at(deadline, poll) => {
                if polled.is_ok() { WaitOutcome::Finished } else { WaitOutcome::TimedOut }
            }
            () = interrupted(shutdown) => WaitOutcome::Interrupted,
        }
    }
}

/// Resolves once shutdown is requested; never if there is no channel or the
/// sender went away without requesting it.
pub(crate) async fn interrupted(shutdown: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = shutdown
        && rx.wait_for(|stop| *stop).await.is_ok()
    {
        return;
    }
    std::future::pending::<()>().await;
}

/// Parse and classify captured output against a run's configuration.
pub fn evaluate_output(text: &str, config: &TestRunConfig) -> Result<RunVerdicts, RunError> {
    let parsed = parse(text);
    let hosts = parsed.hosts.ok_or(RunError::MalformedOutput)?;
    if parsed.result_lines == 0 {
        return Err(RunError::NoResults);
    }
    let universe = slots(&hosts, config.gpu_per_node);
    Ok(classify(&universe, &parsed.records, &config.thresholds()))
}

/// Fatal errors of a single run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to prepare {0}: {1}")]
    Prepare(PathBuf, std::io::Error),
    #[error(transparent)]
    Submission(#[from] GatewayError),
    #[error("failed to read job output {0}: {1}")]
    OutputRead(PathBuf, std::io::Error),
    #[error("job output has no hosts line, the diagnostic never reported its allocation")]
    MalformedOutput,
    #[error("job output has no result lines, no diagnostic ran to completion")]
    NoResults,
    #[error("run did not start: {0}")]
    NotStarted(&'static str),
}
