//! Concurrent, staggered test runs and their merged report.

use std::{path::PathBuf, sync::Arc, time::Duration};

use gpu_tester_config::TestRunConfig;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};

use crate::{
    controller::{CompletedRun, PollTiming, RunError, RunPaths, TestRunController, interrupted},
    gateway::SchedulerGateway,
    report::{AggregateReport, now_timestamp},
};

/// Start-delay policy for a batch of runs.
///
/// Runs are released in bursts of `burst_size`; each burst starts `delay`
/// after the previous one so the scheduler never sees every submission at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaggerPolicy {
    pub delay: Duration,
    pub burst_size: usize,
}

impl Default for StaggerPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            burst_size: 4,
        }
    }
}

impl StaggerPolicy {
    /// Start offset of run `index`: `delay × (index div burst_size)`.
    #[must_use]
    pub fn offset(&self, index: usize) -> Duration {
        let burst = index / self.burst_size.max(1);
        self.delay
            .saturating_mul(u32::try_from(burst).unwrap_or(u32::MAX))
    }
}

/// Coordinator-level settings.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Number of independent runs.
    pub parallel_runs: usize,
    /// Runs allowed in flight at once.
    pub max_concurrency: usize,
    pub stagger: StaggerPolicy,
    pub timing: PollTiming,
    /// Parent of every `run-<i>` directory.
    pub output_folder: PathBuf,
}

impl CoordinatorSettings {
    #[must_use]
    pub fn new(output_folder: impl Into<PathBuf>) -> Self {
        Self {
            parallel_runs: 1,
            max_concurrency: 1,
            stagger: StaggerPolicy::default(),
            timing: PollTiming::default(),
            output_folder: output_folder.into(),
        }
    }
}

/// Completion notice sent by a run task.
struct Completion {
    index: usize,
    started_at: Option<String>,
    result: Result<CompletedRun, RunError>,
}

/// Runs several controllers concurrently and merges their verdicts.
pub struct Coordinator {
    settings: CoordinatorSettings,
    config: Arc<TestRunConfig>,
    gateway: Arc<dyn SchedulerGateway>,
    multi: MultiProgress,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        settings: CoordinatorSettings,
        config: TestRunConfig,
        gateway: Arc<dyn SchedulerGateway>,
    ) -> Self {
        Self {
            settings,
            config: Arc::new(config),
            gateway,
            multi: MultiProgress::new(),
            shutdown: None,
        }
    }

    /// Forward an operator interrupt to every run.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Draw progress on this `MultiProgress` instead of a private one.
    #[must_use]
    pub fn with_progress(mut self, multi: MultiProgress) -> Self {
        self.multi = multi;
        self
    }

    /// Run every test run and return the merged report.
    ///
    /// A failing run never stops its siblings; it is recorded as unaccounted.
    pub async fn run(&self) -> AggregateReport {
        let total = self.settings.parallel_runs;
        let workers = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();

        tracing::info!(
            "Starting {} runs ({} at a time, {:?} between bursts of {})",
            total,
            self.settings.max_concurrency,
            self.settings.stagger.delay,
            self.settings.stagger.burst_size
        );

        for index in 0..total {
            let pb = self.multi.add(ProgressBar::new_spinner());
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.set_message(format!("run {index:3}: waiting"));
            pb.enable_steady_tick(Duration::from_millis(100));

            let offset = self.settings.stagger.offset(index);
            let controller = {
                let controller = TestRunController::new(
                    index,
                    Arc::clone(&self.config),
                    RunPaths::for_run(&self.settings.output_folder, index),
                    Arc::clone(&self.gateway),
                    self.settings.timing,
                );
                match self.shutdown.clone() {
                    Some(rx) => controller.with_shutdown(rx),
                    None => controller,
                }
            };

            // Task to mirror controller phases on the spinner
            let mut phase_rx = controller.subscribe();
            let pb_phase = pb.clone();
            tokio::spawn(async move {
                while phase_rx.changed().await.is_ok() {
                    let phase = *phase_rx.borrow();
                    pb_phase.set_message(format!("run {index:3}: {phase}"));
                }
            });

            let workers = Arc::clone(&workers);
            let shutdown = self.shutdown.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let completion = match wait_for_turn(offset, workers, shutdown).await {
                    Ok(_permit) => {
                        let started_at = Some(now_timestamp());
                        let result = controller.run().await;
                        Completion {
                            index,
                            started_at,
                            result,
                        }
                    }
                    Err(e) => Completion {
                        index,
                        started_at: None,
                        result: Err(e),
                    },
                };

                pb.finish_with_message(format!(
                    "run {index:3}: {}",
                    if completion.result.is_ok() {
                        "completed"
                    } else {
                        "failed"
                    }
                ));
                let _ = tx.send(completion);
            });
        }
        drop(tx);

        // Single writer: completions are merged one at a time, in arrival order
        let mut report = AggregateReport::new();
        while let Some(completion) = rx.recv().await {
            match completion.result {
                Ok(run) => {
                    tracing::info!(
                        "run {} completed: {} slots from job {}",
                        completion.index,
                        run.verdicts.len(),
                        run.job.id
                    );
                    report.record_completed(
                        completion.index,
                        run.job.id.0,
                        run.verdicts,
                        completion.started_at,
                    );
                }
                Err(e) => {
                    tracing::error!("run {} failed: {}", completion.index, e);
                    report.record_failed(completion.index, e.to_string(), completion.started_at);
                }
            }
        }

        // A task that panicked never reported back.
        for index in 0..total {
            if !report.has_run(index) {
                tracing::error!("run {index} ended without reporting a result");
                report.record_failed(index, "run task ended without a result", None);
            }
        }

        report
    }
}

/// Sleep out the stagger offset, then take a pool slot. An interrupt during
/// either wait means the run never submits.
async fn wait_for_turn(
    offset: Duration,
    workers: Arc<Semaphore>,
    shutdown: Option<watch::Receiver<bool>>,
) -> Result<OwnedSemaphorePermit, RunError> {
    const INTERRUPTED: RunError = RunError::NotStarted("interrupted before start");

    tokio::select! {
        () = tokio::time::sleep(offset) => {}
        () = interrupted(shutdown.clone()) => return Err(INTERRUPTED),
    }

    let permit = tokio::select! {
        permit = workers.acquire_owned() => {
            permit.map_err(|_| RunError::NotStarted("worker pool closed"))?
        }
        () = interrupted(shutdown.clone()) => return Err(INTERRUPTED),
    };

    // Both branches can be ready in the same poll
    if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
        return Err(INTERRUPTED);
    }
    Ok(permit)
}
