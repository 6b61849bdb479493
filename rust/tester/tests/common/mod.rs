//! In-memory scheduler used by the integration tests.
//!
//! Jobs are keyed by their run directory name (`run-0`, `run-1`, ...), read
//! from the submitted script's location. Output is written as soon as a job is
//! submitted, the way a running job streams into its output file.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use gpu_tester::{
    controller::PollTiming,
    gateway::{GatewayError, JobId, JobStatus, SchedulerGateway},
};
use tokio::time::Instant;

/// How a fake job behaves.
#[derive(Debug, Clone, Default)]
pub struct JobPlan {
    /// Written to the job's output file on submit. `None` leaves no file.
    pub output: Option<String>,
    /// Status queries before the job leaves the queue. `None` never leaves.
    pub finish_after: Option<usize>,
    /// Fail the submission.
    pub reject: bool,
    /// Leave the queue on the first query after a cancel.
    pub finish_on_cancel: bool,
}

impl JobPlan {
    pub fn finishes(output: &str, polls: usize) -> Self {
        Self {
            output: Some(output.to_string()),
            finish_after: Some(polls),
            ..Self::default()
        }
    }

    pub fn hangs(output: &str) -> Self {
        Self {
            output: Some(output.to_string()),
            ..Self::default()
        }
    }

    pub fn rejected() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn without_output(polls: usize) -> Self {
        Self {
            finish_after: Some(polls),
            ..Self::default()
        }
    }

    pub fn finish_on_cancel(mut self) -> Self {
        self.finish_on_cancel = true;
        self
    }
}

struct FakeJob {
    run: String,
    plan: JobPlan,
    polls: usize,
    cancelled: bool,
    finished: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    jobs: HashMap<String, FakeJob>,
    submits: Vec<(String, Instant)>,
    queries: usize,
    cancels: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
}

#[derive(Default)]
pub struct FakeGateway {
    plans: HashMap<String, JobPlan>,
    state: Mutex<State>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, run: &str, plan: JobPlan) -> Self {
        self.plans.insert(run.to_string(), plan);
        self
    }

    /// Runs in submission order, with the time each was submitted.
    pub fn submits(&self) -> Vec<(String, Instant)> {
        self.state.lock().unwrap().submits.clone()
    }

    pub fn submit_time(&self, run: &str) -> Option<Instant> {
        self.submits()
            .into_iter()
            .find(|(r, _)| r == run)
            .map(|(_, at)| at)
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().unwrap().queries
    }

    /// Runs whose job was cancelled, once per cancel call.
    pub fn cancels(&self) -> Vec<String> {
        self.state.lock().unwrap().cancels.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }
}

fn run_name(script: &Path) -> String {
    script
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn output_path(script: &Path) -> PathBuf {
    let text = std::fs::read_to_string(script).unwrap();
    text.lines()
        .find_map(|line| line.strip_prefix("#SBATCH --output="))
        .map(PathBuf::from)
        .unwrap()
}

#[async_trait]
impl SchedulerGateway for FakeGateway {
    async fn submit(&self, script: &Path) -> Result<JobId, GatewayError> {
        let run = run_name(script);
        let output = output_path(script);
        let plan = self.plans.get(&run).cloned().unwrap_or_default();

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.submits.push((run.clone(), Instant::now()));
        if plan.reject {
            return Err(GatewayError::Submission {
                output: "sbatch: error: Batch job submission failed: Invalid account".to_string(),
            });
        }
        if let Some(ref text) = plan.output {
            std::fs::write(&output, text).unwrap();
        }

        state.next_id += 1;
        let id = format!("{}", 1000 + state.next_id);
        state.jobs.insert(
            id.clone(),
            FakeJob {
                run,
                plan,
                polls: 0,
                cancelled: false,
                finished: false,
            },
        );
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        Ok(JobId(id))
    }

    async fn query_status(&self, job: &JobId) -> JobStatus {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.queries += 1;

        let Some(fake) = state.jobs.get_mut(&job.0) else {
            return JobStatus::Finished;
        };
        if fake.finished {
            return JobStatus::Finished;
        }
        fake.polls += 1;
        let done = (fake.cancelled && fake.plan.finish_on_cancel)
            || fake.plan.finish_after.is_some_and(|n| fake.polls >= n);
        if done {
            fake.finished = true;
            state.in_flight -= 1;
            JobStatus::Finished
        } else {
            JobStatus::Running
        }
    }

    async fn cancel(&self, job: &JobId) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if let Some(fake) = state.jobs.get_mut(&job.0) {
            fake.cancelled = true;
            state.cancels.push(fake.run.clone());
        }
    }
}

/// Job settings for a fake cluster with `gpu_per_node` accelerators.
pub fn job_config(gpu_per_node: u32, job_timeout_secs: u64) -> gpu_tester_config::TestRunConfig {
    gpu_tester_config::TestRunConfig {
        gpu_per_node,
        job_timeout_secs,
        ..Default::default()
    }
}

pub fn timing() -> PollTiming {
    PollTiming {
        poll_interval: Duration::from_secs(1),
        cancel_wait: Duration::from_secs(5),
    }
}
