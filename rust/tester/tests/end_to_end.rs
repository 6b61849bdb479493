//! End-to-end tests: config file to printed report, against a fake scheduler.

mod common;

use std::sync::Arc;

use common::{FakeGateway, JobPlan};
use gpu_tester::{
    classify::VerdictKind, config::TesterConfig, coordinator::Coordinator, report::AggregateReport,
};
use gpu_tester_config::ReportGranularity;
use indicatif::{MultiProgress, ProgressDrawTarget};
use tempfile::tempdir;

/// Load a config for `parallel_runs` jobs writing under `dir`, with no stagger.
fn load_config(dir: &std::path::Path, job_toml: &str, parallel_runs: usize) -> TesterConfig {
    let path = dir.join("gpu_tester.toml");
    std::fs::write(
        &path,
        format!(
            "[tester]\nparallel_runs = {parallel_runs}\nstagger_secs = 0\noutput_folder = \"{}\"\n\n{job_toml}",
            dir.join("results").display()
        ),
    )
    .unwrap();
    TesterConfig::load(Some(&path), &toml::Value::Table(toml::map::Map::new())).unwrap()
}

async fn run(config: &TesterConfig, gateway: FakeGateway) -> AggregateReport {
    Coordinator::new(
        config.coordinator_settings(),
        config.job.clone(),
        Arc::new(gateway),
    )
    .with_progress(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()))
    .run()
    .await
}

#[tokio::test(start_paused = true)]
async fn test_silent_host_is_no_answer() {
    let dir = tempdir().unwrap();
    let config = load_config(dir.path(), "[job]\ngpu_per_node = 2\nnodes = 2\n", 1);
    let gateway = FakeGateway::new().with_plan(
        "run-0",
        JobPlan::finishes(
            "hosts node-1 node-2\n\
             go\n\
             result node-1 0 24954.1 0.5\n\
             result node-1 1 24954.105 0.7\n",
            2,
        ),
    );

    let report = run(&config, gateway).await;
    let summary = report.summary(ReportGranularity::Slot);

    assert_eq!(summary.count(VerdictKind::Success), 2);
    assert_eq!(summary.count(VerdictKind::NoAnswer), 2);
    assert_eq!(summary.targets(VerdictKind::NoAnswer), vec!["node-2 0", "node-2 1"]);

    let hosts = report.summary(ReportGranularity::Host);
    assert_eq!(hosts.targets(VerdictKind::NoAnswer), vec!["node-2"]);
    assert_eq!(hosts.count(VerdictKind::Success), 1);
}

#[tokio::test(start_paused = true)]
async fn test_gpu_error_is_not_no_answer() {
    let dir = tempdir().unwrap();
    let config = load_config(dir.path(), "[job]\ngpu_per_node = 2\n", 1);
    let gateway = FakeGateway::new().with_plan(
        "run-0",
        JobPlan::finishes(
            "hosts node-3\nresult node-3 0 24954.1 0.5\ngpu_error node-3 1\n",
            1,
        ),
    );

    let summary = run(&config, gateway).await.summary(ReportGranularity::Slot);

    assert_eq!(summary.targets(VerdictKind::AcceleratorError), vec!["node-3 1"]);
    assert_eq!(summary.count(VerdictKind::NoAnswer), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_and_slow_results() {
    let dir = tempdir().unwrap();
    let config = load_config(dir.path(), "[job]\ngpu_per_node = 1\n", 2);
    let gateway = FakeGateway::new()
        .with_plan("run-0", JobPlan::finishes("hosts node-4\nresult node-4 0 24955.2 3.0\n", 1))
        .with_plan("run-1", JobPlan::finishes("hosts node-5\nresult node-5 0 24954.1 6.0\n", 1));

    let summary = run(&config, gateway).await.summary(ReportGranularity::Slot);

    assert_eq!(summary.targets(VerdictKind::Wrong), vec!["node-4 0"]);
    assert_eq!(summary.targets(VerdictKind::Slow), vec!["node-5 0"]);
    assert_eq!(summary.members[&VerdictKind::Wrong][0].detail.as_deref(), Some("24955.2"));

    let text = summary.to_string();
    assert!(text.contains("incorrect results:\n  node-4 0 (24955.2)\n"));
    assert!(text.contains("slow results:\n  node-5 0 (6s)\n"));
}

#[tokio::test(start_paused = true)]
async fn test_ddp_thresholds_and_overrides() {
    let dir = tempdir().unwrap();
    let config = load_config(
        dir.path(),
        "[job]\ngpu_per_node = 2\ntest_kind = \"ddp\"\n\n[job.thresholds]\nmax_elapsed_secs = 1.0\n",
        1,
    );
    let gateway = FakeGateway::new().with_plan(
        "run-0",
        JobPlan::finishes(
            "hosts node-6\nresult node-6 0 1.3285987 0.5\nresult node-6 1 1.3285987 2.5\n",
            1,
        ),
    );

    let summary = run(&config, gateway).await.summary(ReportGranularity::Slot);

    assert_eq!(summary.count(VerdictKind::Success), 1);
    assert_eq!(summary.targets(VerdictKind::Slow), vec!["node-6 1"]);

    let script =
        std::fs::read_to_string(dir.path().join("results/run-0/sbatch_file")).unwrap();
    assert!(script.contains("python -m gpu_tester.ddp_worker"));
}
