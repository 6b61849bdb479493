//! GPU Tester CLI
//!
//! Submits diagnostic jobs across the cluster, waits for them (cancelling
//! stragglers) and prints which accelerators are unhealthy.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use gpu_tester::{
    config::{TesterConfig, validate_job},
    controller::{RunPaths, evaluate_output},
    coordinator::Coordinator,
    gateway::create_gateway,
    report::AggregateReport,
    sbatch,
};
use gpu_tester_config::{ClusterKind, DiagnosticKind, ReportGranularity, TestRunConfig};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "gpu_tester.toml";

#[derive(Parser)]
#[command(name = "gpu-tester", about = "Find unhealthy GPUs on a batch cluster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit the diagnostic job(s) and report every accelerator's health
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the batch script run 0 would submit, without submitting it
    Render {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Classify an already captured job output file
    Classify {
        /// Path to the captured output (`sbatch_output`)
        output: PathBuf,

        /// Accelerators per node
        #[arg(long, default_value = "8")]
        gpu_per_node: u32,

        /// Diagnostic that produced the output
        #[arg(long, value_enum, default_value = "simple-forward")]
        test_kind: DiagnosticKind,

        /// Override the expected value
        #[arg(long)]
        expected_value: Option<f64>,

        /// Override the tolerance around the expected value
        #[arg(long)]
        tolerance: Option<f64>,

        /// Override the maximum elapsed time in seconds
        #[arg(long)]
        max_elapsed: Option<f64>,

        #[arg(long, value_enum, default_value = "slot")]
        granularity: ReportGranularity,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Options shared by `run` and `render`. Each one overrides the config file.
#[derive(Args)]
struct JobArgs {
    /// Path to the TOML config file (default: ./gpu_tester.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    cluster: Option<ClusterKind>,

    #[arg(long)]
    job_name: Option<String>,

    #[arg(long)]
    partition: Option<String>,

    /// Accelerators per node
    #[arg(long)]
    gpu_per_node: Option<u32>,

    #[arg(long)]
    nodes: Option<u32>,

    /// Seconds before an unfinished job is cancelled
    #[arg(long)]
    job_timeout: Option<u64>,

    #[arg(long)]
    job_comment: Option<String>,

    #[arg(long)]
    account: Option<String>,

    /// Only use these nodes (scheduler hostlist)
    #[arg(long)]
    nodelist: Option<String>,

    /// Avoid these nodes (scheduler hostlist)
    #[arg(long)]
    exclude: Option<String>,

    #[arg(long, value_enum)]
    test_kind: Option<DiagnosticKind>,

    /// Virtualenv to activate in the job (default: $VIRTUAL_ENV)
    #[arg(long)]
    venv: Option<String>,

    /// Directory for run scripts and outputs
    #[arg(short, long)]
    output_folder: Option<String>,

    /// Number of jobs to submit
    #[arg(long)]
    parallel_runs: Option<usize>,

    /// Jobs allowed in flight at once
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Seconds between submission bursts
    #[arg(long)]
    stagger: Option<u64>,

    /// Submissions per burst
    #[arg(long)]
    burst_size: Option<usize>,

    #[arg(long, value_enum)]
    granularity: Option<ReportGranularity>,
}

fn insert<T: Into<toml::Value>>(
    table: &mut toml::map::Map<String, toml::Value>,
    key: &str,
    value: Option<T>,
) {
    if let Some(value) = value {
        table.insert(key.to_string(), value.into());
    }
}

fn to_i64<T: TryInto<i64>>(value: Option<T>) -> Option<i64> {
    value.and_then(|v| v.try_into().ok())
}

impl JobArgs {
    /// Command-line values laid out like the config file.
    fn overrides(&self) -> toml::Value {
        let mut job = toml::map::Map::new();
        insert(&mut job, "cluster", self.cluster.map(|c| c.to_string()));
        insert(&mut job, "job_name", self.job_name.clone());
        insert(&mut job, "partition", self.partition.clone());
        insert(&mut job, "gpu_per_node", self.gpu_per_node.map(i64::from));
        insert(&mut job, "nodes", self.nodes.map(i64::from));
        insert(&mut job, "job_timeout_secs", to_i64(self.job_timeout));
        insert(&mut job, "job_comment", self.job_comment.clone());
        insert(&mut job, "account", self.account.clone());
        insert(&mut job, "nodelist", self.nodelist.clone());
        insert(&mut job, "exclude", self.exclude.clone());
        insert(&mut job, "test_kind", self.test_kind.map(|k| k.to_string()));
        insert(&mut job, "venv", self.venv.clone());

        let mut tester = toml::map::Map::new();
        insert(&mut tester, "output_folder", self.output_folder.clone());
        insert(&mut tester, "parallel_runs", to_i64(self.parallel_runs));
        insert(&mut tester, "max_concurrency", to_i64(self.max_concurrency));
        insert(&mut tester, "stagger_secs", to_i64(self.stagger));
        insert(&mut tester, "burst_size", to_i64(self.burst_size));
        insert(&mut tester, "granularity", self.granularity.map(|g| g.to_string()));

        let mut root = toml::map::Map::new();
        root.insert("job".into(), toml::Value::Table(job));
        root.insert("tester".into(), toml::Value::Table(tester));
        toml::Value::Table(root)
    }

    fn load(&self) -> Result<TesterConfig, Box<dyn std::error::Error>> {
        let path = self
            .config
            .clone()
            .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG)).filter(|p| p.exists()));
        let mut config = TesterConfig::load(path.as_deref(), &self.overrides())?;
        if config.job.venv.is_none() {
            config.job.venv = std::env::var("VIRTUAL_ENV").ok();
        }
        Ok(config)
    }
}

fn print_report(
    report: &AggregateReport,
    granularity: ReportGranularity,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let summary = report.summary(granularity);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!();
        println!("=== GPU Tester Report ===");
        print!("{summary}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { job, json } => {
            let config = job.load()?;
            let gateway = create_gateway(
                config.job.cluster,
                config.query_timeout(),
                config.command_timeout(),
            )?;
            let settings = config.coordinator_settings();
            std::fs::create_dir_all(&settings.output_folder)?;

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling submitted jobs");
                    let _ = shutdown_tx.send(true);
                }
            });

            let total = settings.parallel_runs;
            let coordinator =
                Coordinator::new(settings, config.job.clone(), gateway).with_shutdown(shutdown_rx);
            let report = coordinator.run().await;

            print_report(&report, config.tester.granularity, json)?;

            let failed = report.failed_runs().count();
            if failed > 0 {
                return Err(format!("{failed} of {total} runs failed").into());
            }
        }

        Commands::Render { job } => {
            let config = job.load()?;
            let paths = RunPaths::for_run(&config.output_folder(), 0);
            print!("{}", sbatch::render(&config.job, &paths.output));
        }

        Commands::Classify {
            output,
            gpu_per_node,
            test_kind,
            expected_value,
            tolerance,
            max_elapsed,
            granularity,
            json,
        } => {
            let mut run = TestRunConfig {
                gpu_per_node,
                test_kind,
                ..Default::default()
            };
            run.thresholds.expected_value = expected_value;
            run.thresholds.tolerance = tolerance;
            run.thresholds.max_elapsed_secs = max_elapsed;
            validate_job(&run)?;

            let text = read_output(&output)?;
            let verdicts = evaluate_output(&text, &run)?;

            let mut report = AggregateReport::new();
            report.record_completed(0, output.display().to_string(), verdicts, None);
            print_report(&report, granularity, json)?;
        }
    }

    Ok(())
}

fn read_output(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()).into())
}
