//! CLI command definitions for jobforge.
//!
//! `run` drives a queue with a pool of worker processes until Ctrl-C. The
//! other commands are one-shot operations against the same Redis keys.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::{QueueConfig, DEFAULT_REDIS_URL};
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{
    Job, ProcessWorkerFactory, ProcessingQueue, QueueManager, RecoveryManager, RecoveryReport,
    RedisStore,
};

/// Persistent job dispatch over Redis.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Dispatch queued jobs onto a pool of long-lived workers")]
#[command(version)]
#[command(
    long_about = "jobforge moves JSON jobs from a Redis list onto a fixed pool of worker processes, records each job's status and recovers in-flight work after a crash.\n\nExample usage:\n  jobforge enqueue --queue thumbnails '{\"image\": \"a.png\"}'\n  jobforge run --queue thumbnails --worker ./thumbnail-worker"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Recover leftovers, then dispatch jobs to worker processes until Ctrl-C.
    Run(RunArgs),

    /// Add JSON payloads to the queue.
    #[command(alias = "add")]
    Enqueue(EnqueueArgs),

    /// Run startup recovery once and exit.
    Recover(QueueArgs),

    /// Print queue depths.
    Stats(QueueArgs),

    /// Print the status record of one job.
    Status(StatusArgs),
}

/// Store connection shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct QueueArgs {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Queue name. Keys derive from `{queue}_queue`.
    #[arg(short, long, env = "JOBFORGE_QUEUE", default_value = "jobs")]
    pub queue: String,
}

impl QueueArgs {
    /// Environment configuration with the connection flags applied.
    fn config(&self) -> anyhow::Result<QueueConfig> {
        let mut config = QueueConfig::from_env()?;
        config.queue_name = self.queue.clone();
        config.redis_url = self.redis_url.clone();
        Ok(config)
    }

    async fn connect(&self) -> anyhow::Result<(QueueConfig, Arc<QueueManager>)> {
        let config = self.config()?;
        let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
        let queue = Arc::new(QueueManager::from_config(store, &config));
        Ok((config, queue))
    }
}

/// Arguments for the run command.
#[derive(clap::Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Worker program. One process is started per slot.
    #[arg(short, long)]
    pub worker: String,

    /// Arguments passed to every worker process.
    #[arg(last = true)]
    pub worker_args: Vec<String>,

    /// Number of worker processes.
    #[arg(short = 'j', long, env = "JOBFORGE_MAX_CONCURRENT_JOBS")]
    pub max_concurrent_jobs: Option<usize>,

    /// Most jobs fetched per dispatch iteration.
    #[arg(long, env = "JOBFORGE_BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Per-job timeout in seconds.
    #[arg(long)]
    pub job_timeout: Option<u64>,

    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub metrics_dump: bool,
}

/// Arguments for the enqueue command.
#[derive(clap::Args, Debug)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// JSON payloads, one job each.
    pub payloads: Vec<String>,

    /// File with one JSON payload per line.
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

/// Arguments for the status command.
#[derive(clap::Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Job identifier.
    pub job_id: String,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_dispatch_command(args).await,
        Commands::Enqueue(args) => run_enqueue_command(args).await,
        Commands::Recover(args) => run_recover_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

async fn run_dispatch_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = args.queue.config()?;
    if let Some(jobs) = args.max_concurrent_jobs {
        config.max_concurrent_jobs = jobs;
    }
    if let Some(batch) = args.batch_size {
        config.batch_size = batch;
    }
    if let Some(secs) = args.job_timeout {
        config.job_timeout = std::time::Duration::from_secs(secs);
    }
    config.validate()?;

    init_metrics()?;

    let factory = Arc::new(
        ProcessWorkerFactory::new(args.worker.clone()).with_args(args.worker_args.clone()),
    );
    let queue = ProcessingQueue::connect(config, factory).await?;
    queue.start().await?;

    info!(
        queue = %queue.config().queue_name,
        worker = %args.worker,
        "Dispatching; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let stopped = queue.shutdown().await;
    if args.metrics_dump {
        print!("{}", export_metrics());
    }
    stopped?;
    Ok(())
}

// ============================================================================
// One-shot Commands
// ============================================================================

#[derive(Debug, Serialize)]
struct EnqueueOutput {
    status: String,
    queue: String,
    enqueued: usize,
    job_ids: Vec<String>,
}

async fn run_enqueue_command(args: EnqueueArgs) -> anyhow::Result<()> {
    let mut raw_payloads = args.payloads.clone();
    if let Some(path) = &args.file {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        raw_payloads.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }
    if raw_payloads.is_empty() {
        anyhow::bail!("No payloads given; pass JSON arguments or --file");
    }

    let jobs = parse_payloads(&raw_payloads)?;
    let (config, queue) = args.queue.connect().await?;
    let enqueued = queue.add_jobs(&jobs).await?;

    let output = EnqueueOutput {
        status: "success".to_string(),
        queue: config.queue_name,
        enqueued,
        job_ids: jobs.into_iter().map(|job| job.job_id).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn parse_payloads(raw_payloads: &[String]) -> anyhow::Result<Vec<Job>> {
    raw_payloads
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            serde_json::from_str(raw)
                .map(Job::new)
                .map_err(|e| anyhow::anyhow!("Payload #{} is not valid JSON: {}", index + 1, e))
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct RecoverOutput {
    status: String,
    queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<RecoveryReport>,
}

async fn run_recover_command(args: QueueArgs) -> anyhow::Result<()> {
    let (config, queue) = args.connect().await?;
    let recovery = RecoveryManager::new(queue, config.startup_lock_ttl)
        .with_scan_count(config.recovery_scan_count);

    let report = recovery.recover_on_startup().await?;
    let output = RecoverOutput {
        status: if report.is_some() {
            "recovered".to_string()
        } else {
            "locked".to_string()
        },
        queue: config.queue_name,
        report,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_stats_command(args: QueueArgs) -> anyhow::Result<()> {
    let (_, queue) = args.connect().await?;
    let stats = queue.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let (config, queue) = args.queue.connect().await?;
    match queue.job_status(&args.job_id).await? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => Err(anyhow::anyhow!(
            "No status record for job {} on queue {}",
            args.job_id,
            config.queue_name
        )),
    }
}
