use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use fleet_worker::config::WorkerConfig;
use fleet_worker::error::{self, WorkerError};
use fleet_worker::job::JobRecord;
use fleet_worker::queue::{AmqpGateway, QueueNames};
use fleet_worker::shutdown::install_shutdown_handler;
use fleet_worker::worker::{Worker, WorkerSettings, WorkflowExecutor};

#[derive(Parser, Debug)]
#[command(name = "fleet-worker")]
#[command(version)]
#[command(about = "Queue-driven workflow worker for a compute fleet")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Consume jobs and run them until stopped
    Run(RunArgs),

    /// Publish a job record to the fleet or to one instance
    Submit(SubmitArgs),

    /// Validate a configuration file and print the result
    CheckConfig {
        /// Worker configuration (.json, or key=value lines)
        #[arg(long, short = 'c')]
        config: PathBuf,
    },
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Worker configuration (.json, or key=value lines)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Identifier of this compute instance; names the per-instance queue.
    /// Defaults to the host name.
    #[arg(long)]
    instance_id: Option<String>,

    /// Exit after this many jobs (default: run until SIGTERM/SIGINT)
    #[arg(long)]
    max_runs: Option<u64>,
}

// =============================================================================
// Submit Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Worker configuration (.json, or key=value lines)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Job record as JSON
    #[arg(long, short = 'j')]
    job: PathBuf,

    /// Send to this instance's queue instead of the shared one
    #[arg(long)]
    instance_id: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct SubmitOutput {
    job_uuid: String,
    queue: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn resolve_instance_id(flag: Option<String>) -> error::Result<String> {
    if let Some(id) = flag.filter(|id| !id.trim().is_empty()) {
        return Ok(id);
    }
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.trim().is_empty() {
            return Ok(host.trim().to_string());
        }
    }
    let host = std::fs::read_to_string("/etc/hostname").unwrap_or_default();
    if host.trim().is_empty() {
        return Err(WorkerError::Infrastructure(
            "cannot determine instance id; pass --instance-id".to_string(),
        ));
    }
    Ok(host.trim().to_string())
}

// =============================================================================
// Commands
// =============================================================================

async fn run_worker(args: RunArgs) -> error::Result<()> {
    let config = WorkerConfig::load(&args.config)?;
    let instance_id = resolve_instance_id(args.instance_id)?;
    let settings = WorkerSettings::from_config(&config, &instance_id).with_max_runs(args.max_runs);

    tracing::info!(
        instance_id = %instance_id,
        queue = %config.queue_name,
        engine = %config.workflow_engine,
        scratch_dir = %config.scratch_dir.display(),
        heartbeat_secs = config.heartbeat_interval.as_secs_f64(),
        "Starting worker"
    );

    let shutdown = install_shutdown_handler()?;
    let gateway = Arc::new(AmqpGateway::connect(config.broker.clone(), &instance_id).await?);
    let supervisor = Arc::new(WorkflowExecutor::from_config(&config));
    let worker = Worker::new(settings, gateway.clone(), supervisor);

    let result = worker.run(shutdown).await;
    gateway.close().await;
    let summary = result?;
    if summary.aborted {
        tracing::warn!("Worker exited after aborting a running job");
    }
    Ok(())
}

async fn submit_job(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig::load(&args.config)?;
    let job = JobRecord::from_json_bytes(&tokio::fs::read(&args.job).await?)?;

    let target = args.instance_id.as_deref().unwrap_or("submitter");
    let names = QueueNames::from_config(&config, target);
    let queue = if args.instance_id.is_some() {
        names.instance
    } else {
        names.shared
    };

    let gateway = AmqpGateway::connect(config.broker.clone(), "submitter").await?;
    gateway.publish_job(&queue, &job).await?;
    gateway.close().await;

    match args.output {
        OutputFormat::Json => {
            let out = SubmitOutput {
                job_uuid: job.uuid().to_string(),
                queue,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job UUID: {}", job.uuid());
            println!("Queue:    {}", queue);
        }
    }
    Ok(())
}

fn check_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig::load(&path)?;
    println!("{:#?}", config);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Run(run) => Ok(run_worker(run).await?),
        Commands::Submit(submit) => submit_job(submit).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}
