use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use pfsw_jobs::config::{ServiceConfig, WorkerConfig};
use pfsw_jobs::shutdown::install_shutdown_handler;
use pfsw_jobs::{DegradedPolicy, GatewayConfig, ProcessOutcome, http, setup_database};

#[derive(Parser, Debug)]
#[command(name = "pfsw-jobs")]
#[command(version)]
#[command(about = "Claims queued prompt-packaging jobs and runs them through an LLM pipeline")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP trigger, optionally with background workers
    Serve(ServeArgs),

    /// Run background workers without the HTTP server
    Work(WorkArgs),

    /// Process at most one queued job and exit
    ProcessOnce,

    /// Create or upgrade the job tables
    Migrate,
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CommonArgs {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum number of pooled database connections
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value = "10")]
    max_connections: u32,

    /// Base URL of the OpenAI-compatible chat-completion gateway
    #[arg(long, env = "AI_GATEWAY_URL", default_value = "http://localhost:8080/v1")]
    gateway_url: String,

    /// Bearer token for the gateway
    #[arg(long, env = "AI_GATEWAY_API_KEY", hide_env_values = true)]
    gateway_api_key: Option<String>,

    /// Model used for both pipeline stages
    #[arg(long, env = "AI_MODEL", default_value = "google/gemini-2.5-flash")]
    model: String,

    /// Gateway request timeout in seconds
    #[arg(long, env = "AI_TIMEOUT_SECS", default_value = "120")]
    ai_timeout_secs: u64,

    /// Mark jobs with failed stages `completed_with_errors` instead of `completed`
    #[arg(long, env = "MARK_DEGRADED_JOBS")]
    mark_degraded_jobs: bool,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    listen_addr: SocketAddr,

    #[command(flatten)]
    worker: WorkerArgs,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Number of background workers (0 disables polling when serving)
    #[arg(long, env = "NUM_WORKERS", default_value = "0")]
    workers: usize,

    /// Poll interval in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    /// Maximum poll jitter in milliseconds
    #[arg(long, env = "POLL_JITTER_MS", default_value = "100")]
    jitter_ms: u64,

    /// Requeue jobs stuck in `processing` for this many seconds (0 disables)
    #[arg(long, env = "RECLAIM_AFTER_SECS", default_value = "900")]
    reclaim_after_secs: u64,
}

#[derive(Parser, Debug)]
struct WorkArgs {
    #[command(flatten)]
    worker: WorkerArgs,

    /// Exit once the queue is empty
    #[arg(long)]
    exit_when_empty: bool,
}

impl WorkerArgs {
    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            num_workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            reclaim_after: (self.reclaim_after_secs > 0)
                .then(|| Duration::from_secs(self.reclaim_after_secs)),
            ..WorkerConfig::default()
        }
    }
}

fn service_config(common: CommonArgs) -> ServiceConfig {
    ServiceConfig {
        database_url: common.database_url,
        max_connections: common.max_connections,
        gateway: GatewayConfig {
            base_url: common.gateway_url,
            api_key: common.gateway_api_key,
            model: common.model,
            timeout: Duration::from_secs(common.ai_timeout_secs),
        },
        degraded_policy: if common.mark_degraded_jobs {
            DegradedPolicy::MarkCompletedWithErrors
        } else {
            DegradedPolicy::MarkCompleted
        },
        ..ServiceConfig::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = service_config(args.common);
    let pool = config
        .connect()
        .await
        .context("Failed to connect to the database")?;

    match args.command {
        Commands::Migrate => {
            setup_database(&pool).await?;
            tracing::info!("Database is up to date");
        }
        Commands::ProcessOnce => {
            let processor = config.processor(pool)?;
            match processor.process_next_job().await? {
                ProcessOutcome::NoJobs => tracing::info!("No jobs in queue"),
                ProcessOutcome::AlreadyClaimed { job_id } => {
                    tracing::info!(%job_id, "Job already claimed");
                }
                ProcessOutcome::Completed { job_id, degraded } => {
                    tracing::info!(%job_id, degraded, "Job completed");
                }
                ProcessOutcome::Failed { job_id, reason } => {
                    tracing::warn!(%job_id, %reason, "Job failed");
                }
            }
        }
        Commands::Work(work_args) => {
            config.worker = work_args.worker.worker_config();
            config.worker.num_workers = config.worker.num_workers.max(1);

            let processor = Arc::new(config.processor(pool)?);
            let mut runner = config.worker.runner(processor);
            if work_args.exit_when_empty {
                runner = runner.shutdown_when_queue_empty();
            }

            let shutdown = install_shutdown_handler()?;
            let handle = runner.start();
            let stop = handle.shutdown_token();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                stop.cancel();
            });
            handle.wait_for_shutdown().await;
        }
        Commands::Serve(serve_args) => {
            config.listen_addr = serve_args.listen_addr;
            config.worker = serve_args.worker.worker_config();

            let processor = Arc::new(config.processor(pool)?);
            let shutdown = install_shutdown_handler()?;

            let handle = (config.worker.num_workers > 0)
                .then(|| config.worker.runner(processor.clone()).start());

            let listener = TcpListener::bind(config.listen_addr)
                .await
                .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
            http::serve(listener, http::router(processor), shutdown.clone()).await?;

            if let Some(handle) = handle {
                handle.shutdown();
                handle.wait_for_shutdown().await;
            }
        }
    }

    Ok(())
}
