#![forbid(unsafe_code)]

//! `a11y-orchestrator`: job store administration and maintenance daemon.
//!
//! Enqueues and inspects accessibility-test jobs, files cancellation
//! requests, and in `serve` mode runs the stale-lease sweeper and the
//! retention purge until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use a11y_orchestrator::config::GlobalConfig;
use a11y_orchestrator::models::job::{JobSpec, JobType};
use a11y_orchestrator::orchestrator::cleanup;
use a11y_orchestrator::orchestrator::job_manager::JobManager;
use a11y_orchestrator::persistence::job_store::{JobFilter, JobStore, SqliteJobStore};
use a11y_orchestrator::persistence::session_repo::SessionRepo;
use a11y_orchestrator::persistence::{db, retention};
use a11y_orchestrator::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum JobTypeArg {
    Discovery,
    Testing,
    Report,
    Bulk,
}

impl From<JobTypeArg> for JobType {
    fn from(arg: JobTypeArg) -> Self {
        match arg {
            JobTypeArg::Discovery => Self::Discovery,
            JobTypeArg::Testing => Self::Testing,
            JobTypeArg::Report => Self::Report,
            JobTypeArg::Bulk => Self::Bulk,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "a11y-orchestrator", about = "Accessibility test job orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate and enqueue a job described by a JSON file.
    Enqueue {
        /// Path to the job spec (JSON).
        spec: PathBuf,
    },
    /// Request cooperative cancellation of a job.
    Cancel {
        /// Job identifier.
        job_id: String,
        /// Who is asking.
        #[arg(long)]
        requester: String,
    },
    /// Print a job document.
    Status {
        /// Job identifier.
        job_id: String,
    },
    /// Print job aggregates.
    Stats {
        /// Only jobs of this site.
        #[arg(long)]
        site: Option<String>,
        /// Only jobs of this type.
        #[arg(long, value_enum)]
        job_type: Option<JobTypeArg>,
    },
    /// Run one stale-lease sweep.
    Cleanup,
    /// Run the sweeper and retention purge until interrupted.
    Serve,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(worker_id = %config.worker_id, "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db_path = config.db_path.to_string_lossy().to_string();
    let db = Arc::new(db::connect(&db_path).await?);
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(Arc::clone(&db)));
    let manager = Arc::new(JobManager::new(
        Arc::clone(&store),
        config.jobs.max_retries,
    ));

    match args.command {
        Command::Enqueue { spec } => {
            let raw = std::fs::read_to_string(&spec)
                .map_err(|err| AppError::Io(format!("cannot read {}: {err}", spec.display())))?;
            let spec: JobSpec = serde_json::from_str(&raw)
                .map_err(|err| AppError::Validation(format!("malformed job spec: {err}")))?;
            let job_id = manager.enqueue(spec).await?;
            print_json(&serde_json::json!({ "job_id": job_id }))?;
        }
        Command::Cancel { job_id, requester } => {
            let accepted = manager.request_cancellation(&job_id, &requester).await?;
            print_json(&serde_json::json!({ "job_id": job_id, "accepted": accepted }))?;
        }
        Command::Status { job_id } => {
            print_json(&manager.get(&job_id).await?)?;
        }
        Command::Stats { site, job_type } => {
            let filter = JobFilter {
                site_id: site,
                job_type: job_type.map(JobType::from),
                ..JobFilter::default()
            };
            print_json(&manager.stats(&filter).await?)?;
        }
        Command::Cleanup => {
            print_json(&manager.cleanup_stale(Utc::now()).await?)?;
        }
        Command::Serve => serve(&config, manager, store, SessionRepo::new(db)).await,
    }

    Ok(())
}

async fn serve(
    config: &GlobalConfig,
    manager: Arc<JobManager>,
    store: Arc<dyn JobStore>,
    sessions: SessionRepo,
) {
    // ── Start background services ───────────────────────
    let ct = CancellationToken::new();
    let cleanup_handle =
        cleanup::spawn_cleanup_task(manager, config.cleanup_interval(), ct.clone());
    let retention_handle =
        retention::spawn_retention_task(store, sessions, config.retention_days, ct.clone());
    info!(
        cleanup_interval_seconds = config.jobs.cleanup_interval_seconds,
        retention_days = config.retention_days,
        "maintenance services started"
    );

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let (cleanup_result, retention_result) = tokio::join!(cleanup_handle, retention_handle);
    for (name, result) in [("cleanup", cleanup_result), ("retention", retention_result)] {
        if let Err(err) = result {
            warn!(task = name, %err, "background task ended abnormally");
        }
    }
    info!("a11y-orchestrator shut down");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
