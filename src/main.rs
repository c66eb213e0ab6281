#![forbid(unsafe_code)]

//! `agent-sentinel`: session-lifecycle supervisor CLI.
//!
//! Inspects and maintains a supervisor state directory: one-off or periodic
//! reaper sweeps, session and checkpoint listings, and checkpoint garbage
//! collection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_sentinel::config::SupervisorConfig;
use agent_sentinel::models::session::SessionStatus;
use agent_sentinel::orchestrator::reaper::{
    spawn_reaper_task, CapturedSession, FnCapture, Reaper, ReaperEvent, Verdict,
};
use agent_sentinel::persistence::record_file;
use agent_sentinel::persistence::session_repo::EntryKind;
use agent_sentinel::{AppError, Result, Supervisor};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "agent-sentinel",
    about = "Session-lifecycle supervisor for long-running workers",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the state directory.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one reaper sweep and print the report.
    Sweep {
        /// Write each reclaimed session's context here before deletion.
        #[arg(long)]
        capture_dir: Option<PathBuf>,
    },

    /// Sweep periodically until interrupted.
    Watch {
        /// Sweep interval in seconds (defaults to `reaper.interval_seconds`).
        #[arg(long)]
        interval: Option<u64>,

        /// Write each reclaimed session's context here before deletion.
        #[arg(long)]
        capture_dir: Option<PathBuf>,
    },

    /// List session records with their current verdict.
    Sessions,

    /// List stored checkpoints.
    Checkpoints,

    /// Delete checkpoints older than the retention window.
    Gc {
        /// Retention window in hours (defaults to `checkpoint.max_age_hours`).
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
}

#[derive(Debug, Serialize)]
struct SessionRow {
    worker_id: String,
    verdict: Verdict,
    status: Option<SessionStatus>,
    last_heartbeat: Option<String>,
    path: String,
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
    let mut config = match args.config {
        Some(ref path) => SupervisorConfig::load_from_path(path)?,
        None => SupervisorConfig::default(),
    };
    if let Some(dir) = args.state_dir {
        config.state_dir = Some(dir);
    }

    let supervisor = Supervisor::open(config)?;

    match args.command {
        Command::Sweep { capture_dir } => {
            let reaper = build_reaper(&supervisor, capture_dir.as_deref())?;
            let report = reaper.sweep().await?;
            print_json(&report)?;
        }
        Command::Watch {
            interval,
            capture_dir,
        } => {
            let interval = interval.map_or_else(
                || supervisor.config().reaper.interval(),
                Duration::from_secs,
            );
            watch(&supervisor, interval, capture_dir.as_deref()).await?;
        }
        Command::Sessions => list_sessions(&supervisor).await?,
        Command::Checkpoints => print_json(&supervisor.checkpoints().list()?)?,
        Command::Gc { max_age_hours } => {
            let max_age = max_age_hours.map_or_else(
                || supervisor.config().checkpoint.max_age(),
                |hours| Duration::from_secs(hours.saturating_mul(3600)),
            );
            let removed = supervisor.checkpoints().cleanup_old(max_age)?;
            print_json(&removed)?;
        }
    }

    Ok(())
}

fn build_reaper(supervisor: &Supervisor, capture_dir: Option<&Path>) -> Result<Reaper> {
    let reaper = supervisor.reaper();
    let Some(dir) = capture_dir else {
        return Ok(reaper);
    };

    std::fs::create_dir_all(dir)
        .map_err(|err| AppError::Config(format!("cannot create capture dir: {err}")))?;
    let dir = dir.to_path_buf();
    let capture = FnCapture(move |session: CapturedSession| {
        let path = dir.join(format!(
            "captured_{}_{}.json",
            session.worker_id,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        async move { record_file::write_json_atomic(&path, &session) }
    });
    Ok(reaper.with_capture(Arc::new(capture)))
}

async fn watch(
    supervisor: &Supervisor,
    interval: Duration,
    capture_dir: Option<&Path>,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let reaper = Arc::new(build_reaper(supervisor, capture_dir)?.with_events(tx));

    let ct = CancellationToken::new();
    let reaper_handle = spawn_reaper_task(reaper, interval, ct.clone());
    let event_handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ReaperEvent::Reclaimed { worker_id, reason } => {
                    info!(%worker_id, ?reason, "reclaimed session");
                }
                ReaperEvent::CaptureFailed { worker_id, error } => {
                    warn!(%worker_id, %error, "capture failed for reclaimed session");
                }
            }
        }
    });
    info!(interval_secs = interval.as_secs(), "reaper watching");

    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    if let Err(err) = reaper_handle.await {
        error!(%err, "reaper task ended abnormally");
    }
    // The reaper owned the only sender; the event loop drains and exits.
    if let Err(err) = event_handle.await {
        error!(%err, "event task ended abnormally");
    }
    info!("agent-sentinel shut down");
    Ok(())
}

async fn list_sessions(supervisor: &Supervisor) -> Result<()> {
    let reaper = supervisor.reaper();
    let mut rows = Vec::new();
    for entry in supervisor.sessions().list()? {
        let verdict = reaper.assess(&entry).await;
        let (status, last_heartbeat) = match entry.kind {
            EntryKind::Current(ref record) => (
                Some(record.status),
                record.last_heartbeat.map(|at| at.to_rfc3339()),
            ),
            EntryKind::Legacy { .. } | EntryKind::Unreadable { .. } => (None, None),
        };
        rows.push(SessionRow {
            worker_id: entry.worker_id,
            verdict,
            status,
            last_heartbeat,
            path: entry.path.display().to_string(),
        });
    }
    print_json(&rows)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
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
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

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
