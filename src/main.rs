//! CLI entry point. Grounded on the daemon's `main.rs`: a `clap` surface
//! with a default `serve` subcommand that brings up storage, the event bus,
//! the session manager, and the HTTP face, plus a small `inspect`
//! subcommand for local exercise of the library without a browser client.

use agendo_supervisor::config::{Cli, SupervisorConfig};
use agendo_supervisor::event_bus::EventBus;
use agendo_supervisor::push::LoggingPushNotifier;
use agendo_supervisor::queue::InMemoryWorkQueue;
use agendo_supervisor::session::SessionManager;
use agendo_supervisor::storage::Storage;
use agendo_supervisor::AppContext;
use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "agendo-supervisor", about = "Supervises AI coding agent subprocesses", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    cli: CliFlags,
}

/// Mirrors `agendo_supervisor::config::Cli` so `clap` can flatten it under
/// a subcommand-bearing top-level `Args` without the library crate needing
/// to know about subcommands at all.
#[derive(ClapArgs)]
struct CliFlags {
    #[arg(long, env = "AGENDO_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,
    #[arg(long, env = "AGENDO_BIND_ADDR")]
    bind_addr: Option<String>,
    #[arg(long, env = "AGENDO_MAX_SESSIONS")]
    max_sessions: Option<u32>,
    #[arg(long, env = "AGENDO_LOG")]
    log: Option<String>,
    #[arg(long, env = "AGENDO_IDLE_TIMEOUT_SEC")]
    idle_timeout_sec: Option<u64>,
}

impl From<CliFlags> for Cli {
    fn from(f: CliFlags) -> Self {
        Cli {
            data_dir: f.data_dir,
            bind_addr: f.bind_addr,
            max_sessions: f.max_sessions,
            log: f.log,
            idle_timeout_sec: f.idle_timeout_sec,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Start the supervisor (default when no subcommand is given).
    Serve,
    /// Print one session row as JSON, for local debugging without a client.
    Inspect { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cli: Cli = args.cli.into();
    let config = Arc::new(SupervisorConfig::from_cli(cli));
    init_logging(&config.log);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
        Command::Inspect { session_id } => run_inspect(config, &session_id).await,
    }
}

fn init_logging(filter: &str) {
    tracing_subscriber::fmt().with_env_filter(filter.to_string()).compact().init();
}

async fn run_server(config: Arc<SupervisorConfig>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "agendo-supervisor starting");
    info!(data_dir = %config.data_dir.display(), bind_addr = %config.bind_addr, "config loaded");

    for kind in ["claude", "codex", "gemini"] {
        let binary = config.provider_profile(kind).and_then(|p| p.binary.clone()).unwrap_or_else(|| kind.to_string());
        let available = std::process::Command::new(&binary)
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok();
        if available {
            info!(kind, binary = %binary, "agent CLI found");
        } else {
            warn!(kind, binary = %binary, "agent CLI not found on PATH — sessions of this kind will fail to spawn");
        }
    }

    let storage = Storage::new(&config.data_dir).await.context("failed to open session storage")?;
    let event_bus = EventBus::new();
    let queue = Arc::new(InMemoryWorkQueue::new());
    let push = Arc::new(LoggingPushNotifier);

    let session_manager = Arc::new(SessionManager::new(storage, event_bus, config.clone(), queue, push));

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        session_manager: session_manager.clone(),
        started_at: std::time::Instant::now(),
    });

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    tokio::select! {
        result = agendo_supervisor::http::serve(ctx) => result?,
        _ = shutdown_signal => {
            info!("shutdown signal received, draining live sessions");
            session_manager.drain().await;
        }
    }

    Ok(())
}

async fn run_inspect(config: Arc<SupervisorConfig>, session_id: &str) -> Result<()> {
    let storage = Storage::new(&config.data_dir).await.context("failed to open session storage")?;
    let row = storage.get_session(session_id).await?;
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "id": row.id,
        "kind": row.kind,
        "cwd": row.cwd,
        "status": row.status(),
        "session_ref": row.session_ref,
        "permission_mode": row.permission_mode(),
        "model": row.model,
        "total_cost_usd": row.total_cost_usd,
        "total_turns": row.total_turns,
        "started_at": row.started_at,
        "last_active_at": row.last_active_at,
        "ended_at": row.ended_at,
    }))?);
    Ok(())
}
