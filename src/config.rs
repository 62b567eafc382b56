//! Configuration layering: built-in defaults < `{data_dir}/config.toml` <
//! environment variables < CLI flags, in that priority order. Mirrors the
//! override chain the daemon this was adapted from uses for its own
//! `config.toml`.

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_MAX_SESSIONS: u32 = 10;
const DEFAULT_IDLE_TIMEOUT_SEC: u64 = 1800;
const DEFAULT_HEARTBEAT_INTERVAL_SEC: u64 = 30;
const DEFAULT_MCP_HEALTH_INTERVAL_SEC: u64 = 60;
const DEFAULT_APPROVAL_TIMEOUT_SEC: u64 = 300;

/// Per-agent-kind configuration profile, e.g. `[provider.claude]`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderProfile {
    /// Path or name of the binary to exec (default: the agent kind's name).
    pub binary: Option<String>,
    /// Extra CLI arguments appended to every spawn.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Default model override for this agent kind.
    pub model: Option<String>,
}

/// `{data_dir}/config.toml` — every field optional, overridden by env/CLI.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    max_sessions: Option<u32>,
    log: Option<String>,
    idle_timeout_sec: Option<u64>,
    heartbeat_interval_sec: Option<u64>,
    mcp_health_interval_sec: Option<u64>,
    approval_timeout_sec: Option<u64>,
    bind_addr: Option<String>,
    #[serde(default)]
    provider: HashMap<String, ProviderProfile>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// CLI surface. Every flag doubles as an environment variable via clap's
/// `env` attribute, sitting above the TOML layer and below nothing — CLI
/// flags always win.
#[derive(Debug, Parser)]
#[command(name = "agendo-supervisor", about = "Supervises AI coding agent subprocesses")]
pub struct Cli {
    /// Directory holding the SQLite database, session logs, and config.toml.
    #[arg(long, env = "AGENDO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Address the Event Bus HTTP/SSE face binds to.
    #[arg(long, env = "AGENDO_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Maximum number of concurrently running sessions.
    #[arg(long, env = "AGENDO_MAX_SESSIONS")]
    pub max_sessions: Option<u32>,

    /// `tracing_subscriber::EnvFilter` directive string, e.g. "info,agendo_supervisor=debug".
    #[arg(long, env = "AGENDO_LOG")]
    pub log: Option<String>,

    /// Seconds of inactivity before an idle session is auto-cancelled.
    #[arg(long, env = "AGENDO_IDLE_TIMEOUT_SEC")]
    pub idle_timeout_sec: Option<u64>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub log: String,
    pub max_sessions: u32,
    pub idle_timeout_sec: u64,
    pub heartbeat_interval_sec: u64,
    pub mcp_health_interval_sec: u64,
    pub approval_timeout_sec: u64,
    pub providers: HashMap<String, ProviderProfile>,
}

impl SupervisorConfig {
    /// Resolve from parsed CLI args, layering in `config.toml` and defaults.
    pub fn from_cli(cli: Cli) -> Self {
        let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        Self {
            max_sessions: cli
                .max_sessions
                .or(toml.max_sessions)
                .unwrap_or(DEFAULT_MAX_SESSIONS),
            log: cli.log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            idle_timeout_sec: cli
                .idle_timeout_sec
                .or(toml.idle_timeout_sec)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_SEC),
            bind_addr: cli
                .bind_addr
                .or(toml.bind_addr)
                .unwrap_or_else(|| "127.0.0.1:4700".to_string()),
            heartbeat_interval_sec: toml
                .heartbeat_interval_sec
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SEC),
            mcp_health_interval_sec: toml
                .mcp_health_interval_sec
                .unwrap_or(DEFAULT_MCP_HEALTH_INTERVAL_SEC),
            approval_timeout_sec: toml
                .approval_timeout_sec
                .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SEC),
            providers: toml.provider,
            data_dir,
        }
    }

    pub fn provider_profile(&self, agent_kind: &str) -> Option<&ProviderProfile> {
        self.providers.get(agent_kind)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("agendo.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("agendo-supervisor");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("agendo-supervisor");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("agendo-supervisor");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("agendo-supervisor");
        }
    }
    PathBuf::from(".agendo-supervisor")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults_but_not_cli() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "max_sessions = 4\nlog = \"debug\"\n",
        )
        .unwrap();

        let cli = Cli {
            data_dir: Some(dir.path().to_path_buf()),
            bind_addr: None,
            max_sessions: Some(99),
            log: None,
            idle_timeout_sec: None,
        };
        let cfg = SupervisorConfig::from_cli(cli);
        assert_eq!(cfg.max_sessions, 99, "CLI value must win over TOML");
        assert_eq!(cfg.log, "debug", "TOML value must win over built-in default");
    }

    #[test]
    fn missing_config_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            data_dir: Some(dir.path().to_path_buf()),
            bind_addr: None,
            max_sessions: None,
            log: None,
            idle_timeout_sec: None,
        };
        let cfg = SupervisorConfig::from_cli(cli);
        assert_eq!(cfg.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(cfg.idle_timeout_sec, DEFAULT_IDLE_TIMEOUT_SEC);
    }
}
