//! Session Runner: resolves everything a Session Process needs before it
//! can start — working directory, the per-session MCP config file, the
//! concrete adapter for the agent kind — claims the row, and hands off to
//! the long-lived actor loop in [`super::supervisor`]. Grounded on the
//! daemon's `SessionManager::send_message`, which lazily constructs the
//! right `Runner` impl per provider and spawns its turn in the
//! background; generalized here into its own module since one call site
//! now handles both first-run and resume.

use super::supervisor;
use crate::adapters;
use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::event_bus::EventBus;
use crate::events::PermissionMode;
use crate::push::PushNotifier;
use crate::storage::Storage;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct RunnerDeps {
    pub storage: Storage,
    pub event_bus: EventBus,
    pub config: Arc<SupervisorConfig>,
    pub push: Arc<dyn PushNotifier>,
}

/// Write `<cwd>/.agendo/mcp.json` pointing the agent's own MCP client at
/// this supervisor's control surface for the session. Best-effort: a
/// write failure is logged, never fatal to starting the session.
async fn write_session_mcp_config(cwd: &Path, session_id: &str, bind_addr: &str) {
    let dir = cwd.join(".agendo");
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        error!(session_id, error = %e, "failed to create .agendo directory for mcp config");
        return;
    }
    let config = json!({
        "mcpServers": {
            "agendo": {
                "type": "http",
                "url": format!("http://{bind_addr}/sessions/{session_id}/mcp"),
                "trusted": true,
            }
        }
    });
    let path = dir.join("mcp.json");
    match serde_json::to_vec_pretty(&config) {
        Ok(bytes) => {
            if let Err(e) = tokio::fs::write(&path, bytes).await {
                error!(session_id, path = %path.display(), error = %e, "failed to write mcp config");
            }
        }
        Err(e) => error!(session_id, error = %e, "failed to serialize mcp config"),
    }
}

/// Atomically claim `session_id` and spawn its actor loop as a background
/// task. Returns the join handle so callers (the Session Manager's
/// `drain`) can wait for clean shutdown. A permission-mode or model change
/// the running adapter can't apply live makes the actor loop return a
/// [`supervisor::RunOutcome::Restart`]; this function owns the respawn loop
/// so the claimed row is never released and re-contended for a restart.
pub async fn spawn(
    deps: RunnerDeps,
    session_id: String,
    kind: String,
    cwd: PathBuf,
    message: Option<String>,
) -> Result<tokio::task::JoinHandle<()>> {
    let worker_id = format!("{}-{}", hostname(), std::process::id());
    let claimed = deps.storage.claim_session(&session_id, &worker_id).await?;

    write_session_mcp_config(&cwd, &session_id, &deps.config.bind_addr).await;

    let profile = deps.config.provider_profile(&kind);
    let binary = profile
        .and_then(|p| p.binary.clone())
        .unwrap_or_else(|| kind.clone());
    let extra_args = profile.map(|p| p.extra_args.clone()).unwrap_or_default();
    let model = claimed
        .model
        .clone()
        .or_else(|| profile.and_then(|p| p.model.clone()));

    info!(session_id, kind, "spawning session runner");

    let handle = tokio::spawn(async move {
        let mut resume_ref = claimed.session_ref.clone();
        let mut permission_mode = claimed.permission_mode();
        let mut model = model;
        let mut prompt = message.unwrap_or_else(|| claimed.initial_prompt.clone());

        loop {
            let adapter = match adapters::for_kind(&kind) {
                Ok(a) => a,
                Err(e) => {
                    error!(session_id, error = %e, "failed to construct adapter for restart");
                    let _ = deps.storage.end_session(&session_id).await;
                    return;
                }
            };
            let spawn_ctx = adapters::SpawnContext {
                session_id: session_id.clone(),
                cwd: cwd.clone(),
                initial_prompt: prompt.clone(),
                resume_ref: resume_ref.clone(),
                model: model.clone(),
                permission_mode,
                binary: binary.clone(),
                extra_args: extra_args.clone(),
            };

            match supervisor::run(deps.clone(), session_id.clone(), adapter, spawn_ctx).await {
                supervisor::RunOutcome::Ended => return,
                supervisor::RunOutcome::Restart {
                    resume_ref: new_ref,
                    permission_mode: new_mode,
                    model: new_model,
                    clear_context,
                } => {
                    resume_ref = new_ref;
                    permission_mode = new_mode;
                    model = new_model;
                    let _ = clear_context;
                    // A restart never has a fresh user turn to deliver — it's
                    // either resuming the same conversation or, on a cleared
                    // context, starting a new one with nothing said yet. Either
                    // way `spawn` must not replay the original initial prompt.
                    prompt = String::new();
                }
            }
        }
    });
    Ok(handle)
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "agendo-supervisor".to_string())
}

pub fn validate_kind(kind: &str) -> Result<()> {
    match kind {
        "claude" | "codex" | "gemini" => Ok(()),
        other => Err(SupervisorError::UnknownAgentKind(other.to_string())),
    }
}

pub fn default_permission_mode() -> PermissionMode {
    PermissionMode::Default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_kind_accepts_the_three_known_agents() {
        assert!(validate_kind("claude").is_ok());
        assert!(validate_kind("codex").is_ok());
        assert!(validate_kind("gemini").is_ok());
    }

    #[test]
    fn validate_kind_rejects_anything_else() {
        let err = validate_kind("gpt").unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownAgentKind(k) if k == "gpt"));
    }

    #[test]
    fn default_permission_mode_is_default() {
        assert_eq!(default_permission_mode(), PermissionMode::Default);
    }
}
