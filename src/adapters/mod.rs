//! The polymorphic seam: one trait, one struct per agent kind. Every
//! variant (`claude`'s stream-json, `codex`'s JSON-RPC app-server, the
//! tmux TTY-poll driver for tools without either) implements the same
//! closed set of operations, with safe no-op defaults for capabilities a
//! given agent kind doesn't support. Modeled on the daemon's one-trait
//! `Runner` (used for its two concrete runners) generalized to a third,
//! non-interactive-only shape.

pub mod claude;
pub mod codex;
pub mod gemini;

use crate::events::{AgendoEventPayload, ApprovalDecision, PermissionMode};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SpawnContext {
    pub session_id: String,
    pub cwd: PathBuf,
    pub initial_prompt: String,
    pub resume_ref: Option<String>,
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub binary: String,
    pub extra_args: Vec<String>,
}

/// Everything an adapter variant must implement. Capabilities a variant
/// doesn't have (tool-result replay, live permission-mode switching,
/// structured approval responses) default to an inert `Ok(())`/`Ok(false)`
/// rather than an error — the session supervisor checks the return value
/// where it matters (e.g. `set_permission_mode` returning `false` means
/// "you must restart the process to apply this").
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Launch the underlying subprocess. Idempotent to call only once.
    async fn spawn(&mut self, ctx: &SpawnContext) -> anyhow::Result<()>;

    /// Send a new user turn (or, for resumable adapters, a follow-up on an
    /// already-open stdin).
    async fn send_message(&mut self, text: &str, image_ref: Option<&str>) -> anyhow::Result<()>;

    /// Reply to a tool call the agent is waiting on. No-op for adapters
    /// that don't model tool results as a distinct wire message.
    async fn send_tool_result(&mut self, _tool_use_id: &str, _content: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Interrupt the current turn without killing the process. Returns
    /// `true` if the process is still usable afterward.
    async fn interrupt(&mut self) -> anyhow::Result<bool>;

    /// Write an approval decision back to the agent. No-op for adapters
    /// with no native approval protocol (only the stream-json/Claude
    /// adapter implements this for real).
    async fn resolve_approval(
        &mut self,
        _tool_use_id: &str,
        _decision: ApprovalDecision,
        _updated_input: Option<Value>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Attempt to change permission mode on the live process. Returning
    /// `Ok(false)` tells the supervisor the change requires a full
    /// restart (kill + respawn with `--resume`) to take effect.
    async fn set_permission_mode(&mut self, _mode: PermissionMode) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Same contract as `set_permission_mode`: `Ok(false)` means "restart
    /// required".
    async fn set_model(&mut self, _model: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// The adapter's own resumption handle (Claude's session id, Codex's
    /// thread id) once known. `None` before the agent has reported one.
    fn session_ref(&self) -> Option<String>;

    fn pid(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    async fn kill(&mut self) -> anyhow::Result<()>;

    /// Pull the next raw line the adapter's background reader produced, or
    /// `None` once the underlying process has exited and its channel has
    /// drained.
    async fn next_line(&mut self) -> Option<String>;

    /// Pure translation from one raw line to zero or more uniform events.
    /// May mutate small pieces of per-adapter bookkeeping (e.g. Codex's
    /// pending-request-id table) but never performs IO.
    fn map_line(&mut self, line: &str) -> Vec<AgendoEventPayload>;
}

/// Construct the adapter for a given agent kind. `gemini` is spelled out
/// explicitly rather than falling through a default, since adding a new
/// kind should be a deliberate decision here, not an accident.
pub fn for_kind(kind: &str) -> anyhow::Result<Box<dyn AgentAdapter>> {
    match kind {
        "claude" => Ok(Box::new(claude::ClaudeAdapter::new())),
        "codex" => Ok(Box::new(codex::CodexAdapter::new())),
        "gemini" => Ok(Box::new(gemini::GeminiAdapter::new())),
        other => Err(crate::error::SupervisorError::UnknownAgentKind(other.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_an_adapter_for_each_known_kind() {
        assert!(for_kind("claude").is_ok());
        assert!(for_kind("codex").is_ok());
        assert!(for_kind("gemini").is_ok());
    }

    #[test]
    fn rejects_an_unknown_kind() {
        let err = match for_kind("gpt") {
            Err(e) => e,
            Ok(_) => panic!("expected an error for unknown agent kind"),
        };
        assert!(err
            .downcast_ref::<crate::error::SupervisorError>()
            .map(|e| matches!(e, crate::error::SupervisorError::UnknownAgentKind(_)))
            .unwrap_or(false));
    }
}
