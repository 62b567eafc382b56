//! Wire types shared by every adapter: the uniform event envelope published
//! on `events:<sessionId>`, and the control envelope accepted on
//! `control:<sessionId>`.
//!
//! Adapter-specific frames (Claude's NDJSON objects, Codex's JSON-RPC
//! notifications, Gemini's captured pane text) are never exposed past the
//! `adapters` module — the [`AgendoEventPayload`] variants here are the
//! closed set every mapper must translate into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persistent + observable session state (`sessions.status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    AwaitingInput,
    Idle,
    Ended,
}

impl SessionStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::AwaitingInput => "awaiting_input",
            SessionStatus::Idle => "idle",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "awaiting_input" => Some(SessionStatus::AwaitingInput),
            "idle" => Some(SessionStatus::Idle),
            "ended" => Some(SessionStatus::Ended),
            _ => None,
        }
    }
}

/// `permissionMode` — how aggressively the agent may act without a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_db_str(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "acceptEdits" => PermissionMode::AcceptEdits,
            "plan" => PermissionMode::Plan,
            "bypassPermissions" => PermissionMode::BypassPermissions,
            _ => PermissionMode::Default,
        }
    }

    /// Human label used in the `system:info` notice on a restart-driven
    /// mode change (scenario 4 of the testable-properties set).
    pub fn label(self) -> &'static str {
        match self {
            PermissionMode::Default => "Default",
            PermissionMode::AcceptEdits => "Edit Only",
            PermissionMode::Plan => "Plan",
            PermissionMode::BypassPermissions => "Bypass Permissions",
        }
    }
}

/// Decision returned from the approval flow; `allow-session` additionally
/// appends the tool to the session allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    Allow,
    AllowSession,
    Deny,
}

/// Per-model token/cost usage reported in `agent:result`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// One question posed by `agent:ask-user`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskUserQuestion {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// The closed set of uniform event payloads. `#[serde(tag = "type")]` gives
/// each variant the exact `"session:init"`-style discriminator from the
/// wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgendoEventPayload {
    #[serde(rename = "session:init")]
    SessionInit {
        session_ref: String,
        #[serde(default)]
        slash_commands: Vec<String>,
        #[serde(default)]
        mcp_servers: Vec<String>,
        model: String,
        cwd: String,
        #[serde(default)]
        tools: Vec<String>,
        permission_mode: PermissionMode,
    },
    #[serde(rename = "session:state")]
    SessionState { status: SessionStatus },

    #[serde(rename = "agent:text")]
    AgentText { text: String },
    #[serde(rename = "agent:text-delta")]
    AgentTextDelta { delta: String },
    #[serde(rename = "agent:thinking")]
    AgentThinking { text: String },
    #[serde(rename = "agent:thinking-delta")]
    AgentThinkingDelta { delta: String },
    #[serde(rename = "agent:tool-start")]
    AgentToolStart {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename = "agent:tool-end")]
    AgentToolEnd {
        tool_use_id: String,
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        num_files: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        truncated: Option<bool>,
        /// `Some(true)` when the underlying `tool_result` reported failure.
        /// On an id still tracked as active, this is the generic
        /// interactive-tool signal: the session process suppresses this
        /// event instead of publishing it and moves the id to
        /// pending-human-response (§4.3).
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(rename = "agent:result")]
    AgentResult {
        cost_usd: f64,
        turns: u32,
        duration_ms: u64,
        is_error: bool,
        #[serde(default)]
        model_usage: Vec<ModelUsage>,
    },
    #[serde(rename = "agent:activity")]
    AgentActivity { thinking: bool },
    #[serde(rename = "agent:tool-approval")]
    AgentToolApproval {
        approval_id: String,
        tool_name: String,
        tool_input: Value,
    },
    #[serde(rename = "agent:ask-user")]
    AgentAskUser {
        request_id: String,
        questions: Vec<AskUserQuestion>,
    },

    #[serde(rename = "user:message")]
    UserMessage { text: String },

    #[serde(rename = "system:info")]
    SystemInfo { message: String },
    #[serde(rename = "system:error")]
    SystemError { message: String },
    #[serde(rename = "system:rate-limit")]
    SystemRateLimit {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_sec: Option<u64>,
        message: String,
    },
    #[serde(rename = "system:mcp-status")]
    SystemMcpStatus { servers: Vec<McpServerStatus> },

    #[serde(rename = "team:message")]
    TeamMessage { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerStatus {
    pub name: String,
    pub status: String,
}

impl McpServerStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "connected" || self.status == "ready"
    }
}

/// The envelope every subscriber actually receives. `id` is the
/// post-increment `eventSeq` value — the ordering/reconnect key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgendoEvent {
    pub id: u64,
    pub session_id: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: AgendoEventPayload,
}

/// Inbound control message accepted on `control:<sessionId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgendoControl {
    #[serde(rename = "cancel")]
    Cancel,
    /// Graceful shutdown: unlike `Cancel`, the session lands `idle`
    /// (resumable) rather than `ended` — the supervisor is going away, not
    /// the user abandoning the conversation.
    #[serde(rename = "terminate")]
    Terminate,
    #[serde(rename = "interrupt")]
    Interrupt,
    #[serde(rename = "message")]
    Message {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_ref: Option<String>,
    },
    #[serde(rename = "redirect")]
    Redirect { new_prompt: String },
    #[serde(rename = "tool-approval")]
    ToolApproval {
        approval_id: String,
        decision: ApprovalDecision,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        post_approval_mode: Option<PermissionMode>,
        #[serde(default)]
        post_approval_compact: bool,
        #[serde(default)]
        clear_context_restart: bool,
    },
    #[serde(rename = "tool-result")]
    ToolResult {
        tool_use_id: String,
        content: Value,
    },
    #[serde(rename = "answer-question")]
    AnswerQuestion {
        request_id: String,
        answers: Vec<String>,
    },
    #[serde(rename = "set-permission-mode")]
    SetPermissionMode { mode: PermissionMode },
    #[serde(rename = "set-model")]
    SetModel { model: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_round_trips_through_db_repr() {
        for s in [
            SessionStatus::Active,
            SessionStatus::AwaitingInput,
            SessionStatus::Idle,
            SessionStatus::Ended,
        ] {
            assert_eq!(SessionStatus::from_db_str(s.as_db_str()), Some(s));
        }
    }

    #[test]
    fn event_payload_serializes_with_colon_tag() {
        let payload = AgendoEventPayload::AgentText {
            text: "hi".to_string(),
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["type"], "agent:text");
    }

    #[test]
    fn control_tool_approval_round_trips() {
        let ctrl = AgendoControl::ToolApproval {
            approval_id: "a1".into(),
            decision: ApprovalDecision::AllowSession,
            updated_input: None,
            post_approval_mode: None,
            post_approval_compact: false,
            clear_context_restart: false,
        };
        let s = serde_json::to_string(&ctrl).unwrap();
        let back: AgendoControl = serde_json::from_str(&s).unwrap();
        match back {
            AgendoControl::ToolApproval { decision, .. } => {
                assert_eq!(decision, ApprovalDecision::AllowSession)
            }
            _ => panic!("wrong variant"),
        }
    }
}
