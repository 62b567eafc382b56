//! stream-json adapter for the `claude` CLI. Keeps stdin open for the
//! whole session (initial prompt plus every follow-up travel over the
//! same pipe as `{"type":"user",...}` lines) instead of the daemon's
//! one-shot `-p <prompt>` per turn, so mid-conversation messages,
//! redirects, and tool-approval responses can all be written without
//! respawning the process. NDJSON parsing and the `Assistant`/`ToolUse`/
//! `ToolResult`/`Result`/`System` event shapes are carried over from the
//! daemon's Claude runner; `control_request`/`control_response` is this
//! adapter's addition for the approval protocol the daemon never needed
//! (it ran with `--dangerously-skip-permissions`).

use super::{AgentAdapter, SpawnContext};
use crate::approval::INTERACTIVE_TOOLS;
use crate::events::{AgendoEventPayload, ApprovalDecision, AskUserQuestion, ModelUsage, PermissionMode};
use crate::process::ManagedProcess;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use uuid::Uuid;

/// How long `interrupt` waits for the control-response acknowledging the
/// interrupt before concluding the process stopped responding.
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeEvent {
    System {
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: AssistantMessage,
    },
    #[serde(rename = "text_delta")]
    TextDelta { delta: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { delta: String },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(rename = "control_request")]
    ControlRequest {
        request_id: String,
        request: ControlRequestBody,
    },
    Result {
        subtype: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        num_turns: u32,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default, rename = "modelUsage")]
        model_usage_raw: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ControlRequestBody {
    subtype: String,
    #[serde(default)]
    tool_name: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

pub struct ClaudeAdapter {
    process: Option<ManagedProcess>,
    stdin: Option<ChildStdin>,
    lines_rx: Option<mpsc::Receiver<String>>,
    session_ref: Option<String>,
    /// Lines consumed by `interrupt`'s wait-for-ack loop that weren't the
    /// ack itself — buffered so `next_line` still surfaces them to the
    /// session process instead of silently dropping them.
    pending_lines: VecDeque<String>,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self {
            process: None,
            stdin: None,
            lines_rx: None,
            session_ref: None,
            pending_lines: VecDeque::new(),
        }
    }

    async fn write_line(&mut self, value: &Value) -> anyhow::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("claude adapter has no open stdin"))?;
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AgentAdapter for ClaudeAdapter {
    async fn spawn(&mut self, ctx: &SpawnContext) -> anyhow::Result<()> {
        let mut command = Command::new(&ctx.binary);
        command
            .current_dir(&ctx.cwd)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--input-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages")
            .arg("--permission-mode")
            .arg(permission_mode_flag(ctx.permission_mode));
        if let Some(resume) = &ctx.resume_ref {
            command.arg("--resume").arg(resume);
        }
        if let Some(model) = &ctx.model {
            command.arg("--model").arg(model);
        }
        command.args(&ctx.extra_args);

        let (process, stdin, stdout) = ManagedProcess::spawn(command)
            .map_err(|e| crate::error::SupervisorError::SpawnFailed {
                agent: "claude".to_string(),
                source: e,
            })?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        self.process = Some(process);
        self.stdin = Some(stdin);
        self.lines_rx = Some(rx);

        if ctx.initial_prompt.is_empty() {
            // A restart reconnecting to an existing conversation (or
            // starting a cleared one) has nothing new to say yet.
            return Ok(());
        }
        self.send_message(&ctx.initial_prompt, None).await
    }

    async fn send_message(&mut self, text: &str, image_ref: Option<&str>) -> anyhow::Result<()> {
        let mut content = vec![json!({"type": "text", "text": text})];
        if let Some(img) = image_ref {
            content.push(json!({"type": "image", "source": {"type": "file", "path": img}}));
        }
        self.write_line(&json!({
            "type": "user",
            "message": {"role": "user", "content": content},
        }))
        .await
    }

    async fn send_tool_result(&mut self, tool_use_id: &str, content: &Value) -> anyhow::Result<()> {
        self.write_line(&json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "tool_result", "tool_use_id": tool_use_id, "content": content}],
            },
        }))
        .await
    }

    /// Writes the interrupt control-request, then waits up to
    /// [`INTERRUPT_TIMEOUT`] for its control-response ack. Lines read while
    /// waiting that aren't the ack are buffered in `pending_lines` rather
    /// than dropped — `next_line` drains that buffer first. No ack within
    /// the timeout means the process has stopped responding to stdin.
    async fn interrupt(&mut self) -> anyhow::Result<bool> {
        if let Some(process) = &self.process {
            process.signal(crate::process::Signal::Continue).ok();
        }
        let request_id = Uuid::new_v4().to_string();
        self.write_line(&json!({
            "type": "control_request",
            "request_id": request_id,
            "request": {"subtype": "interrupt"},
        }))
        .await?;

        let deadline = tokio::time::Instant::now() + INTERRUPT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let Some(rx) = self.lines_rx.as_mut() else {
                return Ok(false);
            };
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(line)) => {
                    if is_control_response_ack(&line, &request_id) {
                        return Ok(true);
                    }
                    self.pending_lines.push_back(line);
                }
                Ok(None) => return Ok(false),
                Err(_) => return Ok(false),
            }
        }
    }

    async fn resolve_approval(
        &mut self,
        tool_use_id: &str,
        decision: ApprovalDecision,
        updated_input: Option<Value>,
    ) -> anyhow::Result<()> {
        let behavior = match decision {
            ApprovalDecision::Allow => "allow",
            ApprovalDecision::AllowSession => "allow-session",
            ApprovalDecision::Deny => "deny",
        };
        let mut response = json!({"request_id": tool_use_id, "behavior": behavior});
        if let Some(input) = updated_input {
            response["updatedInput"] = input;
        }
        self.write_line(&json!({"type": "control_response", "response": response}))
            .await
    }

    async fn set_permission_mode(&mut self, mode: PermissionMode) -> anyhow::Result<bool> {
        self.write_line(&json!({
            "type": "control_request",
            "request": {"subtype": "set_permission_mode", "mode": permission_mode_flag(mode)},
        }))
        .await?;
        Ok(true)
    }

    fn session_ref(&self) -> Option<String> {
        self.session_ref.clone()
    }

    fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }

    fn is_alive(&self) -> bool {
        self.process.as_ref().map(|p| p.is_alive()).unwrap_or(false)
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        if let Some(process) = &self.process {
            process.stop().await?;
        }
        Ok(())
    }

    async fn next_line(&mut self) -> Option<String> {
        if let Some(line) = self.pending_lines.pop_front() {
            return Some(line);
        }
        self.lines_rx.as_mut()?.recv().await
    }

    fn map_line(&mut self, line: &str) -> Vec<AgendoEventPayload> {
        let event: ClaudeEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) => return vec![],
        };

        match event {
            ClaudeEvent::System { session_id, .. } => {
                if let Some(sid) = session_id {
                    self.session_ref = Some(sid);
                }
                vec![]
            }
            ClaudeEvent::Assistant { message } => message
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(AgendoEventPayload::AgentText { text }),
                    ContentBlock::ToolUse { id, name, input } => {
                        Some(AgendoEventPayload::AgentToolStart {
                            tool_use_id: id,
                            tool_name: name,
                            input,
                        })
                    }
                    ContentBlock::Other => None,
                })
                .collect(),
            ClaudeEvent::TextDelta { delta } => vec![AgendoEventPayload::AgentTextDelta { delta }],
            ClaudeEvent::ThinkingDelta { delta } => {
                vec![AgendoEventPayload::AgentThinkingDelta { delta }]
            }
            ClaudeEvent::ToolResult { tool_use_id, content, is_error } => {
                vec![AgendoEventPayload::AgentToolEnd {
                    tool_use_id,
                    content,
                    duration_ms: None,
                    num_files: None,
                    truncated: None,
                    is_error,
                }]
            }
            ClaudeEvent::ControlRequest { request_id, request } if request.subtype == "can_use_tool" => {
                if INTERACTIVE_TOOLS.contains(request.tool_name.as_str()) {
                    let questions = request
                        .input
                        .get("questions")
                        .and_then(|v| v.as_array())
                        .map(|arr| {
                            arr.iter()
                                .enumerate()
                                .map(|(i, q)| AskUserQuestion {
                                    id: format!("{request_id}-{i}"),
                                    text: q.get("text").and_then(|t| t.as_str()).unwrap_or("").to_string(),
                                    options: q
                                        .get("options")
                                        .and_then(|o| o.as_array())
                                        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                                        .unwrap_or_default(),
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    vec![AgendoEventPayload::AgentAskUser { request_id, questions }]
                } else {
                    vec![AgendoEventPayload::AgentToolApproval {
                        approval_id: request_id,
                        tool_name: request.tool_name,
                        tool_input: request.input,
                    }]
                }
            }
            ClaudeEvent::ControlRequest { .. } => vec![],
            ClaudeEvent::Result {
                is_error,
                total_cost_usd,
                num_turns,
                duration_ms,
                model_usage_raw,
                ..
            } => {
                let model_usage = model_usage_raw
                    .as_object()
                    .map(|obj| {
                        obj.iter()
                            .map(|(model, v)| ModelUsage {
                                model: model.clone(),
                                input_tokens: v.get("inputTokens").and_then(|x| x.as_u64()).unwrap_or(0),
                                output_tokens: v.get("outputTokens").and_then(|x| x.as_u64()).unwrap_or(0),
                                cost_usd: v.get("costUSD").and_then(|x| x.as_f64()).unwrap_or(0.0),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                vec![AgendoEventPayload::AgentResult {
                    cost_usd: total_cost_usd,
                    turns: num_turns,
                    duration_ms,
                    is_error,
                    model_usage,
                }]
            }
            ClaudeEvent::Unknown => vec![],
        }
    }
}

/// Whether `line` is the `control_response` acknowledging the interrupt
/// request with the given `request_id`. Malformed or unrelated lines are
/// just not a match, not an error.
fn is_control_response_ack(line: &str, request_id: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return false;
    };
    if value.get("type").and_then(|t| t.as_str()) != Some("control_response") {
        return false;
    }
    value
        .get("response")
        .and_then(|r| r.get("request_id"))
        .and_then(|r| r.as_str())
        == Some(request_id)
}

fn permission_mode_flag(mode: PermissionMode) -> &'static str {
    match mode {
        PermissionMode::Default => "default",
        PermissionMode::AcceptEdits => "acceptEdits",
        PermissionMode::Plan => "plan",
        PermissionMode::BypassPermissions => "bypassPermissions",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_text_block_maps_to_agent_text() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        let events = adapter.map_line(line);
        assert!(matches!(&events[0], AgendoEventPayload::AgentText { text } if text == "hi"));
    }

    #[test]
    fn ask_user_question_tool_maps_to_agent_ask_user() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"control_request","request_id":"r1","request":{"subtype":"can_use_tool","tool_name":"AskUserQuestion","input":{"questions":[{"text":"Continue?","options":["yes","no"]}]}}}"#;
        let events = adapter.map_line(line);
        match &events[0] {
            AgendoEventPayload::AgentAskUser { request_id, questions } => {
                assert_eq!(request_id, "r1");
                assert_eq!(questions[0].text, "Continue?");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn ordinary_tool_maps_to_tool_approval() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"control_request","request_id":"r2","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"}}}"#;
        let events = adapter.map_line(line);
        assert!(matches!(&events[0], AgendoEventPayload::AgentToolApproval { tool_name, .. } if tool_name == "Bash"));
    }

    #[test]
    fn system_init_captures_session_ref() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"system","subtype":"init","session_id":"abc123"}"#;
        adapter.map_line(line);
        assert_eq!(adapter.session_ref(), Some("abc123".to_string()));
    }

    #[test]
    fn malformed_line_yields_no_events_instead_of_panicking() {
        let mut adapter = ClaudeAdapter::new();
        assert!(adapter.map_line("not json").is_empty());
    }

    #[test]
    fn tool_result_carries_is_error_through_to_tool_end() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"tool_result","tool_use_id":"t1","content":"boom","is_error":true}"#;
        let events = adapter.map_line(line);
        assert!(matches!(
            &events[0],
            AgendoEventPayload::AgentToolEnd { is_error: Some(true), .. }
        ));
    }

    #[test]
    fn tool_result_without_is_error_defaults_to_none() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"tool_result","tool_use_id":"t1","content":"ok"}"#;
        let events = adapter.map_line(line);
        assert!(matches!(
            &events[0],
            AgendoEventPayload::AgentToolEnd { is_error: None, .. }
        ));
    }

    #[test]
    fn control_response_ack_matches_on_request_id() {
        let line = r#"{"type":"control_response","response":{"request_id":"r1","subtype":"success"}}"#;
        assert!(is_control_response_ack(line, "r1"));
        assert!(!is_control_response_ack(line, "other"));
    }

    #[test]
    fn control_response_ack_rejects_non_control_response_lines() {
        let line = r#"{"type":"assistant","message":{"content":[]}}"#;
        assert!(!is_control_response_ack(line, "r1"));
    }
}
