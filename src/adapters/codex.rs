//! JSON-RPC adapter for `codex app-server`. The request/id plumbing (the
//! `AtomicU64` counter, manual `{"jsonrpc":"2.0",...}` construction) is
//! carried over from the daemon's `CodexAppServer`. That code reads each
//! response synchronously right after writing its request, which only
//! works because it never needed to interleave free-running event
//! notifications on the same pipe. This adapter keeps that synchronous
//! style for the one-time `initialize`/`thread/start` handshake, then
//! switches the same stdout handle over to a background forwarding task
//! so `turn/start`'s streamed notifications (text deltas, tool calls,
//! completion) can be read continuously afterward.

use super::{AgentAdapter, SpawnContext};
use crate::events::{AgendoEventPayload, ModelUsage};
use crate::process::ManagedProcess;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

enum PendingKind {
    TurnStart,
    Interrupt,
}

pub struct CodexAdapter {
    process: Option<ManagedProcess>,
    stdin: Option<ChildStdin>,
    lines_rx: Option<mpsc::Receiver<String>>,
    next_id: AtomicU64,
    pending: HashMap<u64, PendingKind>,
    thread_id: Option<String>,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self {
            process: None,
            stdin: None,
            lines_rx: None,
            next_id: AtomicU64::new(0),
            pending: HashMap::new(),
            thread_id: None,
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn write_stdin(&mut self, value: &Value) -> anyhow::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("codex adapter has no open stdin"))?;
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn handshake_read(reader: &mut Lines<BufReader<ChildStdout>>) -> anyhow::Result<Value> {
        let line = reader
            .next_line()
            .await?
            .ok_or_else(|| anyhow::anyhow!("codex app-server closed stdout during handshake"))?;
        Ok(serde_json::from_str(&line)?)
    }
}

#[async_trait]
impl AgentAdapter for CodexAdapter {
    async fn spawn(&mut self, ctx: &SpawnContext) -> anyhow::Result<()> {
        let mut command = Command::new(&ctx.binary);
        command.current_dir(&ctx.cwd).arg("app-server").args(&ctx.extra_args);

        let (process, stdin, stdout) = ManagedProcess::spawn(command)
            .map_err(|e| crate::error::SupervisorError::SpawnFailed {
                agent: "codex".to_string(),
                source: e,
            })?;
        self.process = Some(process);
        self.stdin = Some(stdin);

        let mut reader = BufReader::new(stdout).lines();

        self.write_stdin(&json!({
            "jsonrpc": "2.0", "id": self.alloc_id(),
            "method": "initialize",
            "params": {"clientInfo": {"name": "agendo-supervisor"}},
        }))
        .await?;
        Self::handshake_read(&mut reader).await?;

        let (method, params) = match &ctx.resume_ref {
            Some(thread_id) => ("thread/resume", json!({"thread_id": thread_id})),
            None => ("thread/start", json!({"cwd": ctx.cwd})),
        };
        let thread_req_id = self.alloc_id();
        self.write_stdin(&json!({"jsonrpc": "2.0", "id": thread_req_id, "method": method, "params": params}))
            .await?;
        let thread_resp = Self::handshake_read(&mut reader).await?;
        self.thread_id = thread_resp
            .get("result")
            .and_then(|r| r.get("thread_id"))
            .and_then(|t| t.as_str())
            .map(String::from)
            .or_else(|| ctx.resume_ref.clone());

        if !ctx.initial_prompt.is_empty() {
            let turn_id = self.alloc_id();
            self.pending.insert(turn_id, PendingKind::TurnStart);
            self.write_stdin(&json!({
                "jsonrpc": "2.0", "id": turn_id,
                "method": "turn/start",
                "params": {"thread_id": self.thread_id, "input": ctx.initial_prompt},
            }))
            .await?;
        }

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
        self.lines_rx = Some(rx);
        Ok(())
    }

    async fn send_message(&mut self, text: &str, _image_ref: Option<&str>) -> anyhow::Result<()> {
        let turn_id = self.alloc_id();
        self.pending.insert(turn_id, PendingKind::TurnStart);
        self.write_stdin(&json!({
            "jsonrpc": "2.0", "id": turn_id,
            "method": "turn/start",
            "params": {"thread_id": self.thread_id, "input": text},
        }))
        .await
    }

    async fn interrupt(&mut self) -> anyhow::Result<bool> {
        let id = self.alloc_id();
        self.pending.insert(id, PendingKind::Interrupt);
        self.write_stdin(&json!({
            "jsonrpc": "2.0", "id": id,
            "method": "turn/interrupt",
            "params": {"thread_id": self.thread_id},
        }))
        .await?;
        Ok(self.is_alive())
    }

    fn session_ref(&self) -> Option<String> {
        self.thread_id.clone()
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
        self.lines_rx.as_mut()?.recv().await
    }

    fn map_line(&mut self, line: &str) -> Vec<AgendoEventPayload> {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => return vec![],
        };

        if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
            if let Some(kind) = self.pending.remove(&id) {
                return match kind {
                    PendingKind::TurnStart => {
                        if let Some(err) = value.get("error") {
                            let message = err
                                .get("message")
                                .and_then(|m| m.as_str())
                                .unwrap_or("codex turn failed")
                                .to_string();
                            vec![AgendoEventPayload::SystemError { message }]
                        } else {
                            vec![]
                        }
                    }
                    PendingKind::Interrupt => vec![],
                };
            }
            return vec![];
        }

        let method = match value.get("method").and_then(|m| m.as_str()) {
            Some(m) => m,
            None => return vec![],
        };
        if method != "codex/event" {
            return vec![];
        }
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        let event_type = params.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match event_type {
            "agent_message_delta" => vec![AgendoEventPayload::AgentTextDelta {
                delta: text_field(&params, "delta"),
            }],
            "agent_reasoning_delta" => vec![AgendoEventPayload::AgentThinkingDelta {
                delta: text_field(&params, "delta"),
            }],
            "exec_command_begin" | "tool_call_begin" => vec![AgendoEventPayload::AgentToolStart {
                tool_use_id: text_field(&params, "call_id"),
                tool_name: text_field(&params, "tool_name"),
                input: params.get("input").cloned().unwrap_or(Value::Null),
            }],
            "exec_command_end" | "tool_call_end" => vec![AgendoEventPayload::AgentToolEnd {
                tool_use_id: text_field(&params, "call_id"),
                content: params.get("output").cloned().unwrap_or(Value::Null),
                duration_ms: params.get("duration_ms").and_then(|v| v.as_u64()),
                num_files: None,
                truncated: None,
                is_error: params.get("exit_code").and_then(|v| v.as_i64()).map(|code| code != 0),
            }],
            "task_complete" => vec![AgendoEventPayload::AgentResult {
                cost_usd: params
                    .get("usage")
                    .and_then(|u| u.get("cost_usd"))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0),
                turns: 1,
                duration_ms: params.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0),
                is_error: false,
                model_usage: Vec::<ModelUsage>::new(),
            }],
            "error" => vec![AgendoEventPayload::SystemError {
                message: text_field(&params, "message"),
            }],
            _ => vec![],
        }
    }
}

fn text_field(value: &Value, key: &str) -> String {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_message_delta_maps_to_text_delta() {
        let mut adapter = CodexAdapter::new();
        let line = r#"{"method":"codex/event","params":{"type":"agent_message_delta","delta":"hi"}}"#;
        let events = adapter.map_line(line);
        assert!(matches!(&events[0], AgendoEventPayload::AgentTextDelta { delta } if delta == "hi"));
    }

    #[test]
    fn tool_call_begin_and_end_round_trip_tool_use_id() {
        let mut adapter = CodexAdapter::new();
        let begin = r#"{"method":"codex/event","params":{"type":"tool_call_begin","call_id":"c1","tool_name":"shell","input":{"cmd":"ls"}}}"#;
        let end = r#"{"method":"codex/event","params":{"type":"tool_call_end","call_id":"c1","output":"ok"}}"#;
        let started = adapter.map_line(begin);
        let ended = adapter.map_line(end);
        match (&started[0], &ended[0]) {
            (
                AgendoEventPayload::AgentToolStart { tool_use_id: a, .. },
                AgendoEventPayload::AgentToolEnd { tool_use_id: b, .. },
            ) => assert_eq!(a, b),
            _ => panic!("unexpected payload shapes"),
        }
    }

    #[test]
    fn turn_start_error_response_maps_to_system_error() {
        let mut adapter = CodexAdapter::new();
        adapter.pending.insert(5, PendingKind::TurnStart);
        let line = r#"{"jsonrpc":"2.0","id":5,"error":{"message":"boom"}}"#;
        let events = adapter.map_line(line);
        assert!(matches!(&events[0], AgendoEventPayload::SystemError { message } if message == "boom"));
    }
}
