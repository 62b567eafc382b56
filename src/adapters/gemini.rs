//! TTY-poll adapter: drives `gemini` inside a detached `tmux` session and
//! periodically diffs `capture-pane` output, for agent CLIs (like
//! `gemini`, per its daemon driver's own `supports_sessions()` probe
//! returning false for the common case) that speak neither NDJSON nor
//! JSON-RPC. No pack example spawns `tmux` directly; this is synthesized
//! from the daemon's general `Command`-spawning idiom (seen in its
//! `gemini.rs` one-shot driver and `codex_appserver.rs`'s piped-child
//! setup) plus the literal `send-keys`/`capture-pane` protocol the
//! supervision layer requires.

use super::{AgentAdapter, SpawnContext};
use crate::events::AgendoEventPayload;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;

const POLL_INTERVAL: Duration = Duration::from_millis(400);
const SCROLLBACK_LINES: u32 = 2000;

pub struct GeminiAdapter {
    tmux_session: Option<String>,
    lines_rx: Option<mpsc::Receiver<String>>,
    alive: Arc<AtomicBool>,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self {
            tmux_session: None,
            lines_rx: None,
            alive: Arc::new(AtomicBool::new(false)),
        }
    }

    fn session_name(&self) -> anyhow::Result<&str> {
        self.tmux_session
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("gemini adapter has not been spawned yet"))
    }

    async fn tmux(&self, args: &[&str]) -> anyhow::Result<()> {
        let status = Command::new("tmux")
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux {:?} exited with {:?}", args, status.code());
        }
        Ok(())
    }

    async fn capture_pane(session: &str) -> anyhow::Result<String> {
        let output = Command::new("tmux")
            .args([
                "capture-pane",
                "-p",
                "-t",
                session,
                "-S",
                &format!("-{SCROLLBACK_LINES}"),
            ])
            .output()
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl AgentAdapter for GeminiAdapter {
    async fn spawn(&mut self, ctx: &SpawnContext) -> anyhow::Result<()> {
        let session_name = format!("agendo-{}", ctx.session_id);
        let mut launch_cmd = ctx.binary.clone();
        for arg in &ctx.extra_args {
            launch_cmd.push(' ');
            launch_cmd.push_str(arg);
        }

        let status = Command::new("tmux")
            .args(["new-session", "-d", "-s", &session_name, "-x", "220", "-y", "50", &launch_cmd])
            .current_dir(&ctx.cwd)
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("failed to launch tmux session {session_name}");
        }
        self.tmux_session = Some(session_name.clone());
        self.alive.store(true, Ordering::SeqCst);

        let alive = self.alive.clone();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut last = String::new();
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                let has_session = Command::new("tmux")
                    .args(["has-session", "-t", &session_name])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map(|s| s.success())
                    .unwrap_or(false);
                if !has_session {
                    alive.store(false, Ordering::SeqCst);
                    break;
                }
                let current = match GeminiAdapter::capture_pane(&session_name).await {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if current.len() > last.len() && current.starts_with(last.as_str()) {
                    let delta = &current[last.len()..];
                    if !delta.trim().is_empty() && tx.send(delta.to_string()).await.is_err() {
                        break;
                    }
                } else if current != last {
                    // Pane scrolled or was cleared; ship the full redraw rather
                    // than lose content to a bad diff.
                    if tx.send(current.clone()).await.is_err() {
                        break;
                    }
                }
                last = current;
            }
        });
        self.lines_rx = Some(rx);

        if ctx.initial_prompt.is_empty() {
            return Ok(());
        }
        self.send_message(&ctx.initial_prompt, None).await
    }

    async fn send_message(&mut self, text: &str, _image_ref: Option<&str>) -> anyhow::Result<()> {
        let session = self.session_name()?.to_string();
        self.tmux(&["send-keys", "-t", &session, "-l", text]).await?;
        self.tmux(&["send-keys", "-t", &session, "Enter"]).await
    }

    async fn interrupt(&mut self) -> anyhow::Result<bool> {
        let session = self.session_name()?.to_string();
        self.tmux(&["send-keys", "-t", &session, "C-c"]).await?;
        Ok(self.is_alive())
    }

    fn session_ref(&self) -> Option<String> {
        self.tmux_session.clone()
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        if let Some(session) = &self.tmux_session {
            let _ = self.tmux(&["kill-session", "-t", session]).await;
        }
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn next_line(&mut self) -> Option<String> {
        self.lines_rx.as_mut()?.recv().await
    }

    fn map_line(&mut self, line: &str) -> Vec<AgendoEventPayload> {
        if line.trim().is_empty() {
            return vec![];
        }
        vec![AgendoEventPayload::AgentTextDelta {
            delta: line.to_string(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_pane_delta_yields_no_event() {
        let mut adapter = GeminiAdapter::new();
        assert!(adapter.map_line("   \n").is_empty());
    }

    #[test]
    fn pane_text_maps_to_text_delta() {
        let mut adapter = GeminiAdapter::new();
        let events = adapter.map_line("Generating response...");
        assert!(matches!(&events[0], AgendoEventPayload::AgentTextDelta { delta } if delta == "Generating response..."));
    }

    #[test]
    fn session_ref_is_none_before_spawn() {
        let adapter = GeminiAdapter::new();
        assert!(adapter.session_ref().is_none());
        assert!(!adapter.is_alive());
    }
}
