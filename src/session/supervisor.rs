//! The Session Process: one actor task per running session, single-owner
//! of its `ApprovalManager` and `ActivityTracker` so neither needs a lock.
//! Generalizes the daemon's per-provider `event_loop()` (previously one
//! function per runner, reading NDJSON lines and updating shared state
//! directly) into one loop driven by the `AgentAdapter` trait, with a
//! `tokio::select!` over the adapter's output, inbound control messages,
//! and the idle/heartbeat/health/delta timers the daemon split across
//! several background tasks.

use super::runner::RunnerDeps;
use crate::activity::{ActivityTracker, DELTA_FLUSH_INTERVAL};
use crate::adapters::{AgentAdapter, SpawnContext};
use crate::approval::{ApprovalManager, Gate, ToolUseTracker};
use crate::events::{
    AgendoControl, AgendoEvent, AgendoEventPayload, ApprovalDecision, PermissionMode, SessionStatus,
};
use crate::log_writer::{LogStream, LogWriter};
use crate::push::PushNotification;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

/// What the actor loop decided when it stopped: either the session is
/// genuinely over, or a permission-mode/model/clear-context change landed
/// on an adapter that can't apply it live, and the Session Runner needs to
/// kill and respawn the process to pick it up.
pub enum RunOutcome {
    Ended,
    Restart {
        resume_ref: Option<String>,
        permission_mode: PermissionMode,
        model: Option<String>,
        clear_context: bool,
    },
}

enum EndReason {
    Cancelled,
    /// Graceful shutdown (§5/§9): unlike `Cancelled`, `finish()` leaves the
    /// row resumable (`idle`) instead of marking it `ended`.
    Terminated,
    AdapterExited,
    Idle,
    SpawnFailed,
    Restart {
        permission_mode: PermissionMode,
        model: Option<String>,
        clear_context: bool,
    },
}

pub async fn run(
    deps: RunnerDeps,
    session_id: String,
    mut adapter: Box<dyn AgentAdapter>,
    ctx: SpawnContext,
) -> RunOutcome {
    let log_writer = LogWriter::new(deps.config.log_dir(), session_id.clone());
    let mut approval_mgr = ApprovalManager::with_timeout(Duration::from_secs(
        deps.config.approval_timeout_sec,
    ));
    let mut tracker = ToolUseTracker::new();
    if let Ok(row) = deps.storage.get_session(&session_id).await {
        approval_mgr.seed_allowlist(row.allowed_tools());
    }
    let mut activity = ActivityTracker::new(Duration::from_secs(
        deps.storage
            .get_session(&session_id)
            .await
            .map(|r| r.idle_timeout_sec as u64)
            .unwrap_or(1800),
    ));

    if let Err(e) = adapter.spawn(&ctx).await {
        error!(session_id, error = %e, "failed to spawn agent process");
        let _ = deps
            .storage
            .update_status(&session_id, SessionStatus::Ended)
            .await;
        return finish(&deps, &session_id, EndReason::SpawnFailed)
            .await
            .into_outcome(&mut adapter)
            .await;
    }
    let _ = deps.storage.set_pid(&session_id, adapter.pid()).await;
    let _ = deps
        .storage
        .set_log_file_path(&session_id, &log_writer.expected_path().display().to_string())
        .await;
    if ctx.permission_mode == PermissionMode::Plan {
        let _ = deps
            .storage
            .set_plan_file_path(&session_id, &log_writer.plan_path().display().to_string())
            .await;
    }
    let _ = deps
        .storage
        .update_status(&session_id, SessionStatus::Active)
        .await;

    let mut control_rx = deps.event_bus.register(&session_id).await;
    let mut session_ref_published = false;

    let mut heartbeat = tokio::time::interval(Duration::from_secs(deps.config.heartbeat_interval_sec));
    let mut mcp_health = tokio::time::interval(Duration::from_secs(deps.config.mcp_health_interval_sec));
    let mut delta_flush = tokio::time::interval(DELTA_FLUSH_INTERVAL);
    let mut approval_sweep = tokio::time::interval(Duration::from_secs(5));

    let end_reason = loop {
        let idle_sleep = tokio::time::sleep_until(activity.idle_deadline().into());

        tokio::select! {
            line = adapter.next_line() => {
                match line {
                    Some(line) => {
                        let _ = log_writer.append(LogStream::Stdout, &line).await;
                        activity.record_activity();
                        let _ = deps.storage.touch_activity(&session_id).await;

                        if !session_ref_published {
                            if let Some(session_ref) = adapter.session_ref() {
                                let _ = deps.storage.set_session_ref(&session_id, &session_ref).await;
                                publish(&deps, &session_id, AgendoEventPayload::SessionInit {
                                    session_ref,
                                    slash_commands: vec![],
                                    mcp_servers: vec![],
                                    model: ctx.model.clone().unwrap_or_default(),
                                    cwd: ctx.cwd.display().to_string(),
                                    tools: vec![],
                                    permission_mode: ctx.permission_mode,
                                }).await;
                                session_ref_published = true;
                            }
                        }

                        let payloads = adapter.map_line(&line);
                        let mut maybe_end = None;
                        for payload in payloads {
                            if let Some(reason) = handle_payload(
                                &deps, &session_id, &mut *adapter, &mut approval_mgr,
                                &mut activity, &mut tracker, payload,
                            ).await {
                                maybe_end = Some(reason);
                            }
                        }
                        if let Some(reason) = maybe_end {
                            break reason;
                        }
                    }
                    None => break EndReason::AdapterExited,
                }
            }
            control = control_rx.recv() => {
                match control {
                    Some(control) => {
                        if let Some(reason) = handle_control(
                            &deps, &session_id, &ctx, &mut *adapter, &mut approval_mgr,
                            &mut activity, &mut tracker, control,
                        ).await {
                            break reason;
                        }
                    }
                    None => break EndReason::Cancelled,
                }
            }
            _ = idle_sleep => {
                if activity.is_idle(std::time::Instant::now()) {
                    break EndReason::Idle;
                }
            }
            _ = heartbeat.tick() => {
                let _ = deps.storage.record_heartbeat(&session_id).await;
                // Silent-crash detector (§4.4): a null-signal probe on the
                // agent subprocess. Breaking the select loop here is the
                // idempotency guard — once this fires the loop ends and the
                // tick can never fire again for this session.
                if !adapter.is_alive() {
                    warn!(session_id, "heartbeat probe found agent process no longer alive");
                    break EndReason::AdapterExited;
                }
            }
            _ = mcp_health.tick() => {
                // The only MCP server a session knows about is the one this
                // supervisor itself wrote to `.agendo/mcp.json`; there is no
                // remote server to probe, so this tick currently just keeps
                // the interval alive for a future multi-server config.
            }
            _ = delta_flush.tick() => {
                let (text, thinking) = activity.take_due_deltas();
                if let Some(delta) = text {
                    publish(&deps, &session_id, AgendoEventPayload::AgentTextDelta { delta }).await;
                }
                if let Some(delta) = thinking {
                    publish(&deps, &session_id, AgendoEventPayload::AgentThinkingDelta { delta }).await;
                }
            }
            _ = approval_sweep.tick() => {
                for (tool_name, tool_use_id, approval_id) in approval_mgr.expire(std::time::Instant::now()) {
                    warn!(session_id, tool_name, approval_id, "approval timed out, auto-denying");
                    let _ = adapter.resolve_approval(&tool_use_id, ApprovalDecision::Deny, None).await;
                }
            }
        }
    };

    finish(&deps, &session_id, end_reason)
        .await
        .into_outcome(&mut adapter)
        .await
}

/// A payload the Session Process itself decided to emit or react to — may
/// require registering/resolving an approval, flipping session status, or
/// requesting the loop end.
async fn handle_payload(
    deps: &RunnerDeps,
    session_id: &str,
    adapter: &mut dyn AgentAdapter,
    approval_mgr: &mut ApprovalManager,
    activity: &mut ActivityTracker,
    tracker: &mut ToolUseTracker,
    payload: AgendoEventPayload,
) -> Option<EndReason> {
    match payload {
        AgendoEventPayload::AgentTextDelta { delta } => {
            activity.push_text_delta(&delta);
            None
        }
        AgendoEventPayload::AgentThinkingDelta { delta } => {
            activity.push_thinking_delta(&delta);
            None
        }
        AgendoEventPayload::AgentToolStart { tool_use_id, tool_name, input } => {
            tracker.start(&tool_use_id);
            publish(
                deps,
                session_id,
                AgendoEventPayload::AgentToolStart { tool_use_id, tool_name, input },
            )
            .await;
            None
        }
        AgendoEventPayload::AgentToolEnd {
            tool_use_id,
            content,
            duration_ms,
            num_files,
            truncated,
            is_error,
        } => {
            // §4.3's generic interactive-tool detection rule: an errored
            // tool_result on a still-active id means the agent is actually
            // blocked on something a human needs to resolve, not that the
            // tool call is done — suppress the ordinary tool-end and park
            // the id as pending-human-response instead.
            if is_error == Some(true) && tracker.is_active(&tool_use_id) {
                tracker.mark_pending_human_response(&tool_use_id);
                let _ = deps
                    .storage
                    .update_status(session_id, crate::events::SessionStatus::AwaitingInput)
                    .await;
                None
            } else {
                tracker.finish(&tool_use_id);
                publish(
                    deps,
                    session_id,
                    AgendoEventPayload::AgentToolEnd {
                        tool_use_id,
                        content,
                        duration_ms,
                        num_files,
                        truncated,
                        is_error,
                    },
                )
                .await;
                None
            }
        }
        AgendoEventPayload::AgentToolApproval {
            approval_id: correlation_id,
            tool_name,
            tool_input,
        } => {
            // The adapter's `approval_id` here is really its own wire-protocol
            // correlation id (Claude's `request_id`, Codex's `call_id`) — the
            // manager mints the externally-visible approval id that goes out
            // over the event bus, keeping that id stable across adapters.
            let bypass = approval_mgr_bypasses_by_mode(deps, session_id).await;
            let gate = approval_mgr.gate(&tool_name, bypass);
            let (approval_id, evicted) =
                approval_mgr.register(&tool_name, &correlation_id, tool_input.clone());
            if let Some((_evicted_approval_id, evicted_correlation_id)) = evicted {
                let _ = adapter
                    .resolve_approval(&evicted_correlation_id, ApprovalDecision::Deny, None)
                    .await;
            }

            match gate {
                Gate::AutoAllow => {
                    approval_mgr.resolve(&approval_id);
                    let _ = adapter
                        .resolve_approval(&correlation_id, ApprovalDecision::Allow, None)
                        .await;
                }
                Gate::NeedsApproval => {
                    let _ = deps
                        .storage
                        .update_status(session_id, crate::events::SessionStatus::AwaitingInput)
                        .await;
                    publish(
                        deps,
                        session_id,
                        AgendoEventPayload::AgentToolApproval {
                            approval_id,
                            tool_name,
                            tool_input,
                        },
                    )
                    .await;
                }
            }
            None
        }
        AgendoEventPayload::AgentAskUser { request_id, questions } => {
            let _ = deps
                .storage
                .update_status(session_id, crate::events::SessionStatus::AwaitingInput)
                .await;
            publish(
                deps,
                session_id,
                AgendoEventPayload::AgentAskUser { request_id, questions },
            )
            .await;
            None
        }
        AgendoEventPayload::AgentResult {
            cost_usd,
            turns,
            duration_ms,
            is_error,
            model_usage,
        } => {
            let _ = deps.storage.record_result(session_id, cost_usd, turns).await;
            // The process is still resident and its stdin stays open for a
            // follow-up turn — `Idle` is reserved for after the process has
            // actually exited (see the kill-flag table in `finish`).
            let _ = deps
                .storage
                .update_status(session_id, crate::events::SessionStatus::AwaitingInput)
                .await;
            publish(
                deps,
                session_id,
                AgendoEventPayload::AgentResult {
                    cost_usd,
                    turns,
                    duration_ms,
                    is_error,
                    model_usage,
                },
            )
            .await;
            None
        }
        other => {
            publish(deps, session_id, other).await;
            None
        }
    }
}

async fn approval_mgr_bypasses_by_mode(deps: &RunnerDeps, session_id: &str) -> bool {
    deps.storage
        .get_session(session_id)
        .await
        .map(|r| r.permission_mode() != PermissionMode::Default)
        .unwrap_or(false)
}

async fn handle_control(
    deps: &RunnerDeps,
    session_id: &str,
    ctx: &SpawnContext,
    adapter: &mut dyn AgentAdapter,
    approval_mgr: &mut ApprovalManager,
    activity: &mut ActivityTracker,
    tracker: &mut ToolUseTracker,
    control: AgendoControl,
) -> Option<EndReason> {
    match control {
        AgendoControl::Cancel => {
            interrupt_in_flight_work(deps, session_id, adapter, approval_mgr, tracker).await;
            Some(EndReason::Cancelled)
        }
        AgendoControl::Terminate => {
            interrupt_in_flight_work(deps, session_id, adapter, approval_mgr, tracker).await;
            Some(EndReason::Terminated)
        }
        AgendoControl::Interrupt => {
            let _ = adapter.interrupt().await;
            None
        }
        AgendoControl::Message { text, image_ref } => {
            activity.record_activity();
            let _ = deps
                .storage
                .update_status(session_id, crate::events::SessionStatus::Active)
                .await;
            publish(deps, session_id, AgendoEventPayload::UserMessage { text: text.clone() }).await;
            let _ = adapter.send_message(&text, image_ref.as_deref()).await;
            None
        }
        AgendoControl::Redirect { new_prompt } => {
            activity.record_activity();
            publish(
                deps,
                session_id,
                AgendoEventPayload::UserMessage {
                    text: new_prompt.clone(),
                },
            )
            .await;
            let _ = adapter.send_message(&new_prompt, None).await;
            None
        }
        AgendoControl::ToolApproval {
            approval_id,
            decision,
            updated_input,
            post_approval_mode,
            post_approval_compact,
            clear_context_restart,
        } => {
            if let Some((tool_name, tool_use_id)) = approval_mgr.resolve(&approval_id) {
                let _ = adapter
                    .resolve_approval(&tool_use_id, decision, updated_input)
                    .await;
                if decision == ApprovalDecision::AllowSession {
                    approval_mgr.allow_session(&tool_name);
                    let _ = deps.storage.allow_tool(session_id, &tool_name).await;
                }
                let _ = deps
                    .storage
                    .update_status(session_id, crate::events::SessionStatus::Active)
                    .await;
                let _ = post_approval_compact; // compaction is out of this session's scope; recorded for forward-compat
                if clear_context_restart {
                    return Some(EndReason::Restart {
                        permission_mode: post_approval_mode.unwrap_or(ctx.permission_mode),
                        model: ctx.model.clone(),
                        clear_context: true,
                    });
                }
                if let Some(mode) = post_approval_mode {
                    return apply_permission_mode(deps, session_id, ctx, adapter, mode).await;
                }
            } else {
                warn!(session_id, approval_id, "tool-approval control for unknown/expired approval ignored");
            }
            None
        }
        AgendoControl::ToolResult { tool_use_id, content } => {
            let _ = adapter.send_tool_result(&tool_use_id, &content).await;
            None
        }
        AgendoControl::AnswerQuestion { request_id, answers } => {
            let _ = deps
                .storage
                .update_status(session_id, crate::events::SessionStatus::Active)
                .await;
            let _ = adapter
                .send_tool_result(&request_id, &json!({"answers": answers}))
                .await;
            None
        }
        AgendoControl::SetPermissionMode { mode } => {
            apply_permission_mode(deps, session_id, ctx, adapter, mode).await
        }
        AgendoControl::SetModel { model } => match adapter.set_model(&model).await {
            Ok(true) => {
                publish(
                    deps,
                    session_id,
                    AgendoEventPayload::SystemInfo {
                        message: format!("Model changed to {model}"),
                    },
                )
                .await;
                None
            }
            _ => Some(EndReason::Restart {
                permission_mode: ctx.permission_mode,
                model: Some(model),
                clear_context: false,
            }),
        },
    }
}

/// Shared by `Cancel` and `Terminate`: deny every pending approval so the
/// adapter's `resolve_approval` callers unblock (§4.2 invariant), and report
/// every still-active tool call as interrupted (P4) rather than leaving it
/// dangling when the process is about to die.
async fn interrupt_in_flight_work(
    deps: &RunnerDeps,
    session_id: &str,
    adapter: &mut dyn AgentAdapter,
    approval_mgr: &mut ApprovalManager,
    tracker: &mut ToolUseTracker,
) {
    for (_, tool_use_id, _) in approval_mgr.drain() {
        let _ = adapter.resolve_approval(&tool_use_id, ApprovalDecision::Deny, None).await;
    }
    for tool_use_id in tracker.interrupt_all() {
        publish(
            deps,
            session_id,
            AgendoEventPayload::AgentToolEnd {
                tool_use_id,
                content: json!("[Interrupted by user]"),
                duration_ms: None,
                num_files: None,
                truncated: None,
                is_error: None,
            },
        )
        .await;
    }
}

async fn apply_permission_mode(
    deps: &RunnerDeps,
    session_id: &str,
    ctx: &SpawnContext,
    adapter: &mut dyn AgentAdapter,
    mode: PermissionMode,
) -> Option<EndReason> {
    let _ = deps.storage.set_permission_mode(session_id, mode).await;
    match adapter.set_permission_mode(mode).await {
        Ok(true) => {
            publish(
                deps,
                session_id,
                AgendoEventPayload::SystemInfo {
                    message: format!("Permission mode changed to {}", mode.label()),
                },
            )
            .await;
            None
        }
        _ => Some(EndReason::Restart {
            permission_mode: mode,
            model: ctx.model.clone(),
            clear_context: false,
        }),
    }
}

async fn publish(deps: &RunnerDeps, session_id: &str, payload: AgendoEventPayload) {
    let seq = match deps.storage.next_event_seq(session_id).await {
        Ok(s) => s,
        Err(e) => {
            error!(session_id, error = %e, "failed to allocate event sequence number");
            return;
        }
    };
    let event = AgendoEvent {
        id: seq,
        session_id: session_id.to_string(),
        ts: Utc::now(),
        payload,
    };
    deps.event_bus.publish(session_id, event).await;
}

/// Tail-end bookkeeping shared by every exit path: figure out whether this
/// was a restart-worthy reason or a genuine end, and if the latter, mark
/// the storage row ended, notify, and unregister from the event bus.
struct FinishedReason(EndReason);

impl FinishedReason {
    async fn into_outcome(self, adapter: &mut Box<dyn AgentAdapter>) -> RunOutcome {
        match self.0 {
            EndReason::Restart {
                permission_mode,
                model,
                clear_context,
            } => {
                let resume_ref = if clear_context { None } else { adapter.session_ref() };
                let _ = adapter.kill().await;
                RunOutcome::Restart {
                    resume_ref,
                    permission_mode,
                    model,
                    clear_context,
                }
            }
            _ => {
                // Cancel/Terminate/Idle/AdapterExited/SpawnFailed all end
                // the actor loop for good — none of them may leave the
                // agent subprocess (or its tmux session) running unkilled.
                let _ = adapter.kill().await;
                RunOutcome::Ended
            }
        }
    }
}

async fn finish(deps: &RunnerDeps, session_id: &str, reason: EndReason) -> FinishedReason {
    match &reason {
        EndReason::Restart { .. } => {
            info!(session_id, "session restarting to apply a live-unsupported change");
        }
        EndReason::Terminated => {
            // Graceful shutdown forces `idle`, not `ended` — the row stays
            // resumable across the supervisor restart that triggered this.
            let _ = deps
                .storage
                .update_status(session_id, SessionStatus::Idle)
                .await;
            let _ = deps.storage.set_pid(session_id, None).await;
            deps.event_bus.unregister(session_id).await;
        }
        _ => {
            let _ = deps.storage.update_status(session_id, SessionStatus::Ended).await;
            let _ = deps.storage.end_session(session_id).await;
            deps.event_bus.unregister(session_id).await;
            deps.push
                .notify(PushNotification {
                    session_id: session_id.to_string(),
                    title: "Session ended".to_string(),
                    body: match &reason {
                        EndReason::Cancelled => "Cancelled by user".to_string(),
                        EndReason::AdapterExited => "Agent process exited".to_string(),
                        EndReason::Idle => "Idle timeout".to_string(),
                        EndReason::SpawnFailed => "Failed to start agent process".to_string(),
                        _ => unreachable!(),
                    },
                })
                .await;
        }
    }
    FinishedReason(reason)
}
