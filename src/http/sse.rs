//! `GET /sessions/:id/events` — Server-Sent Events bridge. Grounded on the
//! daemon's `rest/sse.rs`, simplified because each session already has its
//! own broadcast channel (no need to filter a shared stream by session id).

use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures_util::{stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;

use crate::AppContext;

type BoxEventStream = futures_util::stream::BoxStream<'static, Result<Event, Infallible>>;

pub async fn session_events_sse(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let body: BoxEventStream = match ctx.session_manager.subscribe(&session_id).await {
        Ok(rx) => {
            let mapped = BroadcastStream::new(rx).filter_map(|item| async move {
                let event = item.ok()?;
                let kind = event_type_name(&event);
                let data = serde_json::to_string(&*event).unwrap_or_default();
                Some(Ok(Event::default().event(kind).data(data)))
            });
            Box::pin(mapped)
        }
        Err(e) => Box::pin(stream::once(async move {
            Ok(Event::default().event("error").data(e.to_string()))
        })),
    };

    Sse::new(body).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

fn event_type_name(event: &crate::events::AgendoEvent) -> &'static str {
    use crate::events::AgendoEventPayload::*;
    match &event.payload {
        SessionInit { .. } => "session:init",
        SessionState { .. } => "session:state",
        AgentText { .. } => "agent:text",
        AgentTextDelta { .. } => "agent:text-delta",
        AgentThinking { .. } => "agent:thinking",
        AgentThinkingDelta { .. } => "agent:thinking-delta",
        AgentToolStart { .. } => "agent:tool-start",
        AgentToolEnd { .. } => "agent:tool-end",
        AgentResult { .. } => "agent:result",
        AgentActivity { .. } => "agent:activity",
        AgentToolApproval { .. } => "agent:tool-approval",
        AgentAskUser { .. } => "agent:ask-user",
        UserMessage { .. } => "user:message",
        SystemInfo { .. } => "system:info",
        SystemError { .. } => "system:error",
        SystemRateLimit { .. } => "system:rate-limit",
        SystemMcpStatus { .. } => "system:mcp-status",
        TeamMessage { .. } => "team:message",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AgendoEvent, AgendoEventPayload, PermissionMode};
    use chrono::Utc;

    fn wrap(payload: AgendoEventPayload) -> AgendoEvent {
        AgendoEvent {
            id: 1,
            session_id: "s1".to_string(),
            ts: Utc::now(),
            payload,
        }
    }

    #[test]
    fn event_type_name_matches_the_wire_protocol_tags() {
        assert_eq!(
            event_type_name(&wrap(AgendoEventPayload::AgentText { text: "hi".into() })),
            "agent:text"
        );
        assert_eq!(
            event_type_name(&wrap(AgendoEventPayload::SessionState {
                status: crate::events::SessionStatus::Active
            })),
            "session:state"
        );
        assert_eq!(
            event_type_name(&wrap(AgendoEventPayload::SessionInit {
                session_ref: "r1".into(),
                slash_commands: vec![],
                mcp_servers: vec![],
                model: "claude-opus".into(),
                cwd: "/tmp".into(),
                tools: vec![],
                permission_mode: PermissionMode::Default,
            })),
            "session:init"
        );
        assert_eq!(
            event_type_name(&wrap(AgendoEventPayload::AgentAskUser {
                request_id: "q1".into(),
                questions: vec![],
            })),
            "agent:ask-user"
        );
    }
}
