//! Per-session pub/sub. Generalizes the daemon's single global
//! `broadcast::Sender<String>` into one `events:<sessionId>` broadcast
//! channel and one `control:<sessionId>` mpsc channel per live session,
//! torn down when the Session Process exits.

use crate::events::{AgendoControl, AgendoEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

const EVENTS_CHANNEL_CAPACITY: usize = 1024;
const CONTROL_CHANNEL_CAPACITY: usize = 64;

struct SessionChannels {
    events_tx: broadcast::Sender<Arc<AgendoEvent>>,
    control_tx: mpsc::Sender<AgendoControl>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    sessions: Arc<RwLock<HashMap<String, SessionChannels>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once by the Session Process at startup. Returns the control
    /// receiver the process owns for its lifetime; the sender half is
    /// retained here so `send_control` can reach it.
    pub async fn register(&self, session_id: &str) -> mpsc::Receiver<AgendoControl> {
        let (events_tx, _rx) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        self.sessions.write().await.insert(
            session_id.to_string(),
            SessionChannels {
                events_tx,
                control_tx,
            },
        );
        control_rx
    }

    pub async fn unregister(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn publish(&self, session_id: &str, event: AgendoEvent) {
        let sessions = self.sessions.read().await;
        if let Some(ch) = sessions.get(session_id) {
            // No subscribers is not an error — the session may be running
            // unobserved between reconnects.
            let _ = ch.events_tx.send(Arc::new(event));
        }
    }

    pub async fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<Arc<AgendoEvent>>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|ch| ch.events_tx.subscribe())
    }

    pub async fn send_control(
        &self,
        session_id: &str,
        control: AgendoControl,
    ) -> Result<(), SendControlError> {
        let tx = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .map(|ch| ch.control_tx.clone())
                .ok_or(SendControlError::UnknownSession)?
        };
        tx.send(control)
            .await
            .map_err(|_| SendControlError::SessionGone)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendControlError {
    #[error("no such session is registered on the event bus")]
    UnknownSession,
    #[error("session process exited before the control message was delivered")]
    SessionGone,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AgendoEventPayload;
    use chrono::Utc;

    fn sample_event(session_id: &str, id: u64) -> AgendoEvent {
        AgendoEvent {
            id,
            session_id: session_id.to_string(),
            ts: Utc::now(),
            payload: AgendoEventPayload::AgentText {
                text: "hi".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let _control_rx = bus.register("s1").await;
        let mut a = bus.subscribe("s1").await.unwrap();
        let mut b = bus.subscribe("s1").await.unwrap();

        bus.publish("s1", sample_event("s1", 1)).await;

        assert_eq!(a.recv().await.unwrap().id, 1);
        assert_eq!(b.recv().await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn control_round_trips_to_registered_receiver() {
        let bus = EventBus::new();
        let mut control_rx = bus.register("s2").await;

        bus.send_control("s2", AgendoControl::Cancel).await.unwrap();
        let msg = control_rx.recv().await.unwrap();
        assert!(matches!(msg, AgendoControl::Cancel));
    }

    #[tokio::test]
    async fn control_to_unknown_session_errors() {
        let bus = EventBus::new();
        let err = bus.send_control("missing", AgendoControl::Cancel).await;
        assert!(matches!(err, Err(SendControlError::UnknownSession)));
    }

    #[tokio::test]
    async fn unregister_drops_subscribers() {
        let bus = EventBus::new();
        let _control_rx = bus.register("s3").await;
        bus.unregister("s3").await;
        assert!(bus.subscribe("s3").await.is_none());
    }
}
