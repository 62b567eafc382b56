//! Push-notification seam: a session transitioning into `awaiting_input`
//! or `ended` may need to wake something outside this process (a mobile
//! push, a Slack ping). The supervisor only owns the decision of *when* to
//! notify; delivery is somebody else's concern, expressed here as a trait
//! so tests can assert on what would have been sent without a real
//! transport.

use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PushNotification {
    pub session_id: String,
    pub title: String,
    pub body: String,
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, notification: PushNotification);
}

/// Default no-op notifier — used when no transport is configured.
pub struct NullPushNotifier;

#[async_trait]
impl PushNotifier for NullPushNotifier {
    async fn notify(&self, _notification: PushNotification) {}
}

/// Logs what would have been sent. Useful standalone and in integration
/// tests that want to observe notification decisions without wiring a
/// real push transport.
pub struct LoggingPushNotifier;

#[async_trait]
impl PushNotifier for LoggingPushNotifier {
    async fn notify(&self, notification: PushNotification) {
        info!(
            session_id = %notification.session_id,
            title = %notification.title,
            "push notification"
        );
    }
}
