//! Idle-timeout tracking and text/thinking delta batching, owned directly
//! by the Session Process task rather than spawned as a background worker
//! — the process already runs a `tokio::select!` loop, so plain mutable
//! state plus periodic timer ticks it already owns is simpler than the
//! `Arc<Mutex<..>>` the daemon reaches for when multiple tasks need the
//! same flag.

use std::time::{Duration, Instant};

pub const DELTA_FLUSH_INTERVAL: Duration = Duration::from_millis(200);

pub struct ActivityTracker {
    idle_timeout: Duration,
    last_activity: Instant,
    text_buffer: String,
    thinking_buffer: String,
}

impl ActivityTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            last_activity: Instant::now(),
            text_buffer: String::new(),
            thinking_buffer: String::new(),
        }
    }

    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) >= self.idle_timeout
    }

    pub fn idle_deadline(&self) -> Instant {
        self.last_activity + self.idle_timeout
    }

    pub fn push_text_delta(&mut self, delta: &str) {
        self.text_buffer.push_str(delta);
    }

    pub fn push_thinking_delta(&mut self, delta: &str) {
        self.thinking_buffer.push_str(delta);
    }

    /// Called on every 200ms tick; returns and clears whichever buffers are
    /// non-empty, in text-then-thinking order to match the ordering
    /// invariant that text always precedes the thinking block it follows
    /// within a single flush.
    pub fn take_due_deltas(&mut self) -> (Option<String>, Option<String>) {
        let text = if self.text_buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.text_buffer))
        };
        let thinking = if self.thinking_buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.thinking_buffer))
        };
        (text, thinking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_idle_false_immediately_after_activity() {
        let tracker = ActivityTracker::new(Duration::from_secs(60));
        assert!(!tracker.is_idle(Instant::now()));
    }

    #[test]
    fn is_idle_true_once_timeout_elapses() {
        let tracker = ActivityTracker::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(tracker.is_idle(Instant::now()));
    }

    #[test]
    fn delta_batching_accumulates_until_taken() {
        let mut tracker = ActivityTracker::new(Duration::from_secs(60));
        tracker.push_text_delta("Hel");
        tracker.push_text_delta("lo");
        let (text, thinking) = tracker.take_due_deltas();
        assert_eq!(text.as_deref(), Some("Hello"));
        assert!(thinking.is_none());

        let (text_again, _) = tracker.take_due_deltas();
        assert!(text_again.is_none(), "buffer must be cleared after taking");
    }
}
