//! Collaboration seam with an external durable work queue. The supervisor
//! never implements durability itself — this trait is the boundary an
//! out-of-process scheduler pushes session-start work through, and the
//! in-memory implementation here exists for tests and for running the
//! supervisor standalone.

use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct QueuedClaim {
    pub session_id: String,
    pub kind: String,
    pub initial_prompt: String,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn push(&self, claim: QueuedClaim);
    async fn pop(&self) -> Option<QueuedClaim>;
    async fn len(&self) -> usize;
}

#[derive(Default)]
pub struct InMemoryWorkQueue {
    items: Mutex<VecDeque<QueuedClaim>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn push(&self, claim: QueuedClaim) {
        self.items.lock().await.push_back(claim);
    }

    async fn pop(&self) -> Option<QueuedClaim> {
        self.items.lock().await.pop_front()
    }

    async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_ordering() {
        let q = InMemoryWorkQueue::new();
        q.push(QueuedClaim {
            session_id: "a".into(),
            kind: "claude".into(),
            initial_prompt: "1".into(),
        })
        .await;
        q.push(QueuedClaim {
            session_id: "b".into(),
            kind: "claude".into(),
            initial_prompt: "2".into(),
        })
        .await;
        assert_eq!(q.pop().await.unwrap().session_id, "a");
        assert_eq!(q.pop().await.unwrap().session_id, "b");
        assert!(q.pop().await.is_none());
    }
}
