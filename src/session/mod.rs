//! Public API surface for everything session-shaped: creating, listing,
//! steering, and draining. Grounded on the daemon's `SessionManager`,
//! which owned a `HashMap<String, JoinHandle<_>>` of live runs and
//! branched `send_message` on whether a session was already running;
//! generalized here to cover resume-from-idle across all three agent
//! kinds instead of one provider's one-shot-per-call shape.

pub mod runner;
pub mod supervisor;

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::event_bus::EventBus;
use crate::events::{AgendoControl, AgendoEvent, ApprovalDecision, PermissionMode};
use crate::push::PushNotifier;
use crate::queue::WorkQueue;
use crate::storage::{NewSession, SessionRow, Storage};
use runner::RunnerDeps;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub struct SessionManager {
    storage: Storage,
    event_bus: EventBus,
    config: Arc<SupervisorConfig>,
    queue: Arc<dyn WorkQueue>,
    push: Arc<dyn PushNotifier>,
    live: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        storage: Storage,
        event_bus: EventBus,
        config: Arc<SupervisorConfig>,
        queue: Arc<dyn WorkQueue>,
        push: Arc<dyn PushNotifier>,
    ) -> Self {
        Self {
            storage,
            event_bus,
            config,
            queue,
            push,
            live: RwLock::new(HashMap::new()),
        }
    }

    fn runner_deps(&self) -> RunnerDeps {
        RunnerDeps {
            storage: self.storage.clone(),
            event_bus: self.event_bus.clone(),
            config: self.config.clone(),
            push: self.push.clone(),
        }
    }

    /// Start a brand new session. Rejects unknown agent kinds and enforces
    /// `max_sessions` before the row is even created, so a capacity error
    /// never leaves behind a half-claimed row.
    pub async fn create_session(
        &self,
        kind: String,
        cwd: PathBuf,
        initial_prompt: String,
        model: Option<String>,
        permission_mode: PermissionMode,
    ) -> Result<String> {
        runner::validate_kind(&kind)?;
        let running = self.storage.count_running().await?;
        if running >= self.config.max_sessions {
            return Err(SupervisorError::AtCapacity {
                running,
                max: self.config.max_sessions,
            });
        }

        let id = Uuid::new_v4().to_string();
        self.storage
            .create_session(NewSession {
                id: id.clone(),
                kind: kind.clone(),
                cwd: cwd.display().to_string(),
                idle_timeout_sec: self.config.idle_timeout_sec as i64,
                permission_mode,
                model,
                initial_prompt: initial_prompt.clone(),
            })
            .await?;

        let handle = runner::spawn(self.runner_deps(), id.clone(), kind, cwd, Some(initial_prompt)).await?;
        self.live.write().await.insert(id.clone(), handle);
        Ok(id)
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionRow> {
        self.storage.get_session(id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        self.storage.list_sessions().await
    }

    pub async fn subscribe(
        &self,
        id: &str,
    ) -> Result<tokio::sync::broadcast::Receiver<Arc<AgendoEvent>>> {
        self.event_bus
            .subscribe(id)
            .await
            .ok_or_else(|| SupervisorError::SessionNotFound(id.to_string()))
    }

    pub async fn cancel_session(&self, id: &str) -> Result<()> {
        self.send_control_or_not_found(id, AgendoControl::Cancel).await
    }

    pub async fn interrupt_session(&self, id: &str) -> Result<()> {
        self.send_control_or_not_found(id, AgendoControl::Interrupt).await
    }

    /// Deliver a new user turn. A session whose actor task is actually
    /// still running gets it over the control channel; anything else
    /// (never spawned, or its task already finished) gets resumed from
    /// scratch through the runner, reusing its stored `cwd` and
    /// `session_ref`. This checks the live `JoinHandle` rather than the
    /// persisted `status` column deliberately — the row is briefly
    /// persisted as `awaiting_input`/`idle` while the process is still
    /// resident (see [`crate::session::supervisor`]'s transition table),
    /// so trusting `status` here would spawn a second process racing the
    /// first one for the same session id.
    pub async fn send_message(&self, id: &str, text: String, image_ref: Option<String>) -> Result<()> {
        let is_live = {
            let live = self.live.read().await;
            live.get(id).map(|h| !h.is_finished()).unwrap_or(false)
        };
        if is_live {
            return self
                .event_bus
                .send_control(id, AgendoControl::Message { text, image_ref })
                .await
                .map_err(|e| SupervisorError::Other(e.into()));
        }

        let row = self.storage.get_session(id).await?;
        self.live.write().await.remove(id);
        let cwd = PathBuf::from(&row.cwd);
        let handle = runner::spawn(self.runner_deps(), id.to_string(), row.kind.clone(), cwd, Some(text)).await?;
        self.live.write().await.insert(id.to_string(), handle);
        Ok(())
    }

    pub async fn resolve_approval(
        &self,
        id: &str,
        approval_id: String,
        decision: ApprovalDecision,
        updated_input: Option<serde_json::Value>,
        post_approval_mode: Option<PermissionMode>,
        clear_context_restart: bool,
    ) -> Result<()> {
        self.send_control_or_not_found(
            id,
            AgendoControl::ToolApproval {
                approval_id,
                decision,
                updated_input,
                post_approval_mode,
                post_approval_compact: false,
                clear_context_restart,
            },
        )
        .await
    }

    pub async fn answer_question(&self, id: &str, request_id: String, answers: Vec<String>) -> Result<()> {
        self.send_control_or_not_found(id, AgendoControl::AnswerQuestion { request_id, answers })
            .await
    }

    pub async fn set_permission_mode(&self, id: &str, mode: PermissionMode) -> Result<()> {
        self.send_control_or_not_found(id, AgendoControl::SetPermissionMode { mode })
            .await
    }

    pub async fn set_model(&self, id: &str, model: String) -> Result<()> {
        self.send_control_or_not_found(id, AgendoControl::SetModel { model })
            .await
    }

    async fn send_control_or_not_found(&self, id: &str, control: AgendoControl) -> Result<()> {
        self.event_bus
            .send_control(id, control)
            .await
            .map_err(|_| SupervisorError::SessionNotFound(id.to_string()))
    }

    /// Queue-backed intake: push a claim for an external worker to pick up
    /// rather than spawning inline. Not used by `create_session`, which
    /// starts its own process immediately — this is the seam for a future
    /// durable multi-worker queue in front of it.
    pub async fn enqueue(&self, claim: crate::queue::QueuedClaim) {
        self.queue.push(claim).await;
    }

    /// Gracefully terminate every live session and wait up to 5 seconds for
    /// each actor loop to exit cleanly before returning, so a supervisor
    /// restart never orphans a running agent subprocess. Sends `Terminate`
    /// rather than `Cancel`: a restart should leave every session resumable
    /// (`idle`), not irreversibly `ended` the way a user-initiated cancel
    /// does.
    pub async fn drain(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut live = self.live.write().await;
            live.drain().collect()
        };
        for (id, _) in &handles {
            if let Err(e) = self.event_bus.send_control(id, AgendoControl::Terminate).await {
                warn!(session_id = %id, error = %e, "failed to send terminate during drain");
            }
        }
        for (id, handle) in handles {
            match tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
                Ok(Ok(())) => info!(session_id = %id, "session drained cleanly"),
                Ok(Err(e)) => warn!(session_id = %id, error = %e, "session task panicked during drain"),
                Err(_) => warn!(session_id = %id, "session did not drain within 5s"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::NullPushNotifier;
    use crate::queue::InMemoryWorkQueue;

    // Returns the `TempDir` alongside the manager so the caller keeps it
    // alive for the test's duration — dropping it early would unlink the
    // sqlite file out from under the pool.
    async fn test_manager(max_sessions: u32) -> (SessionManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        let config = Arc::new(SupervisorConfig {
            data_dir: dir.path().to_path_buf(),
            bind_addr: "127.0.0.1:0".to_string(),
            log: "info".to_string(),
            max_sessions,
            idle_timeout_sec: 1800,
            heartbeat_interval_sec: 30,
            mcp_health_interval_sec: 60,
            approval_timeout_sec: 300,
            providers: HashMap::new(),
        });
        let mgr = SessionManager::new(
            storage,
            EventBus::new(),
            config,
            Arc::new(InMemoryWorkQueue::new()),
            Arc::new(NullPushNotifier),
        );
        (mgr, dir)
    }

    #[tokio::test]
    async fn create_session_rejects_unknown_kind() {
        let (mgr, _dir) = test_manager(10).await;
        let err = mgr
            .create_session(
                "gpt".to_string(),
                PathBuf::from("/tmp"),
                "hi".to_string(),
                None,
                PermissionMode::Default,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownAgentKind(_)));
    }

    #[tokio::test]
    async fn create_session_enforces_capacity_before_claiming_a_row() {
        let (mgr, _dir) = test_manager(0).await;
        let err = mgr
            .create_session(
                "claude".to_string(),
                PathBuf::from("/tmp"),
                "hi".to_string(),
                None,
                PermissionMode::Default,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AtCapacity { running: 0, max: 0 }));
        assert!(mgr.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn control_calls_on_unknown_session_report_not_found() {
        let (mgr, _dir) = test_manager(10).await;
        assert!(matches!(
            mgr.cancel_session("ghost").await,
            Err(SupervisorError::SessionNotFound(_))
        ));
        assert!(matches!(
            mgr.interrupt_session("ghost").await,
            Err(SupervisorError::SessionNotFound(_))
        ));
        assert!(matches!(
            mgr.set_model("ghost", "opus".to_string()).await,
            Err(SupervisorError::SessionNotFound(_))
        ));
        assert!(matches!(
            mgr.subscribe("ghost").await,
            Err(SupervisorError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn send_message_to_idle_session_claims_and_spawns_a_runner() {
        let (mgr, _dir) = test_manager(10).await;
        mgr.storage
            .create_session(NewSession {
                id: "s1".into(),
                kind: "claude".into(),
                cwd: "/tmp".into(),
                idle_timeout_sec: 1800,
                permission_mode: PermissionMode::Default,
                model: None,
                initial_prompt: "hello".into(),
            })
            .await
            .unwrap();

        mgr.send_message("s1", "go".to_string(), None).await.unwrap();
        assert!(mgr.live.read().await.contains_key("s1"));
        let row = mgr.get_session("s1").await.unwrap();
        assert_eq!(row.status(), crate::events::SessionStatus::Active);
    }

    #[tokio::test]
    async fn send_message_to_a_row_claimed_by_another_worker_does_not_double_spawn() {
        let (mgr, _dir) = test_manager(10).await;
        mgr.storage
            .create_session(NewSession {
                id: "s2".into(),
                kind: "claude".into(),
                cwd: "/tmp".into(),
                idle_timeout_sec: 1800,
                permission_mode: PermissionMode::Default,
                model: None,
                initial_prompt: "hello".into(),
            })
            .await
            .unwrap();
        // Simulates the row already being claimed and run elsewhere, with
        // no entry in *this* manager's `live` map for it.
        mgr.storage.claim_session("s2", "worker-a").await.unwrap();

        let err = mgr.send_message("s2", "go".to_string(), None).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ClaimConflict(_)));
    }

    #[tokio::test]
    async fn enqueue_pushes_onto_the_work_queue() {
        let (mgr, _dir) = test_manager(10).await;
        mgr.enqueue(crate::queue::QueuedClaim {
            session_id: "s3".into(),
            kind: "claude".into(),
            initial_prompt: "hi".into(),
        })
        .await;
        assert_eq!(mgr.queue.len().await, 1);
    }
}
