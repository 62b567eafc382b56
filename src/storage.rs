//! SQLite persistence. WAL mode, one `sessions` table, atomic claim via a
//! conditional `UPDATE ... WHERE status IN (...)` so two racing callers can
//! never both start a runner for the same session.

use crate::error::{Result, SupervisorError};
use crate::events::{PermissionMode, SessionStatus};
use chrono::Utc;
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(SupervisorError::Other(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        ))),
    }
}

/// Full row of the `sessions` table — the data model every Session Process
/// reads from and writes back to as it runs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub kind: String,
    pub cwd: String,
    pub status: String,
    pub worker_id: Option<String>,
    pub pid: Option<i64>,
    pub session_ref: Option<String>,
    pub event_seq: i64,
    pub heartbeat_at: Option<String>,
    pub started_at: String,
    pub last_active_at: String,
    pub ended_at: Option<String>,
    pub idle_timeout_sec: i64,
    pub log_file_path: Option<String>,
    pub total_cost_usd: f64,
    pub total_turns: i64,
    pub permission_mode: String,
    pub allowed_tools: String,
    pub model: Option<String>,
    pub initial_prompt: String,
    pub plan_file_path: Option<String>,
}

impl SessionRow {
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_db_str(&self.status).unwrap_or(SessionStatus::Ended)
    }

    pub fn permission_mode(&self) -> PermissionMode {
        PermissionMode::from_db_str(&self.permission_mode)
    }

    pub fn allowed_tools(&self) -> Vec<String> {
        serde_json::from_str(&self.allowed_tools).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub kind: String,
    pub cwd: String,
    pub idle_timeout_sec: i64,
    pub permission_mode: PermissionMode,
    pub model: Option<String>,
    pub initial_prompt: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| SupervisorError::Other(e.into()))?;
        let db_path = data_dir.join("agendo.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))
                .map_err(|e| SupervisorError::Other(e.into()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(include_str!("migrations/001_init.sql"))
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn create_session(&self, new: NewSession) -> Result<SessionRow> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                "INSERT INTO sessions
                    (id, kind, cwd, status, worker_id, pid, session_ref, event_seq,
                     heartbeat_at, started_at, last_active_at, ended_at,
                     idle_timeout_sec, log_file_path, total_cost_usd, total_turns,
                     permission_mode, allowed_tools, model, initial_prompt, plan_file_path)
                 VALUES (?, ?, ?, 'idle', NULL, NULL, NULL, 0,
                     NULL, ?, ?, NULL,
                     ?, NULL, 0.0, 0,
                     ?, '[]', ?, ?, NULL)",
            )
            .bind(&new.id)
            .bind(&new.kind)
            .bind(&new.cwd)
            .bind(&now)
            .bind(&now)
            .bind(new.idle_timeout_sec)
            .bind(new.permission_mode.as_db_str())
            .bind(&new.model)
            .bind(&new.initial_prompt)
            .execute(&self.pool)
            .await?;
            self.get_session_inner(&new.id).await
        })
        .await
    }

    pub async fn get_session(&self, id: &str) -> Result<SessionRow> {
        with_timeout(self.get_session_inner(id)).await
    }

    async fn get_session_inner(&self, id: &str) -> Result<SessionRow> {
        sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SupervisorError::SessionNotFound(id.to_string()))
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions ORDER BY started_at DESC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// Atomically transition `idle`/`ended` -> `active` and claim a
    /// worker_id, returning the freshly-claimed row via `RETURNING`.
    /// `rows_affected() == 0` on the underlying UPDATE means another
    /// caller won the race (or the session is already running) — this is
    /// surfaced as `ClaimConflict` rather than re-reading the row, so the
    /// caller can never observe a false claim. `pid` is deliberately not
    /// set here: the real agent subprocess doesn't exist yet at claim
    /// time, only once the Session Process's adapter has spawned it — see
    /// [`Storage::set_pid`].
    pub async fn claim_session(&self, id: &str, worker_id: &str) -> Result<SessionRow> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            let row = sqlx::query_as::<_, SessionRow>(
                "UPDATE sessions
                 SET status = 'active', worker_id = ?, last_active_at = ?
                 WHERE id = ? AND status IN ('idle', 'ended')
                 RETURNING *",
            )
            .bind(worker_id)
            .bind(&now)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.ok_or_else(|| SupervisorError::ClaimConflict(id.to_string()))
        })
        .await
    }

    /// Record the actual agent subprocess pid once the adapter has spawned
    /// it, or clear it (`None`) on terminal exit — kept separate from
    /// `claim_session` since the worker claims the row before any process
    /// exists.
    pub async fn set_pid(&self, id: &str, pid: Option<u32>) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET pid = ? WHERE id = ?")
                .bind(pid.map(|p| p as i64))
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            sqlx::query("UPDATE sessions SET status = ?, last_active_at = ? WHERE id = ?")
                .bind(status.as_db_str())
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn touch_activity(&self, id: &str) -> Result<()> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            sqlx::query("UPDATE sessions SET last_active_at = ? WHERE id = ?")
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn record_heartbeat(&self, id: &str) -> Result<()> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            sqlx::query("UPDATE sessions SET heartbeat_at = ? WHERE id = ?")
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn set_session_ref(&self, id: &str, session_ref: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET session_ref = ? WHERE id = ?")
                .bind(session_ref)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn set_log_file_path(&self, id: &str, path: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET log_file_path = ? WHERE id = ?")
                .bind(path)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn set_plan_file_path(&self, id: &str, path: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET plan_file_path = ? WHERE id = ?")
                .bind(path)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn set_permission_mode(&self, id: &str, mode: PermissionMode) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET permission_mode = ? WHERE id = ?")
                .bind(mode.as_db_str())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn set_initial_prompt(&self, id: &str, prompt: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE sessions SET initial_prompt = ? WHERE id = ?")
                .bind(prompt)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn allow_tool(&self, id: &str, tool_name: &str) -> Result<()> {
        with_timeout(async {
            let row = self.get_session_inner(id).await?;
            let mut tools = row.allowed_tools();
            if !tools.iter().any(|t| t == tool_name) {
                tools.push(tool_name.to_string());
            }
            let json = serde_json::to_string(&tools).unwrap_or_else(|_| "[]".to_string());
            sqlx::query("UPDATE sessions SET allowed_tools = ? WHERE id = ?")
                .bind(json)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn record_result(&self, id: &str, cost_usd: f64, turns: u32) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "UPDATE sessions SET total_cost_usd = total_cost_usd + ?, total_turns = total_turns + ? WHERE id = ?",
            )
            .bind(cost_usd)
            .bind(turns as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Monotonically bump and return `event_seq` — the ordering key stamped
    /// onto every published event. Done in the database so it survives a
    /// supervisor crash-and-resume and stays correct even if two writers
    /// ever raced (they shouldn't: one Session Process owns one row).
    pub async fn next_event_seq(&self, id: &str) -> Result<u64> {
        with_timeout(async {
            let row = sqlx::query(
                "UPDATE sessions SET event_seq = event_seq + 1 WHERE id = ? RETURNING event_seq",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
            let seq: i64 = row.try_get("event_seq")?;
            Ok(seq as u64)
        })
        .await
    }

    pub async fn end_session(&self, id: &str) -> Result<()> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                "UPDATE sessions SET status = 'ended', ended_at = ?, last_active_at = ?, pid = NULL WHERE id = ?",
            )
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn count_running(&self) -> Result<u32> {
        with_timeout(async {
            let row = sqlx::query("SELECT COUNT(*) as n FROM sessions WHERE status IN ('active', 'awaiting_input')")
                .fetch_one(&self.pool)
                .await?;
            let n: i64 = row.try_get("n")?;
            Ok(n as u32)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn create_then_claim_transitions_idle_to_active() {
        let (_dir, storage) = test_storage().await;
        let row = storage
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
        assert_eq!(row.status(), SessionStatus::Idle);

        let claimed = storage.claim_session("s1", "worker-a").await.unwrap();
        assert_eq!(claimed.status(), SessionStatus::Active);
        assert_eq!(claimed.pid, None, "pid is unknown until the adapter spawns its process");

        storage.set_pid("s1", Some(4242)).await.unwrap();
        let row = storage.get_session("s1").await.unwrap();
        assert_eq!(row.pid, Some(4242));

        storage.end_session("s1").await.unwrap();
        let row = storage.get_session("s1").await.unwrap();
        assert_eq!(row.pid, None, "pid is cleared on terminal exit");
    }

    #[tokio::test]
    async fn double_claim_of_running_session_fails() {
        let (_dir, storage) = test_storage().await;
        storage
            .create_session(NewSession {
                id: "s2".into(),
                kind: "codex".into(),
                cwd: "/tmp".into(),
                idle_timeout_sec: 1800,
                permission_mode: PermissionMode::Default,
                model: None,
                initial_prompt: "hi".into(),
            })
            .await
            .unwrap();

        storage.claim_session("s2", "worker-a").await.unwrap();
        let second = storage.claim_session("s2", "worker-b").await;
        assert!(matches!(second, Err(SupervisorError::ClaimConflict(_))));
    }

    #[tokio::test]
    async fn event_seq_is_monotonic() {
        let (_dir, storage) = test_storage().await;
        storage
            .create_session(NewSession {
                id: "s3".into(),
                kind: "claude".into(),
                cwd: "/tmp".into(),
                idle_timeout_sec: 1800,
                permission_mode: PermissionMode::Default,
                model: None,
                initial_prompt: "x".into(),
            })
            .await
            .unwrap();
        let a = storage.next_event_seq("s3").await.unwrap();
        let b = storage.next_event_seq("s3").await.unwrap();
        assert_eq!(b, a + 1);
    }
}
