use thiserror::Error;

/// Domain error taxonomy for the supervisor. Internal plumbing prefers
/// `anyhow::Result` with `.context()`; this enum exists for the handful of
/// error shapes callers actually need to branch on (atomic-claim races,
/// missing sessions, adapter failures).
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} is already running and could not be claimed")]
    ClaimConflict(String),

    #[error("session {0} has already ended")]
    SessionEnded(String),

    #[error("at capacity: {running}/{max} sessions already running")]
    AtCapacity { running: u32, max: u32 },

    #[error("unknown agent kind {0:?}")]
    UnknownAgentKind(String),

    #[error("failed to spawn {agent} process: {source}")]
    SpawnFailed {
        agent: String,
        #[source]
        source: std::io::Error,
    },

    #[error("adapter protocol violation: {0}")]
    AdapterProtocol(String),

    #[error("approval {0} not found or already resolved")]
    ApprovalNotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
