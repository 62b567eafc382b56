pub mod activity;
pub mod adapters;
pub mod approval;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod http;
pub mod log_writer;
pub mod process;
pub mod push;
pub mod queue;
pub mod session;
pub mod storage;

use std::sync::Arc;

use config::SupervisorConfig;
use session::SessionManager;

/// Shared application state handed to every HTTP handler — the supervisor's
/// analogue of the daemon's `AppContext`, pared down to what this crate
/// actually serves: session control plus a couple of process-health facts.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<SupervisorConfig>,
    pub session_manager: Arc<SessionManager>,
    pub started_at: std::time::Instant,
}
