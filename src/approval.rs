//! Tool-approval gating. One `ApprovalManager` lives inside each Session
//! Process — it is never shared across sessions or wrapped in a lock,
//! because the Session Process is the sole task that both raises approval
//! requests (reading adapter frames) and resolves them (reading control
//! messages), exactly like the daemon's single-task event loop pattern.

use crate::events::ApprovalDecision;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Tools whose approval prompt must survive even in `acceptEdits` /
/// `bypassPermissions` modes — e.g. leaving plan mode is always a decision
/// a human should see.
pub static APPROVAL_GATED_TOOLS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["ExitPlanMode"].into_iter().collect());

/// Tools that pause the agent on a blocking question rather than a
/// file/command approval — auto-allow rules don't apply to these.
pub static INTERACTIVE_TOOLS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["AskUserQuestion"].into_iter().collect());

const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

pub struct PendingApproval {
    pub approval_id: String,
    pub tool_use_id: String,
    pub tool_input: Value,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    AutoAllow,
    NeedsApproval,
}

pub struct ApprovalManager {
    /// Keyed by tool name: only one approval per tool name may be pending
    /// at a time — a fresh request for the same tool auto-denies and
    /// evicts whatever was already waiting.
    pending: HashMap<String, PendingApproval>,
    session_allowlist: HashSet<String>,
    timeout: Duration,
}

impl ApprovalManager {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            session_allowlist: HashSet::new(),
            timeout: APPROVAL_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            session_allowlist: HashSet::new(),
            timeout,
        }
    }

    pub fn allow_session(&mut self, tool_name: &str) {
        self.session_allowlist.insert(tool_name.to_string());
    }

    pub fn seed_allowlist(&mut self, tools: Vec<String>) {
        self.session_allowlist.extend(tools);
    }

    /// Decide whether `tool_name` needs an interactive approval given the
    /// current permission mode, persisted allowlist, and whether it's one
    /// of the always-gated tools. Gating-rule order matters: a
    /// non-default permission mode can only skip approval for tools that
    /// aren't in [`APPROVAL_GATED_TOOLS`].
    pub fn gate(
        &self,
        tool_name: &str,
        bypass_via_permission_mode: bool,
    ) -> Gate {
        if APPROVAL_GATED_TOOLS.contains(tool_name) {
            return Gate::NeedsApproval;
        }
        if bypass_via_permission_mode {
            return Gate::AutoAllow;
        }
        if self.session_allowlist.contains(tool_name) {
            return Gate::AutoAllow;
        }
        Gate::NeedsApproval
    }

    /// Register a new pending approval, returning its externally-visible id
    /// plus the `(approval_id, tool_use_id)` of any older pending approval
    /// for the same tool name that was just evicted — the caller needs the
    /// evicted entry's `tool_use_id` to write a deny back to the agent, not
    /// just the id it can no longer be resolved by.
    pub fn register(
        &mut self,
        tool_name: &str,
        tool_use_id: &str,
        tool_input: Value,
    ) -> (String, Option<(String, String)>) {
        let approval_id = Uuid::new_v4().to_string();
        let evicted = self.pending.insert(
            tool_name.to_string(),
            PendingApproval {
                approval_id: approval_id.clone(),
                tool_use_id: tool_use_id.to_string(),
                tool_input,
                deadline: Instant::now() + self.timeout,
            },
        );
        (approval_id, evicted.map(|p| (p.approval_id, p.tool_use_id)))
    }

    /// Resolve a pending approval by id, returning the tool-use id it was
    /// raised for so the caller can write the decision back to the agent.
    pub fn resolve(&mut self, approval_id: &str) -> Option<(String, String)> {
        let tool_name = self
            .pending
            .iter()
            .find(|(_, p)| p.approval_id == approval_id)
            .map(|(name, _)| name.clone())?;
        let pending = self.pending.remove(&tool_name)?;
        Some((tool_name, pending.tool_use_id))
    }

    /// Sweep pending approvals past their deadline, auto-denying and
    /// returning their `(tool_name, tool_use_id, approval_id)` so the
    /// caller can write a deny response back to the agent.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, String, String)> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(name, _)| name.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|name| {
                self.pending
                    .remove(&name)
                    .map(|p| (name, p.tool_use_id, p.approval_id))
            })
            .collect()
    }

    /// Drain every pending approval with the given decision, used on
    /// cancel/terminate so nothing is left waiting on a dead session.
    pub fn drain(&mut self) -> Vec<(String, String, String)> {
        self.pending
            .drain()
            .map(|(name, p)| (name, p.tool_use_id, p.approval_id))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for ApprovalManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Not currently used outside tests, but documents the shape a caller uses
/// the eviction result in: the evicted approval is denied, never silently
/// dropped.
#[allow(dead_code)]
pub const EVICTED_DECISION: ApprovalDecision = ApprovalDecision::Deny;

/// Tracks in-flight tool calls for a single session: `activeToolUseIds`
/// while a tool is running, `pendingHumanResponseIds`/`suppressedToolUseIds`
/// once the generic interactive-tool rule escalates one (§4.3: an errored
/// `tool_result` on an active id means the mapper's `agent:tool-end` is
/// suppressed rather than published). Lives alongside `ApprovalManager`
/// inside the Session Process for the same reason: one task both raises
/// and resolves these ids, so no lock is needed.
#[derive(Default)]
pub struct ToolUseTracker {
    active: HashSet<String>,
    pending_human_response: HashSet<String>,
    suppressed: HashSet<String>,
}

impl ToolUseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, tool_use_id: &str) {
        self.active.insert(tool_use_id.to_string());
    }

    pub fn is_active(&self, tool_use_id: &str) -> bool {
        self.active.contains(tool_use_id)
    }

    /// Tool completed normally: drop it from the active set.
    pub fn finish(&mut self, tool_use_id: &str) {
        self.active.remove(tool_use_id);
    }

    /// An errored `tool_result` arrived for a still-active id: move it out
    /// of `active` rather than letting it complete as an ordinary
    /// `agent:tool-end`.
    pub fn mark_pending_human_response(&mut self, tool_use_id: &str) {
        self.active.remove(tool_use_id);
        self.pending_human_response.insert(tool_use_id.to_string());
        self.suppressed.insert(tool_use_id.to_string());
    }

    /// Drain every still-active tool use, used on cancel/terminate so each
    /// one is reported as interrupted instead of left dangling (P4).
    pub fn interrupt_all(&mut self) -> Vec<String> {
        self.active.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn second_request_for_same_tool_evicts_the_first() {
        let mut mgr = ApprovalManager::new();
        let (first_id, evicted) = mgr.register("Bash", "tu1", json!({"command": "ls"}));
        assert!(evicted.is_none());

        let (second_id, evicted) = mgr.register("Bash", "tu2", json!({"command": "rm -rf /"}));
        assert_eq!(evicted, Some((first_id, "tu1".to_string())));
        assert_ne!(second_id, evicted.unwrap().0);
    }

    #[test]
    fn resolve_returns_tool_use_id_and_removes_entry() {
        let mut mgr = ApprovalManager::new();
        let (approval_id, _) = mgr.register("Write", "tu1", json!({}));
        let (tool_name, tool_use_id) = mgr.resolve(&approval_id).unwrap();
        assert_eq!(tool_name, "Write");
        assert_eq!(tool_use_id, "tu1");
        assert!(mgr.is_empty());
    }

    #[test]
    fn exit_plan_mode_always_needs_approval_even_in_bypass_mode() {
        let mgr = ApprovalManager::new();
        assert_eq!(mgr.gate("ExitPlanMode", true), Gate::NeedsApproval);
    }

    #[test]
    fn bypass_permission_mode_auto_allows_non_gated_tools() {
        let mgr = ApprovalManager::new();
        assert_eq!(mgr.gate("Write", true), Gate::AutoAllow);
    }

    #[test]
    fn session_allowlist_auto_allows_without_permission_mode_bypass() {
        let mut mgr = ApprovalManager::new();
        assert_eq!(mgr.gate("Bash", false), Gate::NeedsApproval);
        mgr.allow_session("Bash");
        assert_eq!(mgr.gate("Bash", false), Gate::AutoAllow);
    }

    #[test]
    fn tool_use_tracker_interrupt_all_drains_only_active_ids() {
        let mut tracker = ToolUseTracker::new();
        tracker.start("t1");
        tracker.start("t2");
        tracker.finish("t1");
        let interrupted = tracker.interrupt_all();
        assert_eq!(interrupted, vec!["t2".to_string()]);
        assert!(tracker.interrupt_all().is_empty());
    }

    #[test]
    fn tool_use_tracker_marks_errored_active_id_pending_instead_of_active() {
        let mut tracker = ToolUseTracker::new();
        tracker.start("t1");
        tracker.mark_pending_human_response("t1");
        assert!(!tracker.is_active("t1"));
        assert!(tracker.interrupt_all().is_empty());
    }

    #[test]
    fn expire_sweeps_only_past_deadline_entries() {
        let mut mgr = ApprovalManager::with_timeout(Duration::from_millis(10));
        mgr.register("Bash", "tu1", json!({}));
        let before = mgr.expire(Instant::now());
        assert!(before.is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let after = mgr.expire(Instant::now());
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].0, "Bash");
    }
}
