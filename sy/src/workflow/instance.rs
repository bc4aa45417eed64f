//! Workflow instance state
//!
//! An instance owns its history. Every transition appends a
//! [`HistoryEntry`], so a stuck instance can be explained from its record
//! alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decision::HitlDecision;
use crate::events::{Event, Payload};
use crate::policy::PolicyDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Running,
    AwaitingApproval,
    Escalated,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
            Self::Escalated => "ESCALATED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// One transition of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The event that caused the transition
    pub event: Event,
    /// Step index after the transition
    pub step_index: usize,
    /// State after the transition
    pub state: WorkflowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// A running (or finished) execution of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow: String,
    /// Caller-supplied context given at start
    #[serde(default)]
    pub context: Payload,
    pub current_step_index: usize,
    pub state: WorkflowState,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub step_entered_at: DateTime<Utc>,
    #[serde(default)]
    pub escalations: u32,
    #[serde(default)]
    pub decisions: Vec<HitlDecision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(workflow: impl Into<String>, context: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            workflow: workflow.into(),
            context,
            current_step_index: 0,
            state: WorkflowState::Running,
            history: Vec::new(),
            assigned_agent: None,
            deadline: None,
            step_entered_at: now,
            escalations: 0,
            decisions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The decision currently suspending this instance
    pub fn pending_decision(&self) -> Option<&HitlDecision> {
        self.decisions.iter().rev().find(|d| d.is_pending())
    }

    pub fn pending_decision_mut(&mut self) -> Option<&mut HitlDecision> {
        self.decisions.iter_mut().rev().find(|d| d.is_pending())
    }

    /// Whether this event (or its request) was already applied
    pub fn has_seen(&self, event: &Event) -> bool {
        self.history.iter().any(|entry| {
            entry.event.id == event.id
                || (event.request_id.is_some()
                    && entry.event.request_id == event.request_id
                    && entry.event.event_type == event.event_type)
        })
    }

    /// Whether the current step or decision is past its deadline
    ///
    /// A pending decision carries its own deadline and takes precedence.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self.pending_decision() {
            Some(decision) => decision.is_expired(now),
            None => self.deadline.is_some_and(|deadline| now >= deadline),
        }
    }

    /// Append a transition to the history
    pub fn record(
        &mut self,
        event: Event,
        state: WorkflowState,
        policy: Option<PolicyDecision>,
        reason: Option<String>,
    ) {
        let at = Utc::now();
        self.state = state;
        self.updated_at = at;
        self.history.push(HistoryEntry {
            event,
            step_index: self.current_step_index,
            state,
            policy,
            reason,
            at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, request_id: Option<&str>) -> Event {
        let e = Event::from_value(event_type, "agent", json!({})).unwrap();
        match request_id {
            Some(r) => e.with_request_id(r),
            None => e,
        }
    }

    #[test]
    fn test_new_instance() {
        let inst = WorkflowInstance::new("release", Payload::new());
        assert_eq!(inst.state, WorkflowState::Running);
        assert_eq!(inst.current_step_index, 0);
        assert!(inst.pending_decision().is_none());
        assert!(!inst.is_overdue(Utc::now()));
    }

    #[test]
    fn test_has_seen_by_id_and_request() {
        let mut inst = WorkflowInstance::new("release", Payload::new());
        let first = event("build_requested", Some("r-1"));
        inst.record(first.clone(), WorkflowState::Running, None, None);

        assert!(inst.has_seen(&first));
        assert!(inst.has_seen(&event("build_requested", Some("r-1"))));
        assert!(!inst.has_seen(&event("tests_passed", Some("r-1"))));
        assert!(!inst.has_seen(&event("build_requested", None)));
    }

    #[test]
    fn test_record_sets_state() {
        let mut inst = WorkflowInstance::new("release", Payload::new());
        inst.record(event("x", None), WorkflowState::Failed, None, Some("step_failed".to_string()));
        assert!(inst.is_terminal());
        assert_eq!(inst.history[0].reason.as_deref(), Some("step_failed"));
    }

    #[test]
    fn test_overdue() {
        let mut inst = WorkflowInstance::new("release", Payload::new());
        let now = Utc::now();
        inst.deadline = Some(now);
        assert!(inst.is_overdue(now));
        inst.state = WorkflowState::Cancelled;
        assert!(!inst.is_overdue(now));
    }

    #[test]
    fn test_overdue_follows_pending_decision() {
        let mut inst = WorkflowInstance::new("release", Payload::new());
        let now = Utc::now();
        inst.deadline = Some(now - chrono::Duration::seconds(5));
        inst.decisions.push(HitlDecision::new(
            &inst.id,
            0,
            "ship it?",
            now + chrono::Duration::seconds(30),
            vec!["release_approved".to_string()],
        ));
        assert!(!inst.is_overdue(now));
        assert!(inst.is_overdue(now + chrono::Duration::seconds(30)));

        inst.decisions[0].approve("alice");
        assert!(inst.is_overdue(now));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&WorkflowState::AwaitingApproval).unwrap();
        assert_eq!(json, "\"AWAITING_APPROVAL\"");
        assert_eq!(WorkflowState::Escalated.to_string(), "ESCALATED");
    }
}
