//! Human-in-the-loop decisions
//!
//! A pending decision suspends its instance. Only a resolving event, the
//! escalation sweep or an explicit cancel moves it out of `PENDING`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Approved => write!(f, "APPROVED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// A request for a human decision on one step of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitlDecision {
    pub id: String,
    pub workflow_instance_id: String,
    pub step_index: usize,
    pub prompt: String,
    pub status: DecisionStatus,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Event types allowed to resolve this decision
    pub resolve_on: Vec<String>,
    /// Who is expected to decide, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HitlDecision {
    pub fn new(
        workflow_instance_id: impl Into<String>,
        step_index: usize,
        prompt: impl Into<String>,
        deadline: DateTime<Utc>,
        resolve_on: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            workflow_instance_id: workflow_instance_id.into(),
            step_index,
            prompt: prompt.into(),
            status: DecisionStatus::Pending,
            created_at: Utc::now(),
            deadline,
            resolve_on,
            approver: None,
            resolved_by: None,
            resolved_at: None,
        }
    }

    pub fn with_approver(mut self, approver: Option<String>) -> Self {
        self.approver = approver;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == DecisionStatus::Pending
    }

    pub fn resolves_on(&self, event_type: &str) -> bool {
        self.resolve_on.iter().any(|e| e == event_type)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now >= self.deadline
    }

    pub fn approve(&mut self, by: impl Into<String>) {
        self.close(DecisionStatus::Approved, Some(by.into()), Utc::now());
    }

    pub fn reject(&mut self, by: impl Into<String>) {
        self.close(DecisionStatus::Rejected, Some(by.into()), Utc::now());
    }

    pub fn time_out(&mut self, now: DateTime<Utc>) {
        self.close(DecisionStatus::TimedOut, None, now);
    }

    fn close(&mut self, status: DecisionStatus, by: Option<String>, at: DateTime<Utc>) {
        if self.is_pending() {
            self.status = status;
            self.resolved_by = by;
            self.resolved_at = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision() -> HitlDecision {
        HitlDecision::new(
            "inst-1",
            2,
            "Approve release",
            Utc::now() + chrono::Duration::seconds(60),
            vec!["release_approved".to_string()],
        )
    }

    #[test]
    fn test_resolution_is_final() {
        let mut d = decision();
        assert!(d.is_pending());
        assert!(d.resolves_on("release_approved"));
        assert!(!d.resolves_on("release_deployed"));

        d.approve("alice");
        assert_eq!(d.status, DecisionStatus::Approved);
        assert_eq!(d.resolved_by.as_deref(), Some("alice"));

        d.reject("bob");
        d.time_out(Utc::now());
        assert_eq!(d.status, DecisionStatus::Approved);
        assert_eq!(d.resolved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_expiry() {
        let mut d = decision();
        assert!(!d.is_expired(Utc::now()));
        let later = d.deadline + chrono::Duration::seconds(1);
        assert!(d.is_expired(later));

        d.time_out(later);
        assert_eq!(d.status, DecisionStatus::TimedOut);
        assert_eq!(d.resolved_at, Some(later));
        assert!(!d.is_expired(later));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&DecisionStatus::TimedOut).unwrap(), "\"TIMED_OUT\"");
        assert_eq!(DecisionStatus::Pending.to_string(), "PENDING");
    }
}
