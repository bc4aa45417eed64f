//! Workflow definitions, instances, human decisions and the machinery that
//! drives them

mod decision;
mod definition;
mod escalation;
mod instance;
mod orchestrator;

pub use decision::{DecisionStatus, HitlDecision};
pub use definition::{StepDefinition, TimeoutPolicy, WorkflowDefinition};
pub use escalation::{EscalationManager, SweepReport};
pub use instance::{HistoryEntry, WorkflowInstance, WorkflowState};
pub use orchestrator::{ORCHESTRATOR_SOURCE, TimeoutOutcome, WorkflowOrchestrator};

/// Reason codes carried by `_failed` and `_cancelled` events
pub mod reason {
    pub const POLICY_DENIED: &str = "policy_denied";
    pub const NO_AGENT_AVAILABLE: &str = "no_agent_available";
    pub const ESCALATION_TIMEOUT: &str = "escalation_timeout";
    pub const APPROVAL_REJECTED: &str = "approval_rejected";
    pub const STEP_FAILED: &str = "step_failed";
    pub const CANCELLED: &str = "cancelled";
}
