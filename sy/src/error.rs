//! Error types for the coordination kernel
//!
//! These are resolved inside the component that detects them. Only
//! [`ValidationError`] is ever returned to a publisher; everything else is
//! logged and surfaced to the rest of the system as events.

use thiserror::Error;

use crate::workflow::WorkflowState;

/// A malformed event, rejected at the bus boundary
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Event type must not be empty")]
    EmptyEventType,

    #[error("Event type '*' is reserved for wildcard subscriptions")]
    ReservedEventType,

    #[error("Event source must not be empty")]
    EmptySource,

    #[error("Event payload must be a JSON object")]
    PayloadNotObject,

    #[error("Event {event_type} requires a 'status' key in its payload")]
    MissingStatus { event_type: String },

    #[error("Event {event_type} has a non-string 'status'")]
    InvalidStatus { event_type: String },
}

/// A handler that could not process an event
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Subscription {subscription} failed on attempt {attempt}: {message}")]
    HandlerFailed {
        subscription: u64,
        attempt: u32,
        message: String,
    },

    #[error("Subscription {subscription} panicked on attempt {attempt}")]
    HandlerPanicked { subscription: u64, attempt: u32 },
}

/// Agent registry failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No capable agent for capabilities {required:?}")]
    NoCapableAgent { required: Vec<String> },

    #[error("Agent id must not be empty")]
    EmptyAgentId,
}

/// Policy rule management failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Duplicate policy rule id: {0}")]
    DuplicateRule(String),

    #[error("Invalid pattern in rule {rule}: {message}")]
    InvalidPattern { rule: String, message: String },
}

/// Orchestrator request failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Unknown workflow instance: {0}")]
    UnknownInstance(String),

    #[error("Invalid workflow definition {workflow}: {message}")]
    InvalidDefinition { workflow: String, message: String },

    #[error("Instance {id} is {state} and cannot be cancelled")]
    NotCancellable { id: String, state: WorkflowState },
}
