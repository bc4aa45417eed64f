//! Switchyard - coordination kernel for fleets of cooperating agents
//!
//! Agents publish and subscribe to typed events on an in-process bus.
//! Workflows are multi-step state machines driven by those events, gated by
//! policy rules and human decisions, and escalated when deadlines pass. All
//! workflow state is journaled and replayed on restart.
//!
//! # Modules
//!
//! - [`events`] - Event model and the pub/sub bus
//! - [`workflow`] - Definitions, instances, decisions, orchestration and escalation
//! - [`registry`] - Capability-based agent selection
//! - [`monitor`] - Per-agent metric samples and aggregates
//! - [`policy`] - Declarative gating rules
//! - [`agent`] - The facade agents use
//! - [`kernel`] - Everything wired together

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod kernel;
pub mod monitor;
pub mod policy;
pub mod registry;
pub mod workflow;

pub use agent::AgentClient;
pub use config::{AgentConfig, BusConfig, Config, EscalationConfig, RegistryConfig, StorageConfig};
pub use error::{DeliveryError, OrchestratorError, PolicyError, RegistryError, ValidationError};
pub use events::{
    BusStats, Event, EventBus, EventHandler, EventKind, EventPublisher, EventSubscriber, Payload, SubscriptionHandle,
    Verdict, handler_fn,
};
pub use kernel::Switchyard;
pub use monitor::{Aggregate, MetricSample, MetricSummary, PerformanceMonitor, Window};
pub use policy::{Effect, PolicyContext, PolicyDecision, PolicyEngine, PolicyRule, Predicate};
pub use registry::{AgentRecord, AgentRegistry};
pub use workflow::{
    DecisionStatus, EscalationManager, HistoryEntry, HitlDecision, StepDefinition, SweepReport, TimeoutOutcome,
    TimeoutPolicy, WorkflowDefinition, WorkflowInstance, WorkflowOrchestrator, WorkflowState,
};
