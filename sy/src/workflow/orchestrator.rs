//! WorkflowOrchestrator - per-instance state machines driven by bus events
//!
//! Each live instance sits behind its own async mutex. A transition works on a
//! copy of the instance, journals the copy, and only then swaps it in and
//! publishes the follow-up events it produced. A failed journal write leaves
//! the instance untouched, and the bus redelivers the event.
//!
//! The orchestrator holds a single wildcard subscription, so every event it
//! reacts to passes through one queue in publish order.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use journalstore::Journal;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::decision::HitlDecision;
use super::definition::{StepDefinition, TimeoutPolicy, WorkflowDefinition};
use super::instance::{WorkflowInstance, WorkflowState};
use super::reason;
use crate::error::OrchestratorError;
use crate::events::{
    DECISION_ID_KEY, Event, EventBus, EventKind, INSTANCE_ID_KEY, Payload, REASON_KEY, REQUEST_ID_KEY, STATUS_KEY,
    SubscriptionHandle, Verdict, WILDCARD,
};
use crate::monitor::PerformanceMonitor;
use crate::policy::{Effect, PolicyContext, PolicyDecision, PolicyEngine};
use crate::registry::AgentRegistry;

/// Source id on every event the orchestrator publishes
pub const ORCHESTRATOR_SOURCE: &str = "switchyard";

type InstanceSlot = Arc<Mutex<WorkflowInstance>>;

struct LiveEntry {
    workflow: String,
    slot: InstanceSlot,
}

/// Result of acting on an expired deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutOutcome {
    Reassigned { agent: Option<String> },
    Failed,
}

/// Side effects of a transition, released only after it is journaled
#[derive(Default)]
struct Effects {
    events: Vec<Event>,
    outcomes: Vec<(String, bool)>,
    latencies: Vec<(String, Duration)>,
}

pub struct WorkflowOrchestrator {
    me: Weak<Self>,
    bus: Arc<EventBus>,
    registry: Arc<AgentRegistry>,
    policy: Arc<PolicyEngine>,
    monitor: Arc<PerformanceMonitor>,
    journal: Option<Arc<Journal>>,
    default_approval_timeout: chrono::Duration,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    /// Event type to the workflows that react to it
    routes: RwLock<HashMap<String, BTreeSet<String>>>,
    subscription: RwLock<Option<SubscriptionHandle>>,
    live: RwLock<HashMap<String, LiveEntry>>,
    archive: RwLock<HashMap<String, WorkflowInstance>>,
}

impl WorkflowOrchestrator {
    pub fn new(
        bus: Arc<EventBus>,
        registry: Arc<AgentRegistry>,
        policy: Arc<PolicyEngine>,
        monitor: Arc<PerformanceMonitor>,
        journal: Option<Arc<Journal>>,
        default_approval_timeout: chrono::Duration,
    ) -> Arc<Self> {
        debug!(persistent = journal.is_some(), "WorkflowOrchestrator::new: called");
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            bus,
            registry,
            policy,
            monitor,
            journal,
            default_approval_timeout,
            definitions: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            subscription: RwLock::new(None),
            live: RwLock::new(HashMap::new()),
            archive: RwLock::new(HashMap::new()),
        })
    }

    /// Register a workflow and subscribe to the events it reacts to
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        let name = definition.name.clone();
        let event_types = definition.event_types();

        {
            let mut definitions = self
                .definitions
                .write()
                .map_err(|_| eyre!("Workflow definition table poisoned"))?;
            if definitions.contains_key(&name) {
                return Err(OrchestratorError::InvalidDefinition {
                    workflow: name,
                    message: "already registered".to_string(),
                }
                .into());
            }
            info!(workflow = %name, steps = definition.steps.len(), on_timeout = ?definition.on_timeout, "Registering workflow");
            definitions.insert(name.clone(), Arc::new(definition));
        }

        if let Ok(mut routes) = self.routes.write() {
            for event_type in event_types {
                routes.entry(event_type).or_default().insert(name.clone());
            }
        }
        self.ensure_subscribed();
        Ok(())
    }

    fn ensure_subscribed(&self) {
        let Ok(mut subscription) = self.subscription.write() else {
            error!("WorkflowOrchestrator::ensure_subscribed: subscription slot poisoned");
            return;
        };
        if subscription.is_some() {
            return;
        }

        let me = self.me.clone();
        let handle = self.bus.subscribe(WILDCARD, move |event: Arc<Event>| {
            let me = me.clone();
            async move {
                match me.upgrade() {
                    Some(orchestrator) => orchestrator.dispatch(&event).await,
                    None => Ok(()),
                }
            }
        });
        debug!(subscription = handle.id(), "WorkflowOrchestrator: subscribed");
        *subscription = Some(handle);
    }

    fn is_routed(&self, event_type: &str) -> bool {
        self.routes
            .read()
            .map(|routes| routes.contains_key(event_type))
            .unwrap_or(false)
    }

    pub fn definition(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.read().ok()?.get(name).cloned()
    }

    /// Registered definitions, ordered by name
    pub fn definitions(&self) -> Vec<WorkflowDefinition> {
        let mut definitions: Vec<WorkflowDefinition> = self
            .definitions
            .read()
            .map(|defs| defs.values().map(|d| d.as_ref().clone()).collect())
            .unwrap_or_default();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Create an instance and enter its first step
    pub fn start_workflow(&self, name: &str, context: Payload) -> Result<String> {
        let definition = self
            .definition(name)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(name.to_string()))?;

        let mut instance = WorkflowInstance::new(&definition.name, context);
        let mut fx = Effects::default();

        let started = self
            .follow_up(definition.started_event(), &instance)
            .with_field(STATUS_KEY, "started")
            .with_field("context", Value::Object(instance.context.clone()));
        instance.record(started.clone(), WorkflowState::Running, None, None);
        fx.events.push(started);
        self.enter_step(&definition, &mut instance, Utc::now(), &mut fx);

        self.persist(&instance)?;
        let id = instance.id.clone();
        info!(instance_id = %id, workflow = %definition.name, state = %instance.state, "Started workflow");

        if instance.is_terminal() {
            self.retire(&instance);
        } else if let Ok(mut live) = self.live.write() {
            live.insert(
                id.clone(),
                LiveEntry {
                    workflow: definition.name.clone(),
                    slot: Arc::new(Mutex::new(instance)),
                },
            );
        }

        self.flush(fx);
        Ok(id)
    }

    /// Apply an event to every instance it concerns
    pub async fn dispatch(&self, event: &Event) -> Result<()> {
        if event.source == ORCHESTRATOR_SOURCE || !self.is_routed(&event.event_type) {
            return Ok(());
        }
        let kind = event.validate()?;
        let targets = self.targets(event);
        debug!(event_type = %event.event_type, event_id = %event.id, targets = targets.len(), "WorkflowOrchestrator::dispatch: called");

        let mut first_error = None;
        for slot in targets {
            if let Err(e) = self.apply(&slot, event, &kind).await {
                error!(event_id = %event.id, event_type = %event.event_type, error = %e, "Transition failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn targets(&self, event: &Event) -> Vec<InstanceSlot> {
        let Ok(live) = self.live.read() else {
            return Vec::new();
        };

        if let Some(instance_id) = event.instance_id() {
            let slot = live.get(instance_id).map(|entry| entry.slot.clone());
            if slot.is_none() {
                debug!(%instance_id, event_type = %event.event_type, "No live instance for event");
            }
            return slot.into_iter().collect();
        }

        let workflows = self
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(&event.event_type).cloned())
            .unwrap_or_default();

        let mut matching: Vec<(&String, &LiveEntry)> = live
            .iter()
            .filter(|(_, entry)| workflows.contains(&entry.workflow))
            .collect();
        matching.sort_by(|a, b| a.0.cmp(b.0));
        matching.into_iter().map(|(_, entry)| entry.slot.clone()).collect()
    }

    async fn apply(&self, slot: &InstanceSlot, event: &Event, kind: &EventKind) -> Result<()> {
        let mut guard = slot.lock().await;
        if guard.is_terminal() {
            debug!(instance_id = %guard.id, "Instance already finished; ignoring event");
            return Ok(());
        }
        if guard.has_seen(event) {
            info!(instance_id = %guard.id, event_id = %event.id, request_id = ?event.request_id, "Ignoring duplicate event");
            return Ok(());
        }

        let definition = self
            .definition(&guard.workflow)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(guard.workflow.clone()))?;

        let mut next = guard.clone();
        let mut fx = Effects::default();
        let changed = if next.pending_decision().is_some() {
            self.resolve_decision(&definition, &mut next, event, kind, &mut fx)
        } else {
            self.advance(&definition, &mut next, event, kind, &mut fx)
        };

        if changed {
            self.commit(&mut guard, next, fx)?;
        }
        Ok(())
    }

    fn advance(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        event: &Event,
        kind: &EventKind,
        fx: &mut Effects,
    ) -> bool {
        let Some(step) = definition.step(instance.current_step_index) else {
            return false;
        };

        let reports_failure = matches!(kind, EventKind::Failed { .. })
            || event.status().is_some_and(|s| s.eq_ignore_ascii_case("failed"));
        if step.fails_on(&event.event_type) || (step.accepts(&event.event_type) && reports_failure) {
            let reason = event.str_field(REASON_KEY).unwrap_or(reason::STEP_FAILED).to_string();
            if let Some(agent) = &instance.assigned_agent {
                fx.outcomes.push((agent.clone(), false));
            }
            self.fail(definition, instance, Some(event), None, &reason, fx);
            return true;
        }

        if !step.accepts(&event.event_type) {
            info!(
                instance_id = %instance.id,
                event_type = %event.event_type,
                step = %step.name,
                "Ignoring out-of-order event"
            );
            return false;
        }

        let decision = self.policy.evaluate(&self.policy_context(definition, instance, step, event));
        match decision.effect {
            Effect::Allow => self.complete_step(definition, instance, event, Some(decision), fx),
            Effect::Deny => {
                let reason = decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| reason::POLICY_DENIED.to_string());
                self.fail(definition, instance, Some(event), Some(decision), &reason, fx);
            }
            Effect::RequireApproval => {
                let prompt = match (&decision.reason, &decision.rule_id) {
                    (Some(reason), _) => reason.clone(),
                    (None, Some(rule)) => format!("Policy rule '{}' requires approval for step '{}'", rule, step.name),
                    (None, None) => format!("Approval required for step '{}'", step.name),
                };
                instance.record(event.clone(), WorkflowState::AwaitingApproval, Some(decision), None);
                self.open_decision(definition, instance, prompt, vec![definition.approval_event()], Utc::now(), fx);
            }
        }
        true
    }

    fn resolve_decision(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        event: &Event,
        kind: &EventKind,
        fx: &mut Effects,
    ) -> bool {
        let Some(pending) = instance.pending_decision() else {
            return false;
        };
        if !pending.resolves_on(&event.event_type) {
            info!(
                instance_id = %instance.id,
                decision_id = %pending.id,
                event_type = %event.event_type,
                "Instance is awaiting a decision; ignoring event"
            );
            return false;
        }
        if let Some(decision_id) = event.str_field(DECISION_ID_KEY)
            && decision_id != pending.id
        {
            warn!(instance_id = %instance.id, expected = %pending.id, got = %decision_id, "Decision id mismatch; ignoring event");
            return false;
        }

        let verdict = match kind {
            EventKind::Decision { verdict } => *verdict,
            EventKind::Completed { status } => match Verdict::parse(status) {
                Some(verdict) => verdict,
                None if status.eq_ignore_ascii_case("completed") => Verdict::Approved,
                None => Verdict::Rejected,
            },
            EventKind::Failed { .. } => Verdict::Rejected,
            _ => {
                info!(instance_id = %instance.id, event_type = %event.event_type, "Resolving event carries no verdict; ignoring");
                return false;
            }
        };
        let by = event.str_field("approver").unwrap_or(&event.source).to_string();
        info!(instance_id = %instance.id, %verdict, %by, "Decision resolved");

        match verdict {
            Verdict::Approved => {
                if let Some(decision) = instance.pending_decision_mut() {
                    decision.approve(by);
                }
                self.complete_step(definition, instance, event, None, fx);
            }
            Verdict::Rejected => {
                if let Some(decision) = instance.pending_decision_mut() {
                    decision.reject(by);
                }
                self.fail(definition, instance, Some(event), None, reason::APPROVAL_REJECTED, fx);
            }
        }
        true
    }

    fn policy_context(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        step: &StepDefinition,
        event: &Event,
    ) -> PolicyContext {
        PolicyContext {
            workflow: definition.name.clone(),
            step: step.name.clone(),
            step_index: instance.current_step_index,
            event_type: event.event_type.clone(),
            source: event.source.clone(),
            payload: event.payload.clone(),
            assigned_agent: instance.assigned_agent.clone(),
            agent_error_rate: instance
                .assigned_agent
                .as_deref()
                .map(|agent| self.registry.error_rate(agent))
                .unwrap_or(0.0),
            escalations: instance.escalations,
        }
    }

    fn complete_step(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        event: &Event,
        policy: Option<PolicyDecision>,
        fx: &mut Effects,
    ) {
        if let Some(agent) = instance.assigned_agent.clone() {
            let elapsed = (Utc::now() - instance.step_entered_at).to_std().unwrap_or_default();
            fx.latencies.push((agent.clone(), elapsed));
            fx.outcomes.push((agent, true));
        }

        instance.current_step_index += 1;
        instance.deadline = None;

        if instance.current_step_index >= definition.steps.len() {
            instance.record(event.clone(), WorkflowState::Completed, policy, None);
            fx.events.push(
                self.follow_up(definition.completed_event(), instance)
                    .with_field(STATUS_KEY, "completed"),
            );
            info!(instance_id = %instance.id, workflow = %definition.name, "Workflow completed");
        } else {
            instance.record(event.clone(), WorkflowState::Running, policy, None);
            self.enter_step(definition, instance, Utc::now(), fx);
        }
    }

    fn enter_step(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        let Some(step) = definition.step(instance.current_step_index) else {
            return;
        };
        debug!(instance_id = %instance.id, step = %step.name, "WorkflowOrchestrator::enter_step: called");

        instance.step_entered_at = now;
        instance.deadline = step.timeout().map(|timeout| now + timeout);
        instance.assigned_agent = None;

        if !step.capabilities.is_empty() {
            match self.registry.best_match(&step.capabilities) {
                Ok(agent) => instance.assigned_agent = Some(agent),
                Err(e) => {
                    warn!(instance_id = %instance.id, step = %step.name, error = %e, "Cannot assign step");
                    self.fail(definition, instance, None, None, reason::NO_AGENT_AVAILABLE, fx);
                    return;
                }
            }
        }

        if step.requires_approval {
            let prompt = format!("Approve step '{}' of workflow '{}'", step.name, definition.name);
            self.open_decision(definition, instance, prompt, step.accepted_events(), now, fx);
        } else {
            instance.state = WorkflowState::Running;
            fx.events.push(self.step_request(definition, step, instance));
        }
    }

    fn step_request(&self, definition: &WorkflowDefinition, step: &StepDefinition, instance: &WorkflowInstance) -> Event {
        let request_id = Uuid::now_v7().to_string();
        self.follow_up(definition.step_requested_event(), instance)
            .with_field(STATUS_KEY, "requested")
            .with_field("step", step.name.clone())
            .with_field("events", step.accepted_events())
            .with_field("assignee", instance.assigned_agent.clone())
            .with_field(REQUEST_ID_KEY, request_id.clone())
            .with_request_id(request_id)
    }

    /// Suspend the instance on a new pending decision
    fn open_decision(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        prompt: String,
        resolve_on: Vec<String>,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        let timeout = definition
            .step(instance.current_step_index)
            .and_then(StepDefinition::timeout)
            .unwrap_or(self.default_approval_timeout);
        let deadline = now + timeout;

        let decision = HitlDecision::new(&instance.id, instance.current_step_index, prompt, deadline, resolve_on)
            .with_approver(instance.assigned_agent.clone());
        info!(instance_id = %instance.id, decision_id = %decision.id, %deadline, "Awaiting approval");

        instance.deadline = Some(deadline);
        instance.state = WorkflowState::AwaitingApproval;
        fx.events.push(
            self.follow_up(definition.approval_requested_event(), instance)
                .with_field(STATUS_KEY, "pending")
                .with_field(DECISION_ID_KEY, decision.id.clone())
                .with_field("prompt", decision.prompt.clone())
                .with_field("resolve_on", decision.resolve_on.clone())
                .with_field("deadline", deadline.to_rfc3339())
                .with_field("approver", decision.approver.clone()),
        );
        instance.decisions.push(decision);
    }

    fn fail(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        trigger: Option<&Event>,
        policy: Option<PolicyDecision>,
        reason: &str,
        fx: &mut Effects,
    ) {
        if let Some(decision) = instance.pending_decision_mut() {
            decision.reject(ORCHESTRATOR_SOURCE);
        }
        instance.deadline = None;

        let step = definition
            .step(instance.current_step_index)
            .map(|s| Value::from(s.name.clone()))
            .unwrap_or(Value::Null);
        let failed = self
            .follow_up(definition.failed_event(), instance)
            .with_field(STATUS_KEY, "failed")
            .with_field(REASON_KEY, reason)
            .with_field("step", step);

        let cause = trigger.cloned().unwrap_or_else(|| failed.clone());
        instance.record(cause, WorkflowState::Failed, policy, Some(reason.to_string()));
        warn!(instance_id = %instance.id, workflow = %definition.name, %reason, "Workflow failed");
        fx.events.push(failed);
    }

    fn follow_up(&self, event_type: String, instance: &WorkflowInstance) -> Event {
        let mut payload = Payload::new();
        payload.insert(INSTANCE_ID_KEY.to_string(), Value::from(instance.id.clone()));
        payload.insert("workflow".to_string(), Value::from(instance.workflow.clone()));
        payload.insert("step_index".to_string(), Value::from(instance.current_step_index));
        Event::new(event_type, ORCHESTRATOR_SOURCE, payload)
    }

    /// Explicitly cancel a live instance
    pub async fn cancel(&self, instance_id: &str, reason: Option<&str>) -> Result<()> {
        let Some(slot) = self.slot(instance_id) else {
            if let Some(state) = self.archived_state(instance_id) {
                return Err(OrchestratorError::NotCancellable {
                    id: instance_id.to_string(),
                    state,
                }
                .into());
            }
            return Err(OrchestratorError::UnknownInstance(instance_id.to_string()).into());
        };

        let mut guard = slot.lock().await;
        if guard.is_terminal() {
            return Err(OrchestratorError::NotCancellable {
                id: instance_id.to_string(),
                state: guard.state,
            }
            .into());
        }
        let definition = self
            .definition(&guard.workflow)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(guard.workflow.clone()))?;

        let reason = reason.unwrap_or(reason::CANCELLED).to_string();
        let mut next = guard.clone();
        if let Some(decision) = next.pending_decision_mut() {
            decision.reject(ORCHESTRATOR_SOURCE);
        }
        next.deadline = None;

        let cancelled = self
            .follow_up(definition.cancelled_event(), &next)
            .with_field(STATUS_KEY, "cancelled")
            .with_field(REASON_KEY, reason.clone());
        next.record(cancelled.clone(), WorkflowState::Cancelled, None, Some(reason));
        info!(%instance_id, "Cancelling workflow instance");

        let fx = Effects {
            events: vec![cancelled],
            ..Default::default()
        };
        self.commit(&mut guard, next, fx)
    }

    /// Ids of live instances whose deadline has passed
    pub async fn overdue(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for (id, slot) in self.live_slots() {
            if slot.lock().await.is_overdue(now) {
                due.push(id);
            }
        }
        due
    }

    /// Act on an expired deadline; only the escalation sweep calls this
    pub(crate) async fn apply_timeout(&self, instance_id: &str, now: DateTime<Utc>) -> Result<Option<TimeoutOutcome>> {
        let Some(slot) = self.slot(instance_id) else {
            return Ok(None);
        };
        let mut guard = slot.lock().await;
        if !guard.is_overdue(now) {
            return Ok(None);
        }
        let definition = self
            .definition(&guard.workflow)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow(guard.workflow.clone()))?;

        let mut next = guard.clone();
        let mut fx = Effects::default();

        let elapsed = now - next.step_entered_at;
        let timed_out_agent = next.assigned_agent.clone();
        let pending = next.pending_decision_mut().map(|decision| {
            decision.time_out(now);
            (decision.prompt.clone(), decision.resolve_on.clone())
        });
        if let Some(agent) = &timed_out_agent {
            fx.outcomes.push((agent.clone(), false));
        }

        let escalated = self
            .follow_up(definition.escalated_event(), &next)
            .with_field(STATUS_KEY, "escalated")
            .with_field("elapsed_ms", elapsed.num_milliseconds())
            .with_field("escalations", next.escalations + 1)
            .with_field("timed_out_agent", timed_out_agent.clone())
            .with_field("decision_timed_out", pending.is_some());
        warn!(
            instance_id = %next.id,
            elapsed_ms = elapsed.num_milliseconds(),
            escalations = next.escalations,
            "Deadline passed; escalating"
        );
        fx.events.push(escalated.clone());

        let outcome = if next.escalations >= 1 || definition.on_timeout == TimeoutPolicy::Fail {
            let state = next.state;
            next.record(escalated, state, None, Some(reason::ESCALATION_TIMEOUT.to_string()));
            self.fail(&definition, &mut next, None, None, reason::ESCALATION_TIMEOUT, &mut fx);
            TimeoutOutcome::Failed
        } else {
            self.reassign(&definition, &mut next, escalated, pending, timed_out_agent, now, &mut fx)
        };

        self.commit(&mut guard, next, fx)?;
        Ok(Some(outcome))
    }

    #[allow(clippy::too_many_arguments)]
    fn reassign(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        escalated: Event,
        pending: Option<(String, Vec<String>)>,
        previous: Option<String>,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> TimeoutOutcome {
        instance.escalations += 1;
        let state = instance.state;
        instance.record(escalated, state, None, Some(reason::ESCALATION_TIMEOUT.to_string()));

        let Some(step) = definition.step(instance.current_step_index) else {
            self.fail(definition, instance, None, None, reason::ESCALATION_TIMEOUT, fx);
            return TimeoutOutcome::Failed;
        };

        if !step.capabilities.is_empty() {
            match self
                .registry
                .best_match_excluding(&step.capabilities, previous.as_deref())
            {
                Ok(agent) => instance.assigned_agent = Some(agent),
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "No agent to reassign to");
                    self.fail(definition, instance, None, None, reason::NO_AGENT_AVAILABLE, fx);
                    return TimeoutOutcome::Failed;
                }
            }
        }

        instance.step_entered_at = now;
        match pending {
            Some((prompt, resolve_on)) => self.open_decision(definition, instance, prompt, resolve_on, now, fx),
            None => {
                let timeout = step.timeout().unwrap_or(self.default_approval_timeout);
                instance.deadline = Some(now + timeout);
                fx.events.push(self.step_request(definition, step, instance));
            }
        }
        instance.state = WorkflowState::Escalated;

        info!(instance_id = %instance.id, agent = ?instance.assigned_agent, "Reassigned after timeout");
        TimeoutOutcome::Reassigned {
            agent: instance.assigned_agent.clone(),
        }
    }

    fn commit(&self, slot: &mut WorkflowInstance, next: WorkflowInstance, fx: Effects) -> Result<()> {
        self.persist(&next)?;
        *slot = next;
        if slot.is_terminal() {
            self.retire(slot);
        }
        self.flush(fx);
        Ok(())
    }

    fn persist(&self, instance: &WorkflowInstance) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal
                .append(&instance.id, instance)
                .context(format!("Failed to journal instance {}", instance.id))?;
        }
        Ok(())
    }

    /// Move a finished instance from the live table to the archive
    fn retire(&self, instance: &WorkflowInstance) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.archive(&instance.id)
        {
            warn!(instance_id = %instance.id, error = %e, "Failed to archive instance stream");
        }
        if let Ok(mut archive) = self.archive.write() {
            archive.insert(instance.id.clone(), instance.clone());
        }
        if let Ok(mut live) = self.live.write() {
            live.remove(&instance.id);
        }
        info!(instance_id = %instance.id, workflow = %instance.workflow, state = %instance.state, "Instance finished");
    }

    fn flush(&self, fx: Effects) {
        for (agent, latency) in fx.latencies {
            self.monitor.record_latency(&agent, latency);
        }
        for (agent, success) in fx.outcomes {
            self.monitor.record_outcome(&agent, success);
        }
        for event in fx.events {
            let event_type = event.event_type.clone();
            if let Err(e) = self.bus.publish(event) {
                error!(%event_type, error = %e, "Failed to publish follow-up event");
            }
        }
    }

    fn slot(&self, instance_id: &str) -> Option<InstanceSlot> {
        self.live.read().ok()?.get(instance_id).map(|entry| entry.slot.clone())
    }

    fn live_slots(&self) -> Vec<(String, InstanceSlot)> {
        let mut slots: Vec<(String, InstanceSlot)> = self
            .live
            .read()
            .map(|live| live.iter().map(|(id, entry)| (id.clone(), entry.slot.clone())).collect())
            .unwrap_or_default();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    fn archived_state(&self, instance_id: &str) -> Option<WorkflowState> {
        self.archive.read().ok()?.get(instance_id).map(|instance| instance.state)
    }

    /// Number of live instances
    pub fn live_count(&self) -> usize {
        self.live.read().map(|live| live.len()).unwrap_or(0)
    }

    /// Snapshot of one instance, live or finished
    pub async fn instance(&self, instance_id: &str) -> Option<WorkflowInstance> {
        if let Some(slot) = self.slot(instance_id) {
            return Some(slot.lock().await.clone());
        }
        self.archive.read().ok()?.get(instance_id).cloned()
    }

    /// Snapshots of live instances, plus finished ones when asked, oldest first
    pub async fn instances(&self, include_finished: bool) -> Vec<WorkflowInstance> {
        let mut instances = Vec::new();
        for (_, slot) in self.live_slots() {
            instances.push(slot.lock().await.clone());
        }
        if include_finished && let Ok(archive) = self.archive.read() {
            instances.extend(archive.values().cloned());
        }
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        instances
    }

    /// Every decision still waiting for a human
    pub async fn pending_decisions(&self) -> Vec<HitlDecision> {
        let mut pending = Vec::new();
        for (_, slot) in self.live_slots() {
            if let Some(decision) = slot.lock().await.pending_decision() {
                pending.push(decision.clone());
            }
        }
        pending
    }

    /// Rebuild instances from the journal; the last snapshot of each stream wins
    ///
    /// Definitions must be registered first. Terminal instances still in a
    /// live stream are archived.
    pub fn restore(&self) -> Result<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };

        let mut restored = 0;
        for stream in journal.streams()? {
            if stream.starts_with('_') || self.slot(&stream).is_some() {
                continue;
            }
            let Some(entry) = journal.read::<WorkflowInstance>(&stream)?.pop() else {
                continue;
            };
            let instance = entry.record;
            if self.definition(&instance.workflow).is_none() {
                warn!(instance_id = %instance.id, workflow = %instance.workflow, "Skipping instance of unknown workflow");
                continue;
            }

            if instance.is_terminal() {
                self.retire(&instance);
            } else if let Ok(mut live) = self.live.write() {
                live.insert(
                    instance.id.clone(),
                    LiveEntry {
                        workflow: instance.workflow.clone(),
                        slot: Arc::new(Mutex::new(instance)),
                    },
                );
            }
            restored += 1;
        }

        for stream in journal.archived_streams()? {
            if stream.starts_with('_') || self.archived_state(&stream).is_some() {
                continue;
            }
            if let Some(entry) = journal.read_archived::<WorkflowInstance>(&stream)?.pop()
                && let Ok(mut archive) = self.archive.write()
            {
                archive.insert(entry.record.id.clone(), entry.record);
            }
        }

        info!(restored, "WorkflowOrchestrator::restore: replayed journal");
        Ok(restored)
    }
}
