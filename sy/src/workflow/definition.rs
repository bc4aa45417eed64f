//! Workflow templates
//!
//! A [`WorkflowDefinition`] is immutable once registered. Each step names the
//! event types that complete it, and optionally the events that fail it, the
//! capabilities its assignee needs, and whether a human must approve it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::events::WILDCARD;

/// What the escalation sweep does when a step times out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutPolicy {
    #[default]
    Fail,
    Reassign,
}

/// One step of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,

    /// Event types that complete the step; the step name when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,

    /// Event types that fail the instance while this step is current
    #[serde(default, rename = "failure-events", skip_serializing_if = "Vec::is_empty")]
    pub failure_events: Vec<String>,

    /// Tags the assignee must carry; no assignment when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    /// Suspend for a human decision when the step is entered
    #[serde(default, rename = "requires-approval")]
    pub requires_approval: bool,

    #[serde(default, rename = "timeout-secs", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
            failure_events: Vec::new(),
            capabilities: Vec::new(),
            requires_approval: false,
            timeout_secs: None,
        }
    }

    pub fn on_event(mut self, event_type: impl Into<String>) -> Self {
        self.events.push(event_type.into());
        self
    }

    pub fn fails_on_event(mut self, event_type: impl Into<String>) -> Self {
        self.failure_events.push(event_type.into());
        self
    }

    pub fn with_capabilities<S: AsRef<str>>(mut self, capabilities: &[S]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.as_ref().to_string()).collect();
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Event types that complete this step
    pub fn accepted_events(&self) -> Vec<String> {
        if self.events.is_empty() {
            vec![self.name.clone()]
        } else {
            self.events.clone()
        }
    }

    pub fn accepts(&self, event_type: &str) -> bool {
        if self.events.is_empty() {
            self.name == event_type
        } else {
            self.events.iter().any(|e| e == event_type)
        }
    }

    pub fn fails_on(&self, event_type: &str) -> bool {
        self.failure_events.iter().any(|e| e == event_type)
    }

    pub fn timeout(&self) -> Option<chrono::Duration> {
        self.timeout_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }
}

/// Immutable multi-step workflow template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    pub steps: Vec<StepDefinition>,

    #[serde(default, rename = "on-timeout")]
    pub on_timeout: TimeoutPolicy,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps,
            on_timeout: TimeoutPolicy::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.on_timeout = policy;
        self
    }

    /// Check the definition can be registered
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let invalid = |message: String| OrchestratorError::InvalidDefinition {
            workflow: self.name.clone(),
            message,
        };

        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(invalid("name must be non-empty and contain no whitespace".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("at least one step is required".to_string()));
        }

        let mut names = BTreeSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(invalid("step names must not be empty".to_string()));
            }
            if !names.insert(step.name.as_str()) {
                return Err(invalid(format!("duplicate step name '{}'", step.name)));
            }
            if step.timeout_secs == Some(0) {
                return Err(invalid(format!("step '{}' has a zero timeout", step.name)));
            }
            if let Some(bad) = step
                .accepted_events()
                .iter()
                .chain(&step.failure_events)
                .find(|e| e.trim().is_empty() || *e == WILDCARD)
            {
                return Err(invalid(format!("step '{}' listens to invalid event type '{}'", step.name, bad)));
            }
        }
        Ok(())
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    /// Every event type an instance of this workflow reacts to
    pub fn event_types(&self) -> BTreeSet<String> {
        let mut types: BTreeSet<String> = self
            .steps
            .iter()
            .flat_map(|step| step.accepted_events().into_iter().chain(step.failure_events.iter().cloned()))
            .collect();
        types.insert(self.approval_event());
        types
    }

    pub fn started_event(&self) -> String {
        format!("{}_started", self.name)
    }

    pub fn step_requested_event(&self) -> String {
        format!("{}_step_requested", self.name)
    }

    pub fn approval_requested_event(&self) -> String {
        format!("{}_approval_requested", self.name)
    }

    /// Resolves decisions opened by a policy rule
    pub fn approval_event(&self) -> String {
        format!("{}_approval", self.name)
    }

    pub fn completed_event(&self) -> String {
        format!("{}_completed", self.name)
    }

    pub fn failed_event(&self) -> String {
        format!("{}_failed", self.name)
    }

    pub fn escalated_event(&self) -> String {
        format!("{}_escalated", self.name)
    }

    pub fn cancelled_event(&self) -> String {
        format!("{}_cancelled", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "release",
            vec![
                StepDefinition::new("build_requested").fails_on_event("build_failed"),
                StepDefinition::new("tests_passed"),
                StepDefinition::new("release_approved").with_approval().with_timeout_secs(60),
                StepDefinition::new("deploy")
                    .on_event("release_deployed")
                    .with_capabilities(&["deploy"]),
            ],
        )
    }

    #[test]
    fn test_valid_definition() {
        let def = release();
        assert!(def.validate().is_ok());
        assert!(def.steps[0].accepts("build_requested"));
        assert!(def.steps[0].fails_on("build_failed"));
        assert!(def.steps[3].accepts("release_deployed"));
        assert!(!def.steps[3].accepts("deploy"));
        assert_eq!(def.steps[2].timeout(), Some(chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_event_types_include_approval() {
        let types = release().event_types();
        assert!(types.contains("build_requested"));
        assert!(types.contains("build_failed"));
        assert!(types.contains("release_deployed"));
        assert!(types.contains("release_approval"));
        assert!(!types.contains("deploy"));
    }

    #[test]
    fn test_invalid_definitions() {
        assert!(WorkflowDefinition::new("bad name", vec![StepDefinition::new("a")]).validate().is_err());
        assert!(WorkflowDefinition::new("empty", vec![]).validate().is_err());
        assert!(
            WorkflowDefinition::new("dup", vec![StepDefinition::new("a"), StepDefinition::new("a")])
                .validate()
                .is_err()
        );
        assert!(
            WorkflowDefinition::new("wild", vec![StepDefinition::new("a").on_event("*")])
                .validate()
                .is_err()
        );
        assert!(
            WorkflowDefinition::new("zero", vec![StepDefinition::new("a").with_timeout_secs(0)])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_event_names() {
        let def = release();
        assert_eq!(def.completed_event(), "release_completed");
        assert_eq!(def.failed_event(), "release_failed");
        assert_eq!(def.escalated_event(), "release_escalated");
        assert_eq!(def.approval_requested_event(), "release_approval_requested");
    }

    #[test]
    fn test_from_yaml() {
        let def: WorkflowDefinition = serde_yaml::from_str(
            r#"
name: release
on-timeout: reassign
steps:
  - name: build
    events: [build_done]
    failure-events: [build_failed]
    capabilities: [build]
    timeout-secs: 30
"#,
        )
        .unwrap();
        assert_eq!(def.on_timeout, TimeoutPolicy::Reassign);
        assert_eq!(def.steps[0].capabilities, vec!["build"]);
        assert_eq!(def.steps[0].timeout_secs, Some(30));
        assert!(def.validate().is_ok());
    }
}
