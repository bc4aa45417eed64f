//! PolicyEngine - gating rules evaluated before a workflow transition
//!
//! Rules are pure predicates over a [`PolicyContext`] snapshot. Higher priority
//! rules are checked first, insertion order breaks ties, the first match wins
//! and no match means allow.

use std::collections::HashMap;
use std::sync::RwLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::PolicyError;
use crate::events::Payload;

/// What a matching rule does to the transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Effect {
    #[default]
    Allow,
    Deny,
    RequireApproval,
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
            Self::RequireApproval => write!(f, "require-approval"),
        }
    }
}

/// Condition under which a rule applies
///
/// Payload keys may be dotted paths into nested objects (`artifact.size`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Predicate {
    Always,
    EventType { value: String },
    Workflow { value: String },
    Step { value: String },
    Source { value: String },
    PayloadEquals { key: String, value: Value },
    PayloadExists { key: String },
    PayloadAbove { key: String, value: f64 },
    PayloadBelow { key: String, value: f64 },
    PayloadMatches { key: String, pattern: String },
    ErrorRateAbove { value: f64 },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    fn patterns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::PayloadMatches { pattern, .. } => out.push(pattern),
            Self::All { of } | Self::Any { of } => of.iter().for_each(|p| p.patterns(out)),
            Self::Not { predicate } => predicate.patterns(out),
            _ => {}
        }
    }

    fn matches(&self, ctx: &PolicyContext, regexes: &HashMap<String, Regex>) -> bool {
        match self {
            Self::Always => true,
            Self::EventType { value } => ctx.event_type == *value,
            Self::Workflow { value } => ctx.workflow == *value,
            Self::Step { value } => ctx.step == *value,
            Self::Source { value } => ctx.source == *value,
            Self::PayloadEquals { key, value } => ctx.field(key) == Some(value),
            Self::PayloadExists { key } => ctx.field(key).is_some(),
            Self::PayloadAbove { key, value } => ctx.number(key).is_some_and(|n| n > *value),
            Self::PayloadBelow { key, value } => ctx.number(key).is_some_and(|n| n < *value),
            Self::PayloadMatches { key, pattern } => match (ctx.field(key), regexes.get(pattern)) {
                (Some(Value::String(s)), Some(re)) => re.is_match(s),
                (Some(other), Some(re)) if !other.is_null() => re.is_match(&other.to_string()),
                _ => false,
            },
            Self::ErrorRateAbove { value } => ctx.agent_error_rate > *value,
            Self::All { of } => of.iter().all(|p| p.matches(ctx, regexes)),
            Self::Any { of } => of.iter().any(|p| p.matches(ctx, regexes)),
            Self::Not { predicate } => !predicate.matches(ctx, regexes),
        }
    }
}

/// A gating rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    pub when: Predicate,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyRule {
    pub fn new(id: impl Into<String>, priority: i32, when: Predicate, effect: Effect) -> Self {
        Self {
            id: id.into(),
            priority,
            when,
            effect,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Check every regex in the rule compiles
    pub fn validate(&self) -> Result<(), PolicyError> {
        self.compile().map(|_| ())
    }

    fn compile(&self) -> Result<Vec<(String, Regex)>, PolicyError> {
        let mut patterns = Vec::new();
        self.when.patterns(&mut patterns);
        patterns
            .into_iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .map(|re| (pattern.to_string(), re))
                    .map_err(|e| PolicyError::InvalidPattern {
                        rule: self.id.clone(),
                        message: e.to_string(),
                    })
            })
            .collect()
    }
}

/// Immutable view of a pending transition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    pub workflow: String,
    pub step: String,
    pub step_index: usize,
    pub event_type: String,
    pub source: String,
    pub payload: Payload,
    pub assigned_agent: Option<String>,
    pub agent_error_rate: f64,
    pub escalations: u32,
}

impl PolicyContext {
    fn field(&self, key: &str) -> Option<&Value> {
        let mut parts = key.split('.');
        let first = self.payload.get(parts.next()?)?;
        parts.try_fold(first, |value, part| value.as_object()?.get(part))
    }

    fn number(&self, key: &str) -> Option<f64> {
        match self.field(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Result of an evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyDecision {
    /// Decision when no rule matched
    pub fn default_allow() -> Self {
        Self {
            effect: Effect::Allow,
            rule_id: None,
            reason: None,
        }
    }
}

#[derive(Default)]
struct RuleSet {
    /// Sorted by descending priority, stable for ties
    rules: Vec<PolicyRule>,
    regexes: HashMap<String, Regex>,
}

#[derive(Default)]
pub struct PolicyEngine {
    inner: RwLock<RuleSet>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an engine from a list of rules, in order
    pub fn with_rules(rules: impl IntoIterator<Item = PolicyRule>) -> Result<Self, PolicyError> {
        let engine = Self::new();
        for rule in rules {
            engine.add_rule(rule)?;
        }
        Ok(engine)
    }

    /// Add a rule after validating it
    pub fn add_rule(&self, rule: PolicyRule) -> Result<(), PolicyError> {
        let compiled = rule.compile()?;
        let Ok(mut set) = self.inner.write() else {
            warn!("PolicyEngine::add_rule: rule set poisoned");
            return Ok(());
        };
        if set.rules.iter().any(|r| r.id == rule.id) {
            return Err(PolicyError::DuplicateRule(rule.id));
        }

        info!(rule_id = %rule.id, priority = rule.priority, effect = %rule.effect, "Adding policy rule");
        set.regexes.extend(compiled);
        let position = set
            .rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(set.rules.len());
        set.rules.insert(position, rule);
        Ok(())
    }

    /// Remove a rule by id
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let Ok(mut set) = self.inner.write() else {
            return false;
        };
        let before = set.rules.len();
        set.rules.retain(|r| r.id != rule_id);
        set.rules.len() != before
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> Vec<PolicyRule> {
        self.inner.read().map(|set| set.rules.clone()).unwrap_or_default()
    }

    /// Evaluate a context against the rules
    pub fn evaluate(&self, ctx: &PolicyContext) -> PolicyDecision {
        let Ok(set) = self.inner.read() else {
            warn!("PolicyEngine::evaluate: rule set poisoned, allowing");
            return PolicyDecision::default_allow();
        };

        let decision = set
            .rules
            .iter()
            .find(|rule| rule.when.matches(ctx, &set.regexes))
            .map(|rule| PolicyDecision {
                effect: rule.effect,
                rule_id: Some(rule.id.clone()),
                reason: rule.reason.clone(),
            })
            .unwrap_or_else(PolicyDecision::default_allow);

        debug!(
            workflow = %ctx.workflow,
            step = %ctx.step,
            event_type = %ctx.event_type,
            effect = %decision.effect,
            rule_id = ?decision.rule_id,
            "PolicyEngine::evaluate"
        );
        decision
    }
}
