//! AgentRegistry - capability-based assignment
//!
//! Candidates are agents whose capability tags are a superset of what a step
//! needs. Among those the lowest recent error rate wins, then the agent that
//! has waited longest since its last assignment, then the smallest id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::monitor::{PerformanceMonitor, Window};

/// A registered agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_assigned_at: Option<DateTime<Utc>>,
    pub assignments: u64,
    /// Position in the global assignment sequence; 0 if never assigned
    #[serde(skip)]
    assignment_order: u64,
}

impl AgentRecord {
    fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, AgentRecord>>,
    monitor: Arc<PerformanceMonitor>,
    window: usize,
    assignment_seq: AtomicU64,
}

impl AgentRegistry {
    /// Create a registry ranking agents by their last `window` outcomes
    pub fn new(monitor: Arc<PerformanceMonitor>, window: usize) -> Self {
        debug!(window, "AgentRegistry::new: called");
        Self {
            agents: RwLock::new(BTreeMap::new()),
            monitor,
            window: window.max(1),
            assignment_seq: AtomicU64::new(0),
        }
    }

    /// Register an agent, replacing the capabilities of an existing one
    pub fn register<S: AsRef<str>>(&self, agent_id: &str, capabilities: &[S]) -> Result<(), RegistryError> {
        if agent_id.trim().is_empty() {
            return Err(RegistryError::EmptyAgentId);
        }
        let capabilities: BTreeSet<String> = capabilities.iter().map(|c| c.as_ref().to_string()).collect();
        info!(%agent_id, ?capabilities, "Registering agent");

        let Ok(mut agents) = self.agents.write() else {
            warn!("AgentRegistry::register: agent table poisoned");
            return Ok(());
        };
        agents
            .entry(agent_id.to_string())
            .and_modify(|record| record.capabilities = capabilities.clone())
            .or_insert_with(|| AgentRecord {
                id: agent_id.to_string(),
                capabilities,
                registered_at: Utc::now(),
                last_assigned_at: None,
                assignments: 0,
                assignment_order: 0,
            });
        Ok(())
    }

    /// Remove an agent; returns false if it was unknown
    pub fn unregister(&self, agent_id: &str) -> bool {
        debug!(%agent_id, "AgentRegistry::unregister: called");
        self.agents
            .write()
            .map(|mut agents| agents.remove(agent_id).is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().ok().and_then(|agents| agents.get(agent_id).cloned())
    }

    /// All agents, ordered by id
    pub fn agents(&self) -> Vec<AgentRecord> {
        self.agents
            .read()
            .map(|agents| agents.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Recent error rate used for ranking
    pub fn error_rate(&self, agent_id: &str) -> f64 {
        self.monitor.error_rate(agent_id, Window::Last(self.window))
    }

    /// Pick and record an assignee for the required capabilities
    pub fn best_match<S: AsRef<str>>(&self, required: &[S]) -> Result<String, RegistryError> {
        self.best_match_excluding(required, None)
    }

    /// Like [`best_match`](Self::best_match), never returning `exclude`
    pub fn best_match_excluding<S: AsRef<str>>(
        &self,
        required: &[S],
        exclude: Option<&str>,
    ) -> Result<String, RegistryError> {
        let required: BTreeSet<String> = required.iter().map(|c| c.as_ref().to_string()).collect();
        debug!(?required, ?exclude, "AgentRegistry::best_match: called");

        let no_match = || RegistryError::NoCapableAgent {
            required: required.iter().cloned().collect(),
        };

        let Ok(mut agents) = self.agents.write() else {
            warn!("AgentRegistry::best_match: agent table poisoned");
            return Err(no_match());
        };

        let chosen = agents
            .values()
            .filter(|record| record.satisfies(&required) && Some(record.id.as_str()) != exclude)
            .map(|record| (self.error_rate(&record.id), record))
            .min_by(|(rate_a, a), (rate_b, b)| {
                rate_a
                    .total_cmp(rate_b)
                    .then(a.assignment_order.cmp(&b.assignment_order))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(rate, record)| (rate, record.id.clone()));

        let Some((rate, agent_id)) = chosen else {
            warn!(?required, ?exclude, "No capable agent");
            return Err(no_match());
        };

        if let Some(record) = agents.get_mut(&agent_id) {
            record.assignments += 1;
            record.last_assigned_at = Some(Utc::now());
            record.assignment_order = self.assignment_seq.fetch_add(1, Ordering::Relaxed) + 1;
        }

        debug!(%agent_id, error_rate = rate, "AgentRegistry::best_match: selected");
        Ok(agent_id)
    }
}
