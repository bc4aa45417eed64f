//! Switchyard - wires the bus, registry, monitor, policy engine and
//! orchestrator into one kernel

use std::path::Path;
use std::sync::Arc;

use eyre::{Context, Result};
use journalstore::{Journal, JournalLock};
use tracing::{debug, info};

use crate::agent::AgentClient;
use crate::config::Config;
use crate::events::EventBus;
use crate::monitor::PerformanceMonitor;
use crate::policy::PolicyEngine;
use crate::registry::AgentRegistry;
use crate::workflow::{EscalationManager, WorkflowOrchestrator};

pub struct Switchyard {
    config: Config,
    journal: Option<Arc<Journal>>,
    /// Held for the kernel's lifetime; one writer per journal
    _lock: Option<JournalLock>,
    bus: Arc<EventBus>,
    monitor: Arc<PerformanceMonitor>,
    registry: Arc<AgentRegistry>,
    policy: Arc<PolicyEngine>,
    orchestrator: Arc<WorkflowOrchestrator>,
}

impl Switchyard {
    /// Build a kernel, journaling to `storage.journal-dir` when persistence is on
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: &Config) -> Result<Self> {
        if config.storage.persist {
            Self::with_journal_dir(config, &config.storage.journal_dir)
        } else {
            Self::build(config, None, None)
        }
    }

    /// Build a kernel journaling to an explicit directory
    ///
    /// Fails while another kernel, in this process or another, has the same
    /// journal open.
    pub fn with_journal_dir(config: &Config, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let journal = Journal::open(dir).context(format!("Failed to open journal at {}", dir.display()))?;
        let lock = journal.lock_exclusive()?;
        Self::build(config, Some(Arc::new(journal)), Some(lock))
    }

    /// Build a kernel that keeps everything in memory
    pub fn in_memory(config: &Config) -> Result<Self> {
        Self::build(config, None, None)
    }

    fn build(config: &Config, journal: Option<Arc<Journal>>, lock: Option<JournalLock>) -> Result<Self> {
        debug!(persistent = journal.is_some(), "Switchyard::build: called");
        config.validate()?;

        let monitor = Arc::new(match &journal {
            Some(journal) => PerformanceMonitor::with_journal(journal.clone()),
            None => PerformanceMonitor::new(),
        });
        let bus = Arc::new(match &journal {
            Some(journal) => EventBus::with_journal(&config.bus, journal.clone()),
            None => EventBus::new(&config.bus),
        });
        let registry = Arc::new(AgentRegistry::new(monitor.clone(), config.registry.error_rate_window));
        let policy = Arc::new(PolicyEngine::with_rules(config.policies.iter().cloned())?);

        let approval_timeout = i64::try_from(config.escalation.default_approval_timeout_secs)
            .map(chrono::Duration::seconds)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let orchestrator = WorkflowOrchestrator::new(
            bus.clone(),
            registry.clone(),
            policy.clone(),
            monitor.clone(),
            journal.clone(),
            approval_timeout,
        );

        for agent in &config.agents {
            registry.register(&agent.id, &agent.capabilities)?;
        }
        for workflow in &config.workflows {
            orchestrator.register_definition(workflow.clone())?;
        }

        let events = bus.restore()?;
        let samples = monitor.restore()?;
        let instances = orchestrator.restore()?;
        info!(
            agents = config.agents.len(),
            workflows = config.workflows.len(),
            rules = config.policies.len(),
            events,
            samples,
            instances,
            "Switchyard ready"
        );

        Ok(Self {
            config: config.clone(),
            journal,
            _lock: lock,
            bus,
            monitor,
            registry,
            policy,
            orchestrator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn orchestrator(&self) -> &Arc<WorkflowOrchestrator> {
        &self.orchestrator
    }

    /// Escalation manager sweeping this kernel's instances
    pub fn escalation_manager(&self) -> Arc<EscalationManager> {
        Arc::new(EscalationManager::new(self.orchestrator.clone(), &self.config.escalation))
    }

    /// Facade for one agent
    pub fn agent(&self, agent_id: &str) -> AgentClient {
        AgentClient::new(agent_id, self.bus.clone(), self.bus.clone())
    }

    /// Wait for every queued delivery, including the cascades they trigger
    pub async fn settle(&self) {
        self.bus.wait_idle().await;
    }
}
