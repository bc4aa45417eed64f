//! Switchyard configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};

use crate::policy::PolicyRule;
use crate::workflow::WorkflowDefinition;

/// Main Switchyard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event bus tuning
    pub bus: BusConfig,

    /// Escalation sweep settings
    pub escalation: EscalationConfig,

    /// Agent selection settings
    pub registry: RegistryConfig,

    /// Journal location
    pub storage: StorageConfig,

    /// Agents registered at startup
    pub agents: Vec<AgentConfig>,

    /// Policy rules loaded at startup
    pub policies: Vec<PolicyRule>,

    /// Workflow definitions loaded at startup
    pub workflows: Vec<WorkflowDefinition>,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        if self.escalation.sweep_interval_ms == 0 {
            return Err(eyre!("escalation.sweep-interval-ms must be greater than zero"));
        }
        if self.registry.error_rate_window == 0 {
            return Err(eyre!("registry.error-rate-window must be greater than zero"));
        }

        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(eyre!("Agent id must not be empty"));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(eyre!("Duplicate agent id: {}", agent.id));
            }
        }

        let mut rule_ids = std::collections::HashSet::new();
        for rule in &self.policies {
            rule.validate()?;
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(eyre!("Duplicate policy rule id: {}", rule.id));
            }
        }

        let mut names = std::collections::HashSet::new();
        for workflow in &self.workflows {
            workflow.validate()?;
            if !names.insert(workflow.name.as_str()) {
                return Err(eyre!("Duplicate workflow name: {}", workflow.name));
            }
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .switchyard.yml
        let local_config = PathBuf::from(".switchyard.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/switchyard/switchyard.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("switchyard").join("switchyard.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Event bus tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Accepted events kept in memory for inspection
    #[serde(rename = "history-capacity")]
    pub history_capacity: usize,

    /// Retries after a handler fails before the event is dead-lettered
    #[serde(rename = "max-redeliveries")]
    pub max_redeliveries: u32,

    /// Base delay between retries; grows linearly per attempt
    #[serde(rename = "redelivery-backoff-ms")]
    pub redelivery_backoff_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            max_redeliveries: 3,
            redelivery_backoff_ms: 100,
        }
    }
}

/// Escalation sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// How often overdue instances are swept
    #[serde(rename = "sweep-interval-ms")]
    pub sweep_interval_ms: u64,

    /// Approval deadline for steps without their own timeout
    #[serde(rename = "default-approval-timeout-secs")]
    pub default_approval_timeout_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5000,
            default_approval_timeout_secs: 3600,
        }
    }
}

/// Agent selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Number of recent outcomes used for an agent's error rate
    #[serde(rename = "error-rate-window")]
    pub error_rate_window: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { error_rate_window: 100 }
    }
}

/// Journal location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the journal
    #[serde(rename = "journal-dir")]
    pub journal_dir: String,

    /// Whether state is journaled at all
    pub persist: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/switchyard/journal on Linux)
        let journal_dir = dirs::data_local_dir()
            .map(|d| d.join("switchyard").join("journal"))
            .unwrap_or_else(|| PathBuf::from(".switchyard"))
            .to_string_lossy()
            .into_owned();

        Self {
            journal_dir,
            persist: true,
        }
    }
}

/// An agent registered at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}
