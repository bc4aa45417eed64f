//! PerformanceMonitor - per-agent metric samples and derived aggregates
//!
//! Samples are append-only and keyed by (agent, metric). Aggregates are always
//! computed from the samples on demand; nothing derived is stored.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use journalstore::Journal;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

/// Journal stream receiving every sample
pub const METRICS_STREAM: &str = "_metrics";

/// 1.0 for a successful step, 0.0 for a failed one
pub const OUTCOME_METRIC: &str = "outcome";

/// Time an agent spent on a step
pub const LATENCY_METRIC: &str = "step_latency_ms";

/// A single measurement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub agent_id: String,
    pub metric_name: String,
    /// Non-finite values serialize as null and come back as NaN
    #[serde(deserialize_with = "nan_if_null")]
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

fn nan_if_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Which samples an aggregate covers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    All,
    /// The most recent n samples
    Last(usize),
    /// Samples no older than the duration
    Since(chrono::Duration),
}

/// Derived statistics over a window
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Aggregate {
    /// Finite samples in the window
    pub count: usize,
    pub mean: Option<f64>,
    /// Nearest-rank 95th percentile
    pub p95: Option<f64>,
    /// Failure fraction of the agent's outcome samples in the window; 0 when there are none
    pub error_rate: f64,
}

/// One row of [`PerformanceMonitor::summary`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummary {
    pub agent_id: String,
    pub metric_name: String,
    #[serde(flatten)]
    pub aggregate: Aggregate,
}

type SampleKey = (String, String);

/// Metric store shared by the registry, orchestrator and CLI
#[derive(Default)]
pub struct PerformanceMonitor {
    samples: RwLock<HashMap<SampleKey, Vec<MetricSample>>>,
    journal: Option<Arc<Journal>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a monitor that also journals every sample
    pub fn with_journal(journal: Arc<Journal>) -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
            journal: Some(journal),
        }
    }

    /// Record a sample
    pub fn record(&self, agent_id: &str, metric_name: &str, value: f64) {
        debug!(%agent_id, %metric_name, value, "PerformanceMonitor::record: called");
        let sample = MetricSample {
            agent_id: agent_id.to_string(),
            metric_name: metric_name.to_string(),
            value,
            timestamp: Utc::now(),
        };

        if let Some(journal) = &self.journal
            && let Err(e) = journal.append(METRICS_STREAM, &sample)
        {
            warn!(%agent_id, %metric_name, error = %e, "PerformanceMonitor::record: failed to journal sample");
        }

        self.insert(sample);
    }

    /// Record whether an agent's step succeeded
    pub fn record_outcome(&self, agent_id: &str, success: bool) {
        self.record(agent_id, OUTCOME_METRIC, if success { 1.0 } else { 0.0 });
    }

    /// Record how long an agent's step took
    pub fn record_latency(&self, agent_id: &str, latency: Duration) {
        self.record(agent_id, LATENCY_METRIC, latency.as_secs_f64() * 1000.0);
    }

    fn insert(&self, sample: MetricSample) {
        if let Ok(mut samples) = self.samples.write() {
            samples
                .entry((sample.agent_id.clone(), sample.metric_name.clone()))
                .or_default()
                .push(sample);
        }
    }

    /// Aggregate one metric of one agent
    pub fn aggregate(&self, agent_id: &str, metric_name: &str, window: Window) -> Aggregate {
        let mut values: Vec<f64> = self
            .windowed(agent_id, metric_name, window)
            .into_iter()
            .filter(|v| v.is_finite())
            .collect();

        let count = values.len();
        let (mean, p95) = if values.is_empty() {
            (None, None)
        } else {
            values.sort_by(f64::total_cmp);
            let mean = values.iter().sum::<f64>() / count as f64;
            let rank = ((0.95 * count as f64).ceil() as usize).clamp(1, count);
            (Some(mean), Some(values[rank - 1]))
        };

        Aggregate {
            count,
            mean,
            p95,
            error_rate: self.error_rate(agent_id, window),
        }
    }

    /// Failure fraction of an agent's outcome samples
    pub fn error_rate(&self, agent_id: &str, window: Window) -> f64 {
        let outcomes: Vec<f64> = self
            .windowed(agent_id, OUTCOME_METRIC, window)
            .into_iter()
            .filter(|v| v.is_finite())
            .collect();
        if outcomes.is_empty() {
            return 0.0;
        }
        let failures = outcomes.iter().filter(|v| **v < 0.5).count();
        failures as f64 / outcomes.len() as f64
    }

    fn windowed(&self, agent_id: &str, metric_name: &str, window: Window) -> Vec<f64> {
        let Ok(samples) = self.samples.read() else {
            return Vec::new();
        };
        let Some(series) = samples.get(&(agent_id.to_string(), metric_name.to_string())) else {
            return Vec::new();
        };

        match window {
            Window::All => series.iter().map(|s| s.value).collect(),
            Window::Last(n) => series[series.len().saturating_sub(n)..].iter().map(|s| s.value).collect(),
            Window::Since(age) => {
                let cutoff = Utc::now() - age;
                series.iter().filter(|s| s.timestamp >= cutoff).map(|s| s.value).collect()
            }
        }
    }

    /// Agents with at least one sample
    pub fn agents(&self) -> Vec<String> {
        self.keys().into_iter().map(|(agent, _)| agent).collect::<BTreeSet<_>>().into_iter().collect()
    }

    /// Every (agent, metric) pair, aggregated
    pub fn summary(&self, window: Window) -> Vec<MetricSummary> {
        self.keys()
            .into_iter()
            .map(|(agent_id, metric_name)| MetricSummary {
                aggregate: self.aggregate(&agent_id, &metric_name, window),
                agent_id,
                metric_name,
            })
            .collect()
    }

    /// Total number of samples held
    pub fn sample_count(&self) -> usize {
        self.samples
            .read()
            .map(|samples| samples.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn keys(&self) -> Vec<SampleKey> {
        let mut keys: Vec<SampleKey> = self
            .samples
            .read()
            .map(|samples| samples.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Reload samples from the journal
    pub fn restore(&self) -> eyre::Result<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let entries = journal.read::<MetricSample>(METRICS_STREAM)?;
        let count = entries.len();
        for entry in entries {
            self.insert(entry.record);
        }
        info!(count, "PerformanceMonitor::restore: reloaded samples");
        Ok(count)
    }
}
