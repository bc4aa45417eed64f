//! EscalationManager - the only component that acts on expired deadlines

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::orchestrator::{TimeoutOutcome, WorkflowOrchestrator};
use crate::config::EscalationConfig;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Overdue instances found
    pub scanned: usize,
    /// Instances whose timeout was applied
    pub escalated: usize,
    pub reassigned: usize,
    pub failed: usize,
}

pub struct EscalationManager {
    orchestrator: Arc<WorkflowOrchestrator>,
    sweep_interval: Duration,
}

impl EscalationManager {
    pub fn new(orchestrator: Arc<WorkflowOrchestrator>, config: &EscalationConfig) -> Self {
        debug!(sweep_interval_ms = config.sweep_interval_ms, "EscalationManager::new: called");
        Self {
            orchestrator,
            sweep_interval: Duration::from_millis(config.sweep_interval_ms),
        }
    }

    /// Apply the timeout policy to every instance overdue at `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let overdue = self.orchestrator.overdue(now).await;
        let mut report = SweepReport {
            scanned: overdue.len(),
            ..Default::default()
        };

        for instance_id in overdue {
            match self.orchestrator.apply_timeout(&instance_id, now).await {
                Ok(Some(outcome)) => {
                    report.escalated += 1;
                    match outcome {
                        TimeoutOutcome::Reassigned { .. } => report.reassigned += 1,
                        TimeoutOutcome::Failed => report.failed += 1,
                    }
                }
                // Resolved between the scan and the lock
                Ok(None) => debug!(%instance_id, "EscalationManager::sweep: no longer overdue"),
                Err(e) => error!(%instance_id, error = %e, "Failed to apply timeout"),
            }
        }

        if report.escalated > 0 {
            info!(
                scanned = report.scanned,
                reassigned = report.reassigned,
                failed = report.failed,
                "Escalation sweep"
            );
        }
        report
    }

    /// Sweep on every tick until a shutdown signal arrives
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(interval_ms = self.sweep_interval.as_millis() as u64, "EscalationManager starting");
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(Utc::now()).await;
                }

                _ = shutdown_rx.recv() => {
                    debug!("run: shutdown signal received");
                    info!("EscalationManager stopping");
                    break;
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown_rx).await })
    }
}
