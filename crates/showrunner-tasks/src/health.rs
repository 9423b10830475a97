//! Threshold-based health evaluation
//!
//! Health is computed, never stored: counters give the failure rate, the
//! running index gives long-running and stale tasks, and the overall status
//! is the maximum severity of any alert.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::metrics::CounterSnapshot;
use crate::routing::TaskRouter;
use crate::store::TaskStore;
use crate::task::TaskId;
use crate::TaskError;

/// Overall service status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// Alert classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    ElevatedFailureRate,
    HighFailureRate,
    LongRunningTask,
    StaleTask,
}

/// One triggered alert
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: HealthStatus,
    pub message: String,
    /// Numeric value behind the alert (rate percentage or age in seconds)
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Health report returned by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub alerts: Vec<Alert>,
}

/// Evaluates counters and running tasks against the alert thresholds
pub struct HealthChecker {
    store: Arc<dyn TaskStore>,
    router: Arc<TaskRouter>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn TaskStore>, router: Arc<TaskRouter>) -> Self {
        Self { store, router }
    }

    pub async fn check(&self) -> Result<HealthReport, TaskError> {
        let counters = self.store.read_counters().await?;
        let running = self.store.list_running().await?;

        let mut alerts = Vec::new();
        self.failure_rate_alerts(&counters, &mut alerts);
        self.running_task_alerts(&running, &mut alerts);

        let status = alerts
            .iter()
            .map(|a| a.severity)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Ok(HealthReport { status, alerts })
    }

    fn failure_rate_alerts(&self, counters: &CounterSnapshot, alerts: &mut Vec<Alert>) {
        let failure_rate = counters.failure_rate();
        if failure_rate > 20.0 {
            alerts.push(Alert {
                kind: AlertKind::HighFailureRate,
                severity: HealthStatus::Critical,
                message: format!("Failure rate at {:.1}%", failure_rate),
                value: failure_rate,
                task_id: None,
            });
        } else if failure_rate > 10.0 {
            alerts.push(Alert {
                kind: AlertKind::ElevatedFailureRate,
                severity: HealthStatus::Warning,
                message: format!("Failure rate at {:.1}%", failure_rate),
                value: failure_rate,
                task_id: None,
            });
        }
    }

    fn running_task_alerts(&self, running: &[crate::task::TaskRecord], alerts: &mut Vec<Alert>) {
        let now = Utc::now();
        for record in running {
            let policy = self.router.policy(record.task_type);

            if let Some(started_at) = record.started_at {
                let age = (now - started_at).num_seconds().max(0) as f64;
                let threshold = policy.hard_timeout.as_secs_f64() * 0.8;
                if age > threshold {
                    alerts.push(Alert {
                        kind: AlertKind::LongRunningTask,
                        severity: HealthStatus::Warning,
                        message: format!(
                            "Task {} running for {:.0}s (80% of {}s hard timeout)",
                            record.id,
                            age,
                            policy.hard_timeout.as_secs()
                        ),
                        value: age,
                        task_id: Some(record.id.clone()),
                    });
                }
            }

            let silent = (now - record.last_activity_at()).num_seconds().max(0) as f64;
            if silent > policy.staleness_bound().as_secs_f64() {
                alerts.push(Alert {
                    kind: AlertKind::StaleTask,
                    severity: HealthStatus::Warning,
                    message: format!("Task {} silent for {:.0}s", record.id, silent),
                    value: silent,
                    task_id: Some(record.id.clone()),
                });
            }
        }
    }
}
