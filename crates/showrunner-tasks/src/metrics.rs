//! Aggregated counters and derived rates
//!
//! Counters are cumulative and updated atomically by the lifecycle manager;
//! rates are always computed, never stored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counter key names as persisted in the store
pub mod counters {
    pub const TOTAL_SUBMITTED: &str = "total_submitted";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const RETRIED: &str = "retried";
    pub const CANCELLED: &str = "cancelled";
    pub const CURRENTLY_RUNNING: &str = "currently_running";

    /// Per-task-type submission counter key
    pub fn submitted_for(task_type: crate::task::TaskType) -> String {
        format!("submitted:{}", task_type)
    }
}

/// Point-in-time snapshot of the metrics counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub total_submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    /// Gauge: incremented on ->Running, decremented on ->terminal
    pub currently_running: i64,
    /// Cumulative submissions broken down by task type
    #[serde(default)]
    pub submitted_by_type: HashMap<String, u64>,
}

impl CounterSnapshot {
    /// `completed / (completed + failed) * 100`; 100 when nothing finished yet
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            100.0
        } else {
            self.completed as f64 / finished as f64 * 100.0
        }
    }

    /// `failed / (completed + failed) * 100`; 0 when nothing finished yet
    pub fn failure_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.failed as f64 / finished as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let snapshot = CounterSnapshot {
            completed: 70,
            failed: 30,
            ..Default::default()
        };
        assert!((snapshot.failure_rate() - 30.0).abs() < f64::EPSILON);
        assert!((snapshot.success_rate() - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rates_with_no_finished_tasks() {
        let snapshot = CounterSnapshot::default();
        assert_eq!(snapshot.success_rate(), 100.0);
        assert_eq!(snapshot.failure_rate(), 0.0);
    }

    #[test]
    fn test_per_type_counter_key() {
        assert_eq!(
            counters::submitted_for(crate::task::TaskType::GenerateVideo),
            "submitted:generate_video"
        );
    }
}
