//! Queue entry envelope carried through the broker
//!
//! Entries are not authoritative; the store record is. A worker that pulls an
//! entry whose record is missing or terminal just acks and drops it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Small envelope enqueued per dispatch attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub enqueued_at: DateTime<Utc>,
    /// Attempt this entry dispatches; 0 for the first run
    pub attempt: u32,
}

impl QueueEntry {
    /// Create an entry for the first dispatch of a task
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }

    /// Successor entry for the next retry attempt
    pub fn for_retry(task_id: TaskId, attempt: u32) -> Self {
        Self {
            task_id,
            enqueued_at: Utc::now(),
            attempt,
        }
    }
}
