//! Durable task store
//!
//! The store is the authoritative home of task records, the per-project
//! index, the atomic metrics counters, the revocation set, and the terminal
//! event channel. Every record mutation funnels through
//! [`TaskStore::update_atomically`], a CAS over the record's version counter,
//! which keeps transitions single-writer without a global lock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TaskFailure;
use crate::metrics::CounterSnapshot;
use crate::state::TaskState;
use crate::task::{TaskId, TaskRecord, TaskType};
use crate::TaskError;

/// Bound on internal CAS retries before reporting a conflict
pub(crate) const CAS_MAX_ATTEMPTS: u32 = 5;

/// Page request for project listings (1-based page index)
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

impl PageRequest {
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }
}

/// One page of a project listing
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    /// Total matching records across all pages
    pub total: u64,
}

/// Filters applied to project listings
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub task_type: Option<TaskType>,
}

impl TaskFilter {
    pub fn matches(&self, record: &TaskRecord) -> bool {
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        if let Some(task_type) = self.task_type {
            if record.task_type != task_type {
                return false;
            }
        }
        true
    }
}

/// Decision returned by a mutator passed to [`TaskStore::update_atomically`]
pub enum MutationStep {
    /// Write the given record (the store bumps the version)
    Write(Box<TaskRecord>),
    /// Leave the record untouched and report why
    Abort(String),
}

/// Pure mutator applied under CAS; may run more than once on contention
pub type Mutator = Box<dyn Fn(&TaskRecord) -> MutationStep + Send + Sync>;

/// Result of an atomic update
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The mutation was applied; holds the stored record
    Updated(TaskRecord),
    /// The mutator declined; holds the reason and the untouched record
    Aborted { reason: String, record: TaskRecord },
}

impl UpdateOutcome {
    pub fn record(&self) -> &TaskRecord {
        match self {
            Self::Updated(record) => record,
            Self::Aborted { record, .. } => record,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }
}

/// Event published on every transition into a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalEvent {
    pub task_id: TaskId,
    pub project_id: String,
    pub task_type: TaskType,
    pub state: TaskState,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub metadata: serde_json::Value,
    pub callback_url: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TerminalEvent {
    /// Build the event from a terminal record
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id.clone(),
            project_id: record.project_id.clone(),
            task_type: record.task_type,
            state: record.state,
            result: record.result.clone(),
            error: record.error.clone(),
            metadata: record.metadata.clone(),
            callback_url: record.callback_url.clone(),
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }

    /// Wall-clock execution time in seconds, when known
    pub fn processing_time_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => {
                Some((finished - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// Durable task store backed by a key/value service with atomic ops and pub/sub
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Persist a fresh record; fails with `AlreadyExists` if the id is taken
    async fn create(&self, record: &TaskRecord) -> Result<(), TaskError>;

    /// Fetch a record; `None` once TTL-evicted or never created
    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, TaskError>;

    /// Page through a project's tasks, newest-first by creation time
    async fn list_by_project(
        &self,
        project_id: &str,
        filter: &TaskFilter,
        page: &PageRequest,
    ) -> Result<Page<TaskRecord>, TaskError>;

    /// CAS update: read, apply the mutator, write only if unchanged.
    /// Retries internally up to a small bound, then returns `Conflict`.
    async fn update_atomically(
        &self,
        id: &TaskId,
        mutator: Mutator,
    ) -> Result<UpdateOutcome, TaskError>;

    /// Atomically add `delta` to a named counter
    async fn increment_counter(&self, name: &str, delta: i64) -> Result<(), TaskError>;

    /// Snapshot all counters
    async fn read_counters(&self) -> Result<CounterSnapshot, TaskError>;

    /// Mark a task as asked-to-cancel
    async fn add_revocation(&self, id: &TaskId) -> Result<(), TaskError>;

    /// Check whether a task has been asked to cancel
    async fn is_revoked(&self, id: &TaskId) -> Result<bool, TaskError>;

    /// Drop a task from the revocation set
    async fn clear_revocation(&self, id: &TaskId) -> Result<(), TaskError>;

    /// Publish a terminal event to subscribers (at-least-once)
    async fn publish_terminal(&self, event: &TerminalEvent) -> Result<(), TaskError>;

    /// Subscribe to terminal events; events published after the call are
    /// delivered in publication order
    async fn subscribe_terminal(&self) -> Result<mpsc::Receiver<TerminalEvent>, TaskError>;

    /// All records currently in `Running` (health checks and the reaper)
    async fn list_running(&self) -> Result<Vec<TaskRecord>, TaskError>;

    /// Check the backing service is reachable
    async fn health_check(&self) -> Result<(), TaskError>;
}

pub mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use redis::{RedisStore, RedisStoreConfig};
