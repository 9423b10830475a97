//! Executor seam
//!
//! Task payload logic lives outside the core. The dispatch plane hands an
//! executor its input, a progress sink, and an execution context carrying one
//! cancellation token with two deadlines (cooperative soft, enforced hard).
//! The executor reports back a closed outcome; no exceptions-as-control-flow.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TaskFailure;
use crate::state::TaskState;
use crate::store::{MutationStep, TaskStore};
use crate::task::{TaskId, TaskType};

/// Result of one executor invocation
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Payload work finished; the value is opaque to the core
    Success(serde_json::Value),
    /// Payload work failed; the executor classifies retriability
    Failure(TaskFailure),
    /// The executor observed cancellation and wound down
    Cancelled,
}

/// External payload logic for one task type
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Task type this executor handles
    fn task_type(&self) -> TaskType;

    /// Run the payload. Implementations SHOULD poll `ctx.cancelled()` and
    /// wind down promptly once it fires; the worker hard-kills only after a
    /// grace period.
    async fn run(
        &self,
        input: serde_json::Value,
        progress: ProgressSink,
        ctx: ExecutionContext,
    ) -> ExecutionOutcome;
}

/// Registry of executors keyed by task type
pub struct ExecutorRegistry {
    executors: DashMap<TaskType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: DashMap::new(),
        }
    }

    /// Register an executor for its task type
    pub fn register<E: Executor>(&self, executor: E) {
        let task_type = executor.task_type();
        tracing::debug!(task_type = %task_type, "Registering executor");
        self.executors.insert(task_type, Arc::new(executor));
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&task_type).map(|e| e.clone())
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.executors.contains_key(&task_type)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-task cancellation context: one token, two deadlines
#[derive(Clone)]
pub struct ExecutionContext {
    token: CancellationToken,
    soft_deadline: Instant,
    hard_deadline: Instant,
}

impl ExecutionContext {
    /// Create a context whose deadlines start counting now
    pub fn new(soft_timeout: Duration, hard_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            token: CancellationToken::new(),
            soft_deadline: now + soft_timeout,
            hard_deadline: now + hard_timeout,
        }
    }

    /// Resolves once the task has been asked to stop
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cooperative wind-down deadline
    pub fn soft_deadline(&self) -> Instant {
        self.soft_deadline
    }

    /// Enforced deadline; the worker cancels the token when it passes
    pub fn deadline(&self) -> Instant {
        self.hard_deadline
    }

    /// Resolves when the soft deadline passes (cooperative hint)
    pub async fn soft_deadline_passed(&self) {
        tokio::time::sleep_until(self.soft_deadline).await
    }

    /// Ask the task to stop
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("cancelled", &self.token.is_cancelled())
            .field("soft_deadline", &self.soft_deadline)
            .field("hard_deadline", &self.hard_deadline)
            .finish()
    }
}

/// Advisory progress channel back to the store
///
/// Heartbeats and progress are not part of correctness; write failures are
/// logged and swallowed so a flaky store cannot take down a healthy task.
#[derive(Clone)]
pub struct ProgressSink {
    store: Arc<dyn TaskStore>,
    task_id: TaskId,
}

impl ProgressSink {
    pub fn new(store: Arc<dyn TaskStore>, task_id: TaskId) -> Self {
        Self { store, task_id }
    }

    /// Refresh `last_heartbeat_at` on the record
    pub async fn heartbeat(&self) {
        self.write(None, None).await;
    }

    /// Record completion percentage and an optional step label
    pub async fn set_progress(&self, percent: f64, step: Option<&str>) {
        let clamped = percent.clamp(0.0, 100.0);
        self.write(Some(clamped), step.map(|s| s.to_string())).await;
    }

    async fn write(&self, progress: Option<f64>, step: Option<String>) {
        let result = self
            .store
            .update_atomically(
                &self.task_id,
                Box::new(move |current| {
                    // Progress only applies to a live run
                    if current.state != TaskState::Running {
                        return MutationStep::Abort("not running".to_string());
                    }
                    let mut updated = current.clone();
                    updated.last_heartbeat_at = Some(Utc::now());
                    if let Some(progress) = progress {
                        updated.progress = Some(progress);
                    }
                    if let Some(step) = step.clone() {
                        updated.current_step = Some(step);
                    }
                    MutationStep::Write(Box::new(updated))
                }),
            )
            .await;

        if let Err(e) = result {
            tracing::debug!(task_id = %self.task_id, error = %e, "Progress write dropped");
        }
    }
}
