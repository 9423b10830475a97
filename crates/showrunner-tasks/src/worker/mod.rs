//! Worker runtime
//!
//! A worker pulls entries from its configured queues, consults the
//! authoritative store record, and runs the registered executor under a
//! cancellation context with a cooperative soft deadline and an enforced hard
//! deadline. Leases are renewed while the task runs; a revocation watcher
//! cancels the context when the task is asked to stop. After completing its
//! recycle bound the worker exits cleanly and expects its supervisor to
//! restart it; the same applies when the memory ceiling is hit.

pub mod rss;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Delivery};
use crate::error::TaskFailure;
use crate::executor::{ExecutionContext, ExecutionOutcome, ExecutorRegistry, ProgressSink};
use crate::lifecycle::LifecycleManager;
use crate::state::TaskState;
use crate::store::TaskStore;
use crate::task::TaskRecord;
use crate::TaskError;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker name/ID
    pub name: String,
    /// Queues to consume from
    pub queues: Vec<String>,
    /// Max tasks running at once
    pub concurrency: usize,
    /// Exit cleanly after completing this many tasks (supervisor restarts)
    pub recycle_after: u64,
    /// Stop claiming and exit once process RSS exceeds this
    pub memory_limit_bytes: Option<u64>,
    /// Long-poll wait per reserve call
    pub reserve_wait: Duration,
    /// Lease renewal period; must be well under the broker's lease TTL
    pub lease_renew_interval: Duration,
    /// Revocation set poll period while a task runs
    pub revocation_poll_interval: Duration,
    /// Extra time granted after the hard timeout cancels the context
    pub hard_timeout_grace: Duration,
    /// How long to wait for in-flight tasks when draining
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: format!("worker-{}", uuid::Uuid::new_v4().simple()),
            queues: vec![],
            concurrency: 4,
            recycle_after: 10,
            memory_limit_bytes: Some(2 * 1024 * 1024 * 1024),
            reserve_wait: Duration::from_secs(2),
            lease_renew_interval: Duration::from_secs(15),
            revocation_poll_interval: Duration::from_secs(1),
            hard_timeout_grace: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Why the worker's run loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested and in-flight tasks drained
    Drained,
    /// Recycle bound reached
    Recycled,
    /// Memory ceiling exceeded
    MemoryCeiling,
    /// An executor ignored hard-timeout cancellation past the grace period;
    /// the process is considered corrupted and must be restarted
    Corrupted,
}

/// Long-lived worker process runtime
pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<ExecutorRegistry>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
    completed: AtomicU64,
    corrupted: AtomicBool,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        lifecycle: Arc<LifecycleManager>,
        registry: Arc<ExecutorRegistry>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            config,
            store,
            broker,
            lifecycle,
            registry,
            semaphore,
            shutdown: CancellationToken::new(),
            completed: AtomicU64::new(0),
            corrupted: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Request a graceful shutdown
    pub fn shutdown(&self) {
        tracing::info!(worker_id = %self.config.name, "Shutdown requested");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run until shutdown, the recycle bound, or the memory ceiling
    pub async fn run(self: Arc<Self>) -> Result<WorkerExit, TaskError> {
        tracing::info!(
            worker_id = %self.config.name,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            recycle_after = self.config.recycle_after,
            "Worker starting"
        );

        self.store.health_check().await?;
        self.broker.health_check().await?;

        let exit = loop {
            // Hold a concurrency slot before deciding whether to keep going,
            // so the recycle and memory checks see finished work
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break WorkerExit::Drained,
                },
                _ = self.shutdown.cancelled() => break WorkerExit::Drained,
            };

            if self.corrupted.load(Ordering::SeqCst) {
                break WorkerExit::Corrupted;
            }
            if self.shutdown.is_cancelled() {
                break WorkerExit::Drained;
            }
            if self.completed.load(Ordering::SeqCst) >= self.config.recycle_after {
                tracing::info!(
                    worker_id = %self.config.name,
                    completed = self.completed.load(Ordering::SeqCst),
                    "Recycle bound reached"
                );
                break WorkerExit::Recycled;
            }
            if let (Some(limit), Some(rss)) =
                (self.config.memory_limit_bytes, rss::current_rss_bytes())
            {
                if rss > limit {
                    tracing::warn!(
                        worker_id = %self.config.name,
                        rss_bytes = rss,
                        limit_bytes = limit,
                        "Memory ceiling exceeded, refusing new tasks"
                    );
                    break WorkerExit::MemoryCeiling;
                }
            }

            let delivery = tokio::select! {
                result = self.broker.reserve(
                    &self.config.queues,
                    &self.config.name,
                    self.config.reserve_wait,
                ) => match result {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => {
                        drop(permit);
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(worker_id = %self.config.name, error = %e, "Reserve failed");
                        drop(permit);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = self.shutdown.cancelled() => {
                    drop(permit);
                    break WorkerExit::Drained;
                }
            };

            let record = match self.admit(&delivery).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    drop(permit);
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        worker_id = %self.config.name,
                        task_id = %delivery.entry.task_id,
                        error = %e,
                        "Admission check failed, returning entry"
                    );
                    if let Err(e) = self.broker.nack(&delivery.token, true, None).await {
                        tracing::error!(error = %e, "Nack failed");
                    }
                    drop(permit);
                    continue;
                }
            };

            let worker = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                worker.execute(delivery, record).await;
            });
        };

        self.drain().await;
        if self.corrupted.load(Ordering::SeqCst) {
            tracing::error!(worker_id = %self.config.name, "Worker exiting corrupted");
            return Ok(WorkerExit::Corrupted);
        }
        tracing::info!(worker_id = %self.config.name, exit = ?exit, "Worker stopped");
        Ok(exit)
    }

    /// Gatekeeping before execution: drop stale entries, honor pre-run
    /// revocation, fail abandoned redeliveries, and claim Queued -> Running.
    /// `Ok(None)` means the entry was dealt with and acked.
    async fn admit(&self, delivery: &Delivery) -> Result<Option<TaskRecord>, TaskError> {
        let task_id = &delivery.entry.task_id;

        let record = match self.store.get(task_id).await? {
            Some(record) => record,
            None => {
                tracing::warn!(task_id = %task_id, "Entry without record, dropping");
                self.broker.ack(&delivery.token).await?;
                return Ok(None);
            }
        };

        if record.is_terminal() {
            tracing::debug!(task_id = %task_id, state = %record.state, "Stale entry, dropping");
            self.broker.ack(&delivery.token).await?;
            return Ok(None);
        }

        if self.store.is_revoked(task_id).await? {
            tracing::info!(task_id = %task_id, "Revoked before start, cancelling");
            self.lifecycle
                .mark_cancelled(task_id, TaskState::Queued)
                .await?;
            self.broker.ack(&delivery.token).await?;
            return Ok(None);
        }

        if record.state == TaskState::Running {
            // Redelivery after a worker crash: never execute, only fail the
            // record if its heartbeat is stale (which may schedule a retry)
            let bound = self
                .lifecycle
                .router()
                .policy(record.task_type)
                .staleness_bound();
            let failed = self.lifecycle.fail_abandoned(task_id, bound).await?;
            if failed.is_some() {
                tracing::warn!(task_id = %task_id, "Abandoned running task failed over");
            } else {
                tracing::debug!(task_id = %task_id, "Running record with fresh heartbeat, dropping entry");
            }
            self.broker.ack(&delivery.token).await?;
            return Ok(None);
        }

        match self.lifecycle.begin_running(task_id, &self.config.name).await? {
            Some(record) => Ok(Some(record)),
            None => {
                // Lost the claim (cancelled or another worker won)
                self.broker.ack(&delivery.token).await?;
                Ok(None)
            }
        }
    }

    /// Run one admitted task to an outcome and report it
    async fn execute(self: Arc<Self>, delivery: Delivery, record: TaskRecord) {
        let task_id = record.id.clone();
        let policy = self.lifecycle.router().policy(record.task_type).clone();

        let Some(executor) = self.registry.get(record.task_type) else {
            tracing::error!(
                task_id = %task_id,
                task_type = %record.task_type,
                "No executor registered"
            );
            let failure = TaskFailure::permanent(format!(
                "No executor registered for {}",
                record.task_type
            ));
            if let Err(e) = self.lifecycle.fail(&task_id, failure).await {
                tracing::error!(task_id = %task_id, error = %e, "Failure report failed");
            }
            self.ack_quietly(&delivery).await;
            return;
        };

        let ctx = ExecutionContext::new(policy.soft_timeout, policy.hard_timeout);
        let housekeeping = CancellationToken::new();
        let revoked_flag = Arc::new(AtomicBool::new(false));

        self.spawn_lease_renewal(&delivery, &housekeeping);
        self.spawn_revocation_watcher(&record, &ctx, &revoked_flag, &housekeeping);
        self.spawn_soft_timeout_signal(&record, &ctx, &housekeeping);

        let progress = ProgressSink::new(self.store.clone(), task_id.clone());
        let input = record.input.clone();

        let run = executor.run(input, progress, ctx.clone());
        tokio::pin!(run);

        let mut timed_out = false;
        let outcome = tokio::select! {
            outcome = &mut run => Some(outcome),
            _ = tokio::time::sleep_until(ctx.deadline()) => {
                timed_out = true;
                tracing::warn!(
                    task_id = %task_id,
                    hard_timeout_secs = policy.hard_timeout.as_secs(),
                    "Hard timeout fired, cancelling context"
                );
                ctx.cancel();
                match tokio::time::timeout(self.config.hard_timeout_grace, &mut run).await {
                    Ok(outcome) => Some(outcome),
                    Err(_) => None,
                }
            }
        };
        housekeeping.cancel();

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                // The executor ignored cancellation past the grace period.
                // Record the timeout and drop the stuck future; anything it
                // left behind (threads, child processes) makes this process
                // untrustworthy, so exit and let the supervisor restart it.
                tracing::error!(
                    task_id = %task_id,
                    grace_secs = self.config.hard_timeout_grace.as_secs(),
                    "Executor unresponsive after hard timeout, worker is corrupted"
                );
                let failure = TaskFailure::timeout(format!(
                    "Executor unresponsive {}s after hard timeout",
                    self.config.hard_timeout_grace.as_secs()
                ));
                if let Err(e) = self.lifecycle.fail(&task_id, failure).await {
                    tracing::error!(task_id = %task_id, error = %e, "Failure report failed");
                }
                self.ack_quietly(&delivery).await;
                self.corrupted.store(true, Ordering::SeqCst);
                self.shutdown.cancel();
                return;
            }
        };

        let report = match outcome {
            ExecutionOutcome::Success(result) => {
                self.lifecycle.complete(&task_id, result).await.map(|_| ())
            }
            ExecutionOutcome::Failure(failure) => {
                self.lifecycle.fail(&task_id, failure).await.map(|_| ())
            }
            ExecutionOutcome::Cancelled => {
                // A user revocation beats a concurrent hard timeout
                if revoked_flag.load(Ordering::SeqCst) || !timed_out {
                    self.lifecycle
                        .mark_cancelled(&task_id, TaskState::Running)
                        .await
                        .map(|_| ())
                } else {
                    let failure = TaskFailure::timeout(format!(
                        "Hard timeout after {}s",
                        policy.hard_timeout.as_secs()
                    ));
                    self.lifecycle.fail(&task_id, failure).await.map(|_| ())
                }
            }
        };
        if let Err(e) = report {
            tracing::error!(task_id = %task_id, error = %e, "Outcome report failed");
        }

        self.ack_quietly(&delivery).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn spawn_lease_renewal(&self, delivery: &Delivery, done: &CancellationToken) {
        let broker = self.broker.clone();
        let token = delivery.token.clone();
        let task_id = delivery.entry.task_id.clone();
        let interval = self.config.lease_renew_interval;
        let done = done.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = broker.renew_lease(&token).await {
                            tracing::warn!(task_id = %task_id, error = %e, "Lease renewal failed");
                        }
                    }
                }
            }
        });
    }

    fn spawn_revocation_watcher(
        &self,
        record: &TaskRecord,
        ctx: &ExecutionContext,
        revoked_flag: &Arc<AtomicBool>,
        done: &CancellationToken,
    ) {
        let store = self.store.clone();
        let task_id = record.id.clone();
        let ctx = ctx.clone();
        let revoked_flag = revoked_flag.clone();
        let interval = self.config.revocation_poll_interval;
        let done = done.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.is_revoked(&task_id).await {
                            Ok(true) => {
                                tracing::info!(task_id = %task_id, "Revocation observed, cancelling context");
                                revoked_flag.store(true, Ordering::SeqCst);
                                ctx.cancel();
                                break;
                            }
                            Ok(false) => {}
                            Err(e) => {
                                tracing::warn!(task_id = %task_id, error = %e, "Revocation check failed");
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_soft_timeout_signal(
        &self,
        record: &TaskRecord,
        ctx: &ExecutionContext,
        done: &CancellationToken,
    ) {
        let task_id = record.id.clone();
        let ctx = ctx.clone();
        let done = done.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = ctx.soft_deadline_passed() => {
                    if !ctx.is_cancelled() {
                        tracing::warn!(
                            task_id = %task_id,
                            "Soft timeout passed; executor should wind down"
                        );
                    }
                }
            }
        });
    }

    async fn ack_quietly(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(&delivery.token).await {
            tracing::error!(
                task_id = %delivery.entry.task_id,
                error = %e,
                "Ack failed; entry will be redelivered and dropped as stale"
            );
        }
    }

    /// Wait for in-flight tasks to finish, bounded by the drain timeout
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let all = self.config.concurrency as u32;
        loop {
            if self.semaphore.available_permits() as u32 >= all {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    worker_id = %self.config.name,
                    "Drain timeout; abandoning in-flight tasks to the reaper"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
