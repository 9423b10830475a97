//! End-to-end worker lifecycle tests over the in-memory store and broker

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use showrunner_tasks::{
    Broker, CancelOutcome, ExecutionContext, ExecutionOutcome, Executor, ExecutionPolicy,
    ExecutorRegistry, FailureKind, LifecycleManager, MemoryBroker, MemoryStore, Priority,
    ProgressSink, TaskFailure, TaskId, TaskRecord, TaskRouter, TaskState, TaskStore, TaskType,
    Worker, WorkerConfig, WorkerExit,
};

const TTL: Duration = Duration::from_secs(86_400);

/// Routing table with test-sized timeouts and retry delays
fn fast_router() -> TaskRouter {
    TaskRouter::builtin().with_policy(
        TaskType::EvaluateDepartment,
        ExecutionPolicy {
            queue: "cpu_intensive".to_string(),
            hard_timeout: Duration::from_secs(5),
            soft_timeout: Duration::from_secs(4),
            max_retries: 3,
            retry_initial_delay: Duration::from_millis(50),
            default_priority: Priority::High,
            estimated_duration: Duration::from_millis(100),
        },
    )
}

struct Harness {
    store: Arc<MemoryStore>,
    broker: Arc<MemoryBroker>,
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<ExecutorRegistry>,
}

impl Harness {
    fn new(router: TaskRouter) -> Self {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            broker.clone(),
            Arc::new(router),
        ));
        Self {
            store,
            broker,
            lifecycle,
            registry: Arc::new(ExecutorRegistry::new()),
        }
    }

    fn worker(&self, config: WorkerConfig) -> Arc<Worker> {
        Arc::new(Worker::new(
            config,
            self.store.clone(),
            self.broker.clone(),
            self.lifecycle.clone(),
            self.registry.clone(),
        ))
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            queues: vec!["cpu_intensive".to_string()],
            reserve_wait: Duration::from_millis(100),
            revocation_poll_interval: Duration::from_millis(50),
            lease_renew_interval: Duration::from_millis(200),
            hard_timeout_grace: Duration::from_millis(300),
            drain_timeout: Duration::from_secs(5),
            ..WorkerConfig::default()
        }
    }

    async fn submit(&self) -> TaskId {
        let record = TaskRecord::new(
            "P1",
            TaskType::EvaluateDepartment,
            serde_json::json!({"department": "story", "threshold": 80}),
            Priority::High,
            TTL,
        );
        let id = record.id.clone();
        self.lifecycle.submit(record).await.unwrap();
        id
    }

    async fn wait_for_state(&self, id: &TaskId, state: TaskState, timeout: Duration) -> TaskRecord {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.store.get(id).await.unwrap() {
                if record.state == state {
                    return record;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let current = self.store.get(id).await.unwrap();
                panic!(
                    "task {} never reached {:?}; currently {:?}",
                    id,
                    state,
                    current.map(|r| r.state)
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Succeeds immediately, counting invocations
struct CountingExecutor {
    invocations: Arc<AtomicU32>,
}

#[async_trait]
impl Executor for CountingExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::EvaluateDepartment
    }

    async fn run(
        &self,
        _input: serde_json::Value,
        progress: ProgressSink,
        _ctx: ExecutionContext,
    ) -> ExecutionOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        progress.set_progress(50.0, Some("evaluating")).await;
        ExecutionOutcome::Success(serde_json::json!({"rating": 89, "result": "pass"}))
    }
}

/// Fails transiently until `succeed_after` invocations, then succeeds
struct FlakyExecutor {
    invocations: Arc<AtomicU32>,
    succeed_after: u32,
}

#[async_trait]
impl Executor for FlakyExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::EvaluateDepartment
    }

    async fn run(
        &self,
        _input: serde_json::Value,
        _progress: ProgressSink,
        _ctx: ExecutionContext,
    ) -> ExecutionOutcome {
        let attempt = self.invocations.fetch_add(1, Ordering::SeqCst);
        if attempt < self.succeed_after {
            ExecutionOutcome::Failure(TaskFailure::transient("downstream 502"))
        } else {
            ExecutionOutcome::Success(serde_json::json!({"ok": true}))
        }
    }
}

/// Waits for cancellation and winds down cooperatively
struct CooperativeExecutor;

#[async_trait]
impl Executor for CooperativeExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::EvaluateDepartment
    }

    async fn run(
        &self,
        _input: serde_json::Value,
        progress: ProgressSink,
        ctx: ExecutionContext,
    ) -> ExecutionOutcome {
        progress.heartbeat().await;
        ctx.cancelled().await;
        ExecutionOutcome::Cancelled
    }
}

/// Ignores cancellation entirely
struct StubbornExecutor;

#[async_trait]
impl Executor for StubbornExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::EvaluateDepartment
    }

    async fn run(
        &self,
        _input: serde_json::Value,
        _progress: ProgressSink,
        _ctx: ExecutionContext,
    ) -> ExecutionOutcome {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        ExecutionOutcome::Success(serde_json::json!(null))
    }
}

#[tokio::test]
async fn happy_path_completes_with_counters_and_result() {
    let harness = Harness::new(fast_router());
    let invocations = Arc::new(AtomicU32::new(0));
    harness.registry.register(CountingExecutor {
        invocations: invocations.clone(),
    });

    let worker = harness.worker(harness.worker_config());
    let handle = tokio::spawn(worker.clone().run());

    let id = harness.submit().await;
    let record = harness
        .wait_for_state(&id, TaskState::Completed, Duration::from_secs(5))
        .await;

    assert_eq!(record.result, Some(serde_json::json!({"rating": 89, "result": "pass"})));
    assert!(record.finished_at.is_some());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let counters = harness.store.read_counters().await.unwrap();
    assert_eq!(counters.total_submitted, 1);
    assert_eq!(counters.completed, 1);
    assert_eq!(counters.currently_running, 0);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let harness = Harness::new(fast_router());
    let invocations = Arc::new(AtomicU32::new(0));
    harness.registry.register(FlakyExecutor {
        invocations: invocations.clone(),
        succeed_after: 1,
    });

    let worker = harness.worker(harness.worker_config());
    let handle = tokio::spawn(worker.clone().run());

    let id = harness.submit().await;
    let record = harness
        .wait_for_state(&id, TaskState::Completed, Duration::from_secs(5))
        .await;

    assert_eq!(record.attempt, 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    let counters = harness.store.read_counters().await.unwrap();
    assert_eq!(counters.retried, 1);
    assert_eq!(counters.completed, 1);
    assert_eq!(counters.failed, 0);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn exhausted_retries_fail_terminally() {
    let harness = Harness::new(fast_router());
    let invocations = Arc::new(AtomicU32::new(0));
    harness.registry.register(FlakyExecutor {
        invocations: invocations.clone(),
        succeed_after: u32::MAX,
    });

    let worker = harness.worker(harness.worker_config());
    let handle = tokio::spawn(worker.clone().run());

    let id = harness.submit().await;
    let record = harness
        .wait_for_state(&id, TaskState::Failed, Duration::from_secs(10))
        .await;

    // max_retries = 3: four attempts total
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(record.error.as_ref().unwrap().kind, FailureKind::ExecutorTransient);

    let counters = harness.store.read_counters().await.unwrap();
    assert_eq!(counters.retried, 3);
    assert_eq!(counters.failed, 1);
    assert_eq!(counters.completed, 0);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_queued_never_invokes_executor() {
    let harness = Harness::new(fast_router());
    let invocations = Arc::new(AtomicU32::new(0));
    harness.registry.register(CountingExecutor {
        invocations: invocations.clone(),
    });

    // Cancel before any worker exists
    let id = harness.submit().await;
    match harness.lifecycle.cancel(&id).await.unwrap() {
        CancelOutcome::Cancelled { previous_state, .. } => {
            assert_eq!(previous_state, TaskState::Queued);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    // A worker started afterwards must not run it
    let worker = harness.worker(harness.worker_config());
    let handle = tokio::spawn(worker.clone().run());
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    let record = harness.store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Cancelled);
    assert_eq!(harness.store.read_counters().await.unwrap().cancelled, 1);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_running_cancels_context_within_poll_bound() {
    let harness = Harness::new(fast_router());
    harness.registry.register(CooperativeExecutor);

    let worker = harness.worker(harness.worker_config());
    let handle = tokio::spawn(worker.clone().run());

    let id = harness.submit().await;
    harness
        .wait_for_state(&id, TaskState::Running, Duration::from_secs(5))
        .await;

    match harness.lifecycle.cancel(&id).await.unwrap() {
        CancelOutcome::Cancelling { .. } => {}
        other => panic!("unexpected outcome: {:?}", other),
    }

    // Revocation watcher polls every 50ms; the transition lands well inside
    // two poll intervals plus scheduling slack
    let record = harness
        .wait_for_state(&id, TaskState::Cancelled, Duration::from_millis(500))
        .await;
    assert!(record.finished_at.is_some());
    assert!(!harness.store.is_revoked(&id).await.unwrap());
    assert_eq!(harness.store.read_counters().await.unwrap().cancelled, 1);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn stubborn_executor_hard_kills_and_corrupts_worker() {
    // No retries so the timeout is terminal
    let router = TaskRouter::builtin().with_policy(
        TaskType::EvaluateDepartment,
        ExecutionPolicy {
            queue: "cpu_intensive".to_string(),
            hard_timeout: Duration::from_millis(300),
            soft_timeout: Duration::from_millis(200),
            max_retries: 0,
            retry_initial_delay: Duration::from_millis(50),
            default_priority: Priority::High,
            estimated_duration: Duration::from_millis(100),
        },
    );
    let harness = Harness::new(router);
    harness.registry.register(StubbornExecutor);

    let worker = harness.worker(harness.worker_config());
    let handle = tokio::spawn(worker.clone().run());

    let id = harness.submit().await;
    let record = harness
        .wait_for_state(&id, TaskState::Failed, Duration::from_secs(5))
        .await;
    assert_eq!(record.error.as_ref().unwrap().kind, FailureKind::Timeout);

    // The worker treats itself as corrupted and exits for its supervisor
    let exit = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(exit, WorkerExit::Corrupted);
}

#[tokio::test]
async fn cooperative_timeout_fails_with_timeout_kind() {
    // The executor honors cancellation, so the hard timeout resolves inside
    // the grace period and the worker stays healthy
    let router = TaskRouter::builtin().with_policy(
        TaskType::EvaluateDepartment,
        ExecutionPolicy {
            queue: "cpu_intensive".to_string(),
            hard_timeout: Duration::from_millis(300),
            soft_timeout: Duration::from_millis(200),
            max_retries: 0,
            retry_initial_delay: Duration::from_millis(50),
            default_priority: Priority::High,
            estimated_duration: Duration::from_millis(100),
        },
    );
    let harness = Harness::new(router);
    harness.registry.register(CooperativeExecutor);

    let worker = harness.worker(harness.worker_config());
    let handle = tokio::spawn(worker.clone().run());

    let id = harness.submit().await;
    let record = harness
        .wait_for_state(&id, TaskState::Failed, Duration::from_secs(5))
        .await;
    assert_eq!(record.error.as_ref().unwrap().kind, FailureKind::Timeout);

    let counters = harness.store.read_counters().await.unwrap();
    assert_eq!(counters.failed, 1);
    assert_eq!(counters.currently_running, 0);

    worker.shutdown();
    let exit = handle.await.unwrap().unwrap();
    assert_eq!(exit, WorkerExit::Drained);
}

#[tokio::test]
async fn worker_recycles_after_completion_bound() {
    let harness = Harness::new(fast_router());
    let invocations = Arc::new(AtomicU32::new(0));
    harness.registry.register(CountingExecutor {
        invocations: invocations.clone(),
    });

    let config = WorkerConfig {
        recycle_after: 2,
        concurrency: 1,
        ..harness.worker_config()
    };
    let worker = harness.worker(config);

    let first = harness.submit().await;
    let second = harness.submit().await;
    let third = harness.submit().await;

    let exit = worker.run().await.unwrap();
    assert_eq!(exit, WorkerExit::Recycled);

    harness
        .wait_for_state(&first, TaskState::Completed, Duration::from_secs(1))
        .await;
    harness
        .wait_for_state(&second, TaskState::Completed, Duration::from_secs(1))
        .await;

    // The third task waits for the replacement worker
    let third_record = harness.store.get(&third).await.unwrap().unwrap();
    assert_eq!(third_record.state, TaskState::Queued);
}

#[tokio::test]
async fn stale_entry_for_terminal_record_is_dropped() {
    let harness = Harness::new(fast_router());
    let invocations = Arc::new(AtomicU32::new(0));
    harness.registry.register(CountingExecutor {
        invocations: invocations.clone(),
    });

    // Terminal record with a leftover queue entry
    let id = harness.submit().await;
    harness.lifecycle.cancel(&id).await.unwrap();
    harness
        .broker
        .enqueue(
            "cpu_intensive",
            showrunner_tasks::QueueEntry::new(id.clone()),
            Priority::High,
        )
        .await
        .unwrap();

    let worker = harness.worker(harness.worker_config());
    let handle = tokio::spawn(worker.clone().run());
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(harness.broker.queue_depth("cpu_intensive").await.unwrap(), 0);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn redelivered_running_entry_fails_over_without_executing() {
    let harness = Harness::new(fast_router());
    let invocations = Arc::new(AtomicU32::new(0));
    harness.registry.register(CountingExecutor {
        invocations: invocations.clone(),
    });

    // Simulate a crashed worker: Running record with a stale heartbeat plus a
    // redelivered entry
    let id = harness.submit().await;
    harness.lifecycle.begin_running(&id, "dead-worker").await.unwrap().unwrap();
    harness
        .store
        .update_atomically(
            &id,
            Box::new(|current| {
                let mut updated = current.clone();
                let stale = chrono::Utc::now() - chrono::Duration::seconds(5_000);
                updated.started_at = Some(stale);
                updated.last_heartbeat_at = Some(stale);
                showrunner_tasks::MutationStep::Write(Box::new(updated))
            }),
        )
        .await
        .unwrap();
    harness
        .broker
        .enqueue(
            "cpu_intensive",
            showrunner_tasks::QueueEntry::new(id.clone()),
            Priority::High,
        )
        .await
        .unwrap();

    let worker = harness.worker(harness.worker_config());
    let handle = tokio::spawn(worker.clone().run());

    // The failover re-queues (abandoned is retriable) and the same worker
    // then picks up the fresh entry and completes attempt 1
    let record = harness
        .wait_for_state(&id, TaskState::Completed, Duration::from_secs(5))
        .await;
    assert_eq!(record.attempt, 1);
    assert_eq!(harness.store.read_counters().await.unwrap().retried, 1);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}
