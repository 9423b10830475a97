//! Stale-task reaper
//!
//! Periodic pass over Running records. Anything whose last activity is older
//! than its staleness bound (2x the task type's hard timeout) is failed as
//! abandoned, which re-queues it while retry budget remains. The staleness
//! check repeats inside the lifecycle CAS, so a racing revival or a second
//! reaper is a harmless no-op.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::LifecycleManager;
use crate::store::TaskStore;
use crate::TaskError;

/// Reaper configuration
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between passes
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Background pass that fails abandoned Running records
pub struct Reaper {
    config: ReaperConfig,
    store: Arc<dyn TaskStore>,
    lifecycle: Arc<LifecycleManager>,
    shutdown: CancellationToken,
}

impl Reaper {
    pub fn new(
        config: ReaperConfig,
        store: Arc<dyn TaskStore>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            config,
            store,
            lifecycle,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run passes until shutdown
    pub async fn run(&self) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "Reaper started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.pass().await {
                        tracing::error!(error = %e, "Reaper pass failed");
                    }
                }
            }
        }
    }

    /// Spawn the reaper onto the runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// One pass: fail every Running record with stale activity
    pub async fn pass(&self) -> Result<usize, TaskError> {
        let running = self.store.list_running().await?;
        let mut reaped = 0;

        for record in running {
            let bound = self
                .lifecycle
                .router()
                .policy(record.task_type)
                .staleness_bound();

            match self.lifecycle.fail_abandoned(&record.id, bound).await {
                Ok(Some(_)) => {
                    tracing::warn!(
                        task_id = %record.id,
                        worker_id = %record.worker_id.as_deref().unwrap_or(""),
                        "Reaped abandoned task"
                    );
                    reaped += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(task_id = %record.id, error = %e, "Reap attempt failed");
                }
            }
        }

        if reaped > 0 {
            tracing::info!(reaped, "Reaper pass finished");
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::routing::TaskRouter;
    use crate::state::TaskState;
    use crate::store::MemoryStore;
    use crate::task::{Priority, TaskRecord, TaskType};

    fn setup() -> (Arc<MemoryStore>, Arc<LifecycleManager>) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            broker,
            Arc::new(TaskRouter::builtin()),
        ));
        (store, lifecycle)
    }

    #[tokio::test]
    async fn test_pass_ignores_fresh_tasks() {
        let (store, lifecycle) = setup();
        let record = TaskRecord::new(
            "P1",
            TaskType::EvaluateDepartment,
            serde_json::json!({}),
            Priority::Normal,
            Duration::from_secs(86_400),
        );
        let id = record.id.clone();
        lifecycle.submit(record).await.unwrap();
        lifecycle.begin_running(&id, "w1").await.unwrap().unwrap();

        let reaper = Reaper::new(ReaperConfig::default(), store.clone(), lifecycle);
        assert_eq!(reaper.pass().await.unwrap(), 0);
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().state,
            TaskState::Running
        );
    }

    #[tokio::test]
    async fn test_pass_reaps_stale_running_task() {
        let (store, lifecycle) = setup();
        let record = TaskRecord::new(
            "P1",
            TaskType::EvaluateDepartment,
            serde_json::json!({}),
            Priority::Normal,
            Duration::from_secs(86_400),
        );
        let id = record.id.clone();
        lifecycle.submit(record).await.unwrap();
        lifecycle.begin_running(&id, "w1").await.unwrap().unwrap();

        // Backdate the heartbeat past the staleness bound
        store
            .update_atomically(
                &id,
                Box::new(|current| {
                    let mut updated = current.clone();
                    let stale = chrono::Utc::now() - chrono::Duration::seconds(1_300);
                    updated.started_at = Some(stale);
                    updated.last_heartbeat_at = Some(stale);
                    crate::store::MutationStep::Write(Box::new(updated))
                }),
            )
            .await
            .unwrap();

        let reaper = Reaper::new(ReaperConfig::default(), store.clone(), lifecycle);
        assert_eq!(reaper.pass().await.unwrap(), 1);

        // Abandoned is retriable: first reap re-queues with attempt 1
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Queued);
        assert_eq!(record.attempt, 1);
    }
}
