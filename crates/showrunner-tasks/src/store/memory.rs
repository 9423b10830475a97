//! In-memory task store (thread-safe, non-distributed)
//!
//! Used by the test suites and for single-process development. Semantics
//! mirror the Redis store: version-checked CAS, lazy TTL eviction of terminal
//! records, and an in-process terminal event channel.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::metrics::{counters, CounterSnapshot};
use crate::state::TaskState;
use crate::store::{
    MutationStep, Mutator, Page, PageRequest, TaskFilter, TaskStore, TerminalEvent, UpdateOutcome,
    CAS_MAX_ATTEMPTS,
};
use crate::task::{TaskId, TaskRecord, TaskType};
use crate::TaskError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory store over concurrent maps
pub struct MemoryStore {
    records: DashMap<TaskId, TaskRecord>,
    counters: DashMap<String, Arc<AtomicI64>>,
    revoked: DashMap<TaskId, ()>,
    events_tx: broadcast::Sender<TerminalEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: DashMap::new(),
            counters: DashMap::new(),
            revoked: DashMap::new(),
            events_tx,
        }
    }

    fn counter(&self, name: &str) -> Arc<AtomicI64> {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    fn counter_value(&self, name: &str) -> i64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Drop the record if its TTL has passed; terminal records only
    fn evict_if_expired(&self, id: &TaskId) {
        let now = Utc::now();
        let expired = self
            .records
            .get(id)
            .map(|r| r.is_expired(now))
            .unwrap_or(false);
        if expired {
            self.records.remove(id);
            tracing::debug!(task_id = %id, "Evicted expired terminal record");
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), TaskError> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(TaskError::AlreadyExists(record.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, TaskError> {
        self.evict_if_expired(id);
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn list_by_project(
        &self,
        project_id: &str,
        filter: &TaskFilter,
        page: &PageRequest,
    ) -> Result<Page<TaskRecord>, TaskError> {
        let now = Utc::now();
        let mut matching: Vec<TaskRecord> = self
            .records
            .iter()
            .filter(|r| r.project_id == project_id && !r.is_expired(now))
            .filter(|r| filter.matches(r))
            .map(|r| r.clone())
            .collect();

        // Newest first
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset())
            .take(page.limit as usize)
            .collect();

        Ok(Page {
            items,
            page: page.page,
            limit: page.limit,
            total,
        })
    }

    async fn update_atomically(
        &self,
        id: &TaskId,
        mutator: Mutator,
    ) -> Result<UpdateOutcome, TaskError> {
        use dashmap::mapref::entry::Entry;

        for _ in 0..CAS_MAX_ATTEMPTS {
            self.evict_if_expired(id);

            let current = match self.records.get(id) {
                Some(r) => r.clone(),
                None => return Err(TaskError::NotFound(id.to_string())),
            };

            match mutator(&current) {
                MutationStep::Abort(reason) => {
                    return Ok(UpdateOutcome::Aborted {
                        reason,
                        record: current,
                    });
                }
                MutationStep::Write(mut updated) => {
                    updated.version = current.version + 1;

                    // The entry guard locks the shard, making the version
                    // check-and-swap atomic.
                    match self.records.entry(id.clone()) {
                        Entry::Occupied(mut slot) => {
                            if slot.get().version == current.version {
                                slot.insert((*updated).clone());
                                return Ok(UpdateOutcome::Updated(*updated));
                            }
                            // Lost the race; retry with a fresh read
                        }
                        Entry::Vacant(_) => {
                            return Err(TaskError::NotFound(id.to_string()));
                        }
                    }
                }
            }
        }

        Err(TaskError::Conflict(format!(
            "CAS retries exhausted for task {}",
            id
        )))
    }

    async fn increment_counter(&self, name: &str, delta: i64) -> Result<(), TaskError> {
        self.counter(name).fetch_add(delta, Ordering::SeqCst);
        Ok(())
    }

    async fn read_counters(&self) -> Result<CounterSnapshot, TaskError> {
        let mut submitted_by_type = std::collections::HashMap::new();
        for task_type in TaskType::ALL {
            let value = self.counter_value(&counters::submitted_for(task_type));
            if value > 0 {
                submitted_by_type.insert(task_type.to_string(), value.max(0) as u64);
            }
        }

        Ok(CounterSnapshot {
            total_submitted: self.counter_value(counters::TOTAL_SUBMITTED).max(0) as u64,
            completed: self.counter_value(counters::COMPLETED).max(0) as u64,
            failed: self.counter_value(counters::FAILED).max(0) as u64,
            retried: self.counter_value(counters::RETRIED).max(0) as u64,
            cancelled: self.counter_value(counters::CANCELLED).max(0) as u64,
            currently_running: self.counter_value(counters::CURRENTLY_RUNNING),
            submitted_by_type,
        })
    }

    async fn add_revocation(&self, id: &TaskId) -> Result<(), TaskError> {
        self.revoked.insert(id.clone(), ());
        tracing::info!(task_id = %id, "Task added to revocation set");
        Ok(())
    }

    async fn is_revoked(&self, id: &TaskId) -> Result<bool, TaskError> {
        Ok(self.revoked.contains_key(id))
    }

    async fn clear_revocation(&self, id: &TaskId) -> Result<(), TaskError> {
        self.revoked.remove(id);
        Ok(())
    }

    async fn publish_terminal(&self, event: &TerminalEvent) -> Result<(), TaskError> {
        // No subscribers is fine; the record already reflects the state
        let _ = self.events_tx.send(event.clone());
        Ok(())
    }

    async fn subscribe_terminal(&self) -> Result<mpsc::Receiver<TerminalEvent>, TaskError> {
        let mut broadcast_rx = self.events_tx.subscribe();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Terminal event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    async fn list_running(&self) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.state == TaskState::Running)
            .map(|r| r.clone())
            .collect())
    }

    async fn health_check(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MutationStep;
    use std::time::Duration;

    fn sample_record() -> TaskRecord {
        TaskRecord::new(
            "P1",
            TaskType::EvaluateDepartment,
            serde_json::json!({"department": "story"}),
            crate::task::Priority::High,
            Duration::from_secs(86_400),
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryStore::new();
        let record = sample_record();

        store.create(&record).await.unwrap();
        let fetched = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, record.id);

        // Duplicate id is rejected
        assert!(matches!(
            store.create(&record).await,
            Err(TaskError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryStore::new();
        assert!(store.get(&TaskId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_atomically() {
        let store = MemoryStore::new();
        let record = sample_record();
        store.create(&record).await.unwrap();

        let outcome = store
            .update_atomically(
                &record.id,
                Box::new(|current| {
                    let mut updated = current.clone();
                    updated.state = TaskState::Running;
                    updated.started_at = Some(Utc::now());
                    MutationStep::Write(Box::new(updated))
                }),
            )
            .await
            .unwrap();

        assert!(outcome.is_updated());
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Running);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_update_abort_leaves_record_untouched() {
        let store = MemoryStore::new();
        let record = sample_record();
        store.create(&record).await.unwrap();

        let outcome = store
            .update_atomically(
                &record.id,
                Box::new(|_| MutationStep::Abort("not applicable".to_string())),
            )
            .await
            .unwrap();

        match outcome {
            UpdateOutcome::Aborted { reason, record } => {
                assert_eq!(reason, "not applicable");
                assert_eq!(record.state, TaskState::Queued);
                assert_eq!(record.version, 0);
            }
            _ => panic!("expected abort"),
        }
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = MemoryStore::new();
        let result = store
            .update_atomically(
                &TaskId::new(),
                Box::new(|current| MutationStep::Write(Box::new(current.clone()))),
            )
            .await;
        assert!(matches!(result, Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_cas_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let record = sample_record();
        store.create(&record).await.unwrap();

        // Both try Queued -> Running; exactly one mutation may win
        let mut handles = Vec::new();
        for worker in ["w1", "w2"] {
            let store = store.clone();
            let id = record.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_atomically(
                        &id,
                        Box::new(move |current| {
                            if current.state != TaskState::Queued {
                                return MutationStep::Abort("not queued".to_string());
                            }
                            let mut updated = current.clone();
                            updated.state = TaskState::Running;
                            updated.worker_id = Some(worker.to_string());
                            MutationStep::Write(Box::new(updated))
                        }),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_updated() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_list_by_project_filters_and_pagination() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let mut record = sample_record();
            record.created_at = record.created_at + chrono::Duration::seconds(i);
            if i >= 3 {
                record.state = TaskState::Completed;
            }
            store.create(&record).await.unwrap();
        }

        let all = store
            .list_by_project("P1", &TaskFilter::default(), &PageRequest { page: 1, limit: 10 })
            .await
            .unwrap();
        assert_eq!(all.total, 5);
        // Newest first
        assert!(all.items[0].created_at >= all.items[4].created_at);

        let completed_only = store
            .list_by_project(
                "P1",
                &TaskFilter {
                    state: Some(TaskState::Completed),
                    task_type: None,
                },
                &PageRequest { page: 1, limit: 10 },
            )
            .await
            .unwrap();
        assert_eq!(completed_only.total, 2);

        let page2 = store
            .list_by_project("P1", &TaskFilter::default(), &PageRequest { page: 2, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page2.items.len(), 2);
        assert_eq!(page2.total, 5);
    }

    #[tokio::test]
    async fn test_terminal_record_evicted_after_ttl() {
        let store = MemoryStore::new();
        let mut record = TaskRecord::new(
            "P1",
            TaskType::GenerateImage,
            serde_json::json!({}),
            crate::task::Priority::Normal,
            Duration::from_secs(0),
        );
        record.state = TaskState::Completed;
        store.create(&record).await.unwrap();

        assert!(store.get(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_record_never_evicted() {
        let store = MemoryStore::new();
        let record = TaskRecord::new(
            "P1",
            TaskType::GenerateImage,
            serde_json::json!({}),
            crate::task::Priority::Normal,
            Duration::from_secs(0),
        );
        store.create(&record).await.unwrap();

        // TTL already passed, but the record is Queued
        assert!(store.get(&record.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_counters() {
        let store = MemoryStore::new();
        store.increment_counter(counters::TOTAL_SUBMITTED, 1).await.unwrap();
        store.increment_counter(counters::CURRENTLY_RUNNING, 1).await.unwrap();
        store.increment_counter(counters::CURRENTLY_RUNNING, -1).await.unwrap();
        store.increment_counter(counters::COMPLETED, 1).await.unwrap();

        let snapshot = store.read_counters().await.unwrap();
        assert_eq!(snapshot.total_submitted, 1);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.currently_running, 0);
    }

    #[tokio::test]
    async fn test_revocation_set() {
        let store = MemoryStore::new();
        let id = TaskId::new();

        assert!(!store.is_revoked(&id).await.unwrap());
        store.add_revocation(&id).await.unwrap();
        assert!(store.is_revoked(&id).await.unwrap());
        store.clear_revocation(&id).await.unwrap();
        assert!(!store.is_revoked(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_event_pubsub() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe_terminal().await.unwrap();

        let mut record = sample_record();
        record.state = TaskState::Completed;
        let event = TerminalEvent::from_record(&record);
        store.publish_terminal(&event).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.task_id, record.id);
        assert_eq!(received.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_list_running() {
        let store = MemoryStore::new();
        let mut running = sample_record();
        running.state = TaskState::Running;
        store.create(&running).await.unwrap();
        store.create(&sample_record()).await.unwrap();

        let listed = store.list_running().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, running.id);
    }
}
