//! In-memory broker (thread-safe, non-distributed)
//!
//! Mirrors the Redis broker's semantics for the test suites and
//! single-process development: priority-then-FIFO ordering, delayed entries,
//! and lease expiry with redelivery.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::broker::{Broker, Delivery, LeaseToken};
use crate::entry::QueueEntry;
use crate::task::{Priority, TaskId};
use crate::TaskError;

const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct DelayedEntry {
    ready_at: Instant,
    priority: Priority,
    entry: QueueEntry,
}

#[derive(Debug, Clone)]
struct LeasedEntry {
    queue: String,
    priority: Priority,
    entry: QueueEntry,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    /// Deliverable entries, ordered by (priority weight, arrival sequence)
    ready: BTreeMap<(u8, u64), QueueEntry>,
    delayed: Vec<DelayedEntry>,
}

/// In-memory broker over mutexed queue maps
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    leases: Mutex<HashMap<String, LeasedEntry>>,
    notify: Notify,
    seq: AtomicU64,
    lease_ttl: Duration,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_lease_ttl(Duration::from_secs(60))
    }

    /// Create a broker with a custom lease period (tests use short leases)
    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            lease_ttl,
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Move due delayed entries and expired leases back to the ready maps
    async fn promote(&self) {
        let now = Instant::now();

        {
            let mut queues = self.queues.lock().await;
            for state in queues.values_mut() {
                let mut still_delayed = Vec::with_capacity(state.delayed.len());
                for delayed in state.delayed.drain(..) {
                    if delayed.ready_at <= now {
                        let key = (delayed.priority.weight(), self.next_seq());
                        state.ready.insert(key, delayed.entry);
                    } else {
                        still_delayed.push(delayed);
                    }
                }
                state.delayed = still_delayed;
            }
        }

        let expired: Vec<(String, LeasedEntry)> = {
            let mut leases = self.leases.lock().await;
            let expired_tokens: Vec<String> = leases
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(token, _)| token.clone())
                .collect();
            expired_tokens
                .into_iter()
                .filter_map(|token| leases.remove(&token).map(|lease| (token, lease)))
                .collect()
        };

        if !expired.is_empty() {
            let mut queues = self.queues.lock().await;
            for (token, lease) in expired {
                tracing::warn!(
                    task_id = %lease.entry.task_id,
                    queue = %lease.queue,
                    token = %token,
                    "Lease expired, entry redelivered"
                );
                let state = queues.entry(lease.queue).or_default();
                let key = (lease.priority.weight(), self.next_seq());
                state.ready.insert(key, lease.entry);
            }
            self.notify.notify_waiters();
        }
    }

    /// Pop one ready entry across the queues, rotating the start index so no
    /// queue is starved
    async fn try_pop(&self, queues: &[String]) -> Option<(String, Priority, QueueEntry)> {
        let mut map = self.queues.lock().await;
        let start = (self.seq.load(Ordering::SeqCst) as usize) % queues.len().max(1);

        for offset in 0..queues.len() {
            let queue = &queues[(start + offset) % queues.len()];
            if let Some(state) = map.get_mut(queue) {
                let next_key = state.ready.keys().next().copied();
                if let Some(key) = next_key {
                    if let Some(entry) = state.ready.remove(&key) {
                        let priority = match key.0 {
                            1 => Priority::High,
                            3 => Priority::Low,
                            _ => Priority::Normal,
                        };
                        return Some((queue.clone(), priority, entry));
                    }
                }
            }
        }
        None
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(
        &self,
        queue: &str,
        entry: QueueEntry,
        priority: Priority,
    ) -> Result<(), TaskError> {
        let key = (priority.weight(), self.next_seq());
        {
            let mut queues = self.queues.lock().await;
            queues.entry(queue.to_string()).or_default().ready.insert(key, entry);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn enqueue_delayed(
        &self,
        queue: &str,
        entry: QueueEntry,
        priority: Priority,
        delay: Duration,
    ) -> Result<(), TaskError> {
        if delay.is_zero() {
            return self.enqueue(queue, entry, priority).await;
        }
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().delayed.push(DelayedEntry {
            ready_at: Instant::now() + delay,
            priority,
            entry,
        });
        Ok(())
    }

    async fn reserve(
        &self,
        queues: &[String],
        _worker_id: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, TaskError> {
        let deadline = Instant::now() + wait;

        loop {
            self.promote().await;

            if let Some((queue, priority, entry)) = self.try_pop(queues).await {
                let token = LeaseToken(format!("{}:{}", queue, uuid::Uuid::new_v4().simple()));
                self.leases.lock().await.insert(
                    token.0.clone(),
                    LeasedEntry {
                        queue: queue.clone(),
                        priority,
                        entry: entry.clone(),
                        deadline: Instant::now() + self.lease_ttl,
                    },
                );
                return Ok(Some(Delivery {
                    queue,
                    entry,
                    token,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let sleep_for = IDLE_POLL.min(deadline - now);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn ack(&self, token: &LeaseToken) -> Result<(), TaskError> {
        self.leases.lock().await.remove(&token.0);
        Ok(())
    }

    async fn nack(
        &self,
        token: &LeaseToken,
        requeue: bool,
        delay: Option<Duration>,
    ) -> Result<(), TaskError> {
        let lease = self.leases.lock().await.remove(&token.0);
        let Some(lease) = lease else {
            return Ok(());
        };

        if requeue {
            match delay {
                Some(delay) if !delay.is_zero() => {
                    self.enqueue_delayed(&lease.queue, lease.entry, lease.priority, delay)
                        .await?;
                }
                _ => {
                    self.enqueue(&lease.queue, lease.entry, lease.priority).await?;
                }
            }
        }
        Ok(())
    }

    async fn renew_lease(&self, token: &LeaseToken) -> Result<(), TaskError> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&token.0) {
            Some(lease) => {
                lease.deadline = Instant::now() + self.lease_ttl;
                Ok(())
            }
            None => Err(TaskError::Broker(format!(
                "Lease {} not found (expired or acked)",
                token
            ))),
        }
    }

    async fn purge(&self, queue: &str, task_id: &TaskId) -> Result<bool, TaskError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };

        let ready_key = state
            .ready
            .iter()
            .find(|(_, entry)| &entry.task_id == task_id)
            .map(|(&key, _)| key);
        if let Some(key) = ready_key {
            state.ready.remove(&key);
            return Ok(true);
        }

        let before = state.delayed.len();
        state.delayed.retain(|d| &d.entry.task_id != task_id);
        Ok(state.delayed.len() < before)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, TaskError> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|state| state.ready.len() as u64)
            .unwrap_or(0))
    }

    async fn health_check(&self) -> Result<(), TaskError> {
        Ok(())
    }
}
