//! Typed work queues with at-least-once delivery
//!
//! The broker hands out leases: a reserved entry is invisible to other
//! workers until it is acked, nacked, or its lease expires. Workers renew the
//! lease while the task runs; if a worker dies, the entry becomes deliverable
//! again and the next worker consults the authoritative store record.

use async_trait::async_trait;
use std::time::Duration;

use crate::entry::QueueEntry;
use crate::task::{Priority, TaskId};
use crate::TaskError;

/// Opaque handle for acknowledging a reserved entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(pub String);

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reserved queue entry plus its lease
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub entry: QueueEntry,
    pub token: LeaseToken,
}

/// Message broker seam
///
/// Ordering: FIFO within a queue among entries of equal priority; higher
/// priority may overtake. No ordering across queues.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Durably enqueue an entry (at-least-once until acked)
    async fn enqueue(
        &self,
        queue: &str,
        entry: QueueEntry,
        priority: Priority,
    ) -> Result<(), TaskError>;

    /// Enqueue an entry that becomes deliverable after `delay`
    async fn enqueue_delayed(
        &self,
        queue: &str,
        entry: QueueEntry,
        priority: Priority,
        delay: Duration,
    ) -> Result<(), TaskError>;

    /// Pull one entry across the named queues without starving any of them.
    /// Waits up to `wait` when idle, then returns `None`.
    async fn reserve(
        &self,
        queues: &[String],
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, TaskError>;

    /// Remove the entry permanently
    async fn ack(&self, token: &LeaseToken) -> Result<(), TaskError>;

    /// Return the entry to its queue (optionally delayed) or drop it when the
    /// caller has already scheduled a successor
    async fn nack(
        &self,
        token: &LeaseToken,
        requeue: bool,
        delay: Option<Duration>,
    ) -> Result<(), TaskError>;

    /// Extend the lease of a reserved entry; must be called periodically
    /// while the task runs
    async fn renew_lease(&self, token: &LeaseToken) -> Result<(), TaskError>;

    /// Best-effort removal of a not-yet-reserved entry (queued cancellation).
    /// Returns whether an entry was removed.
    async fn purge(&self, queue: &str, task_id: &TaskId) -> Result<bool, TaskError>;

    /// Number of deliverable entries in a queue (queue-position estimates)
    async fn queue_depth(&self, queue: &str) -> Result<u64, TaskError>;

    /// Check the backing service is reachable
    async fn health_check(&self) -> Result<(), TaskError>;
}

pub mod memory;
pub use memory::MemoryBroker;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub use redis::{RedisBroker, RedisBrokerConfig};
