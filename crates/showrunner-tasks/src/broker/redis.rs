//! Redis broker
//!
//! Each queue is a sorted set scored by `priority * PRIORITY_STRIDE +
//! enqueue_millis`, which yields FIFO within a priority class while letting
//! higher priorities overtake. Two sibling sorted sets per queue hold delayed
//! entries (scored by ready-at) and in-flight leases (scored by lease
//! deadline); a promote pass moves due delayed entries and expired leases
//! back before each reserve attempt, so a crashed worker's entries become
//! deliverable again without any coordinator.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::{Broker, Delivery, LeaseToken};
use crate::entry::QueueEntry;
use crate::task::{Priority, TaskId};
use crate::TaskError;

/// Priority band width; millisecond timestamps stay well below one stride
const PRIORITY_STRIDE: f64 = 1e13;

/// Redis broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisBrokerConfig {
    /// Redis URL (e.g. "redis://localhost:6379")
    pub url: String,
    /// Key prefix for all queue data
    pub key_prefix: String,
    /// Lease period before an unacked entry is redelivered
    pub lease_ttl: Duration,
    /// Connection pool size
    pub pool_size: usize,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "showrunner:queue".to_string(),
            lease_ttl: Duration::from_secs(60),
            pool_size: 10,
        }
    }
}

/// Entry plus the priority it was enqueued with; kept on the side sets so a
/// redelivered entry retains its original ordering
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    entry: QueueEntry,
    priority: Priority,
}

/// Redis-backed broker
pub struct RedisBroker {
    config: RedisBrokerConfig,
    pool: Pool,
}

impl RedisBroker {
    /// Create a new Redis broker and verify connectivity
    pub async fn new(config: RedisBrokerConfig) -> Result<Self, TaskError> {
        debug!(
            url = %config.url,
            prefix = %config.key_prefix,
            lease_ttl_secs = config.lease_ttl.as_secs(),
            "Creating Redis broker"
        );

        let pool_config = PoolConfig::from_url(&config.url);
        let pool = pool_config
            .builder()
            .map_err(|e| TaskError::Broker(format!("Failed to create pool builder: {}", e)))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| TaskError::Broker(format!("Failed to create pool: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| TaskError::Connection(format!("Failed to get connection: {}", e)))?;
        let _: Option<String> = conn.get("__ping__").await.ok();

        Ok(Self { config, pool })
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:{}", self.config.key_prefix, queue)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:{}:delayed", self.config.key_prefix, queue)
    }

    fn unacked_key(&self, queue: &str) -> String {
        format!("{}:{}:unacked", self.config.key_prefix, queue)
    }

    fn leases_key(&self) -> String {
        format!("{}:leases", self.config.key_prefix)
    }

    async fn get_conn(&self) -> Result<Connection, TaskError> {
        self.pool
            .get()
            .await
            .map_err(|e| TaskError::Connection(format!("Failed to get connection: {}", e)))
    }

    fn ready_score(priority: Priority, enqueued_millis: i64) -> f64 {
        priority.weight() as f64 * PRIORITY_STRIDE + enqueued_millis as f64
    }

    fn encode(stored: &StoredEntry) -> Result<String, TaskError> {
        serde_json::to_string(stored)
            .map_err(|e| TaskError::Serialization(format!("Failed to serialize entry: {}", e)))
    }

    fn decode(raw: &str) -> Result<StoredEntry, TaskError> {
        serde_json::from_str(raw)
            .map_err(|e| TaskError::Deserialization(format!("Failed to parse entry: {}", e)))
    }

    /// The queue a token belongs to; tokens are "{queue}:{nonce}"
    fn token_queue(token: &LeaseToken) -> Result<&str, TaskError> {
        token
            .0
            .rsplit_once(':')
            .map(|(queue, _)| queue)
            .ok_or_else(|| TaskError::Broker(format!("Malformed lease token: {}", token)))
    }

    /// Move due delayed entries and expired leases back to the ready set
    async fn promote(&self, conn: &mut Connection, queue: &str) -> Result<(), TaskError> {
        let now_millis = Utc::now().timestamp_millis();

        // Due delayed entries
        let due: Vec<String> = conn
            .zrangebyscore(self.delayed_key(queue), f64::MIN, now_millis as f64)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis ZRANGEBYSCORE failed: {}", e)))?;
        for raw in due {
            let stored = Self::decode(&raw)?;
            let removed: i64 = conn
                .zrem(self.delayed_key(queue), &raw)
                .await
                .map_err(|e| TaskError::Broker(format!("Redis ZREM failed: {}", e)))?;
            // Another consumer may have promoted it first
            if removed > 0 {
                let score = Self::ready_score(stored.priority, now_millis);
                let _: () = conn
                    .zadd(self.queue_key(queue), &raw, score)
                    .await
                    .map_err(|e| TaskError::Broker(format!("Redis ZADD failed: {}", e)))?;
                debug!(task_id = %stored.entry.task_id, queue = %queue, "Promoted delayed entry");
            }
        }

        // Expired leases
        let expired_tokens: Vec<String> = conn
            .zrangebyscore(self.unacked_key(queue), f64::MIN, now_millis as f64)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis ZRANGEBYSCORE failed: {}", e)))?;
        for token in expired_tokens {
            let removed: i64 = conn
                .zrem(self.unacked_key(queue), &token)
                .await
                .map_err(|e| TaskError::Broker(format!("Redis ZREM failed: {}", e)))?;
            if removed == 0 {
                continue;
            }
            let raw: Option<String> = conn
                .hget(self.leases_key(), &token)
                .await
                .map_err(|e| TaskError::Broker(format!("Redis HGET failed: {}", e)))?;
            let _: () = conn
                .hdel(self.leases_key(), &token)
                .await
                .map_err(|e| TaskError::Broker(format!("Redis HDEL failed: {}", e)))?;
            if let Some(raw) = raw {
                let stored = Self::decode(&raw)?;
                warn!(
                    task_id = %stored.entry.task_id,
                    queue = %queue,
                    "Lease expired, entry redelivered"
                );
                // Keep the original enqueue time so the entry retakes its
                // place in the FIFO band
                let score =
                    Self::ready_score(stored.priority, stored.entry.enqueued_at.timestamp_millis());
                let _: () = conn
                    .zadd(self.queue_key(queue), &raw, score)
                    .await
                    .map_err(|e| TaskError::Broker(format!("Redis ZADD failed: {}", e)))?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(
        &self,
        queue: &str,
        entry: QueueEntry,
        priority: Priority,
    ) -> Result<(), TaskError> {
        let stored = StoredEntry { entry, priority };
        let raw = Self::encode(&stored)?;
        let score = Self::ready_score(priority, stored.entry.enqueued_at.timestamp_millis());

        let mut conn = self.get_conn().await?;
        let _: () = conn
            .zadd(self.queue_key(queue), raw, score)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis ZADD failed: {}", e)))?;

        debug!(
            task_id = %stored.entry.task_id,
            queue = %queue,
            priority = %priority,
            attempt = stored.entry.attempt,
            "Enqueued entry"
        );
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

        let stored = StoredEntry { entry, priority };
        let raw = Self::encode(&stored)?;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.get_conn().await?;
        let _: () = conn
            .zadd(self.delayed_key(queue), raw, ready_at)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis ZADD failed: {}", e)))?;

        debug!(
            task_id = %stored.entry.task_id,
            queue = %queue,
            delay_secs = delay.as_secs(),
            "Enqueued delayed entry"
        );
        Ok(())
    }

    async fn reserve(
        &self,
        queues: &[String],
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, TaskError> {
        if queues.is_empty() {
            return Ok(None);
        }

        let mut conn = self.get_conn().await?;
        for queue in queues {
            self.promote(&mut conn, queue).await?;
        }

        let keys: Vec<String> = queues.iter().map(|q| self.queue_key(q)).collect();
        let timeout = wait.as_secs_f64().max(0.1);

        // Blocks across all queue keys; Redis serves them left-to-right but
        // the promote pass above keeps every queue draining
        let popped: Option<(String, String, f64)> = redis::cmd("BZPOPMIN")
            .arg(&keys)
            .arg(timeout)
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis BZPOPMIN failed: {}", e)))?;

        let Some((popped_key, raw, _score)) = popped else {
            return Ok(None);
        };

        let queue = popped_key
            .strip_prefix(&format!("{}:", self.config.key_prefix))
            .unwrap_or(&popped_key)
            .to_string();
        let stored = Self::decode(&raw)?;

        let token = LeaseToken(format!("{}:{}", queue, uuid::Uuid::new_v4().simple()));
        let deadline = Utc::now().timestamp_millis() + self.config.lease_ttl.as_millis() as i64;

        let _: () = conn
            .hset(self.leases_key(), &token.0, &raw)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis HSET failed: {}", e)))?;
        let _: () = conn
            .zadd(self.unacked_key(&queue), &token.0, deadline)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis ZADD failed: {}", e)))?;

        debug!(
            task_id = %stored.entry.task_id,
            queue = %queue,
            worker_id = %worker_id,
            "Reserved entry"
        );

        Ok(Some(Delivery {
            queue,
            entry: stored.entry,
            token,
        }))
    }

    async fn ack(&self, token: &LeaseToken) -> Result<(), TaskError> {
        let queue = Self::token_queue(token)?.to_string();
        let mut conn = self.get_conn().await?;

        let _: () = conn
            .zrem(self.unacked_key(&queue), &token.0)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis ZREM failed: {}", e)))?;
        let _: () = conn
            .hdel(self.leases_key(), &token.0)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis HDEL failed: {}", e)))?;
        Ok(())
    }

    async fn nack(
        &self,
        token: &LeaseToken,
        requeue: bool,
        delay: Option<Duration>,
    ) -> Result<(), TaskError> {
        let queue = Self::token_queue(token)?.to_string();
        let mut conn = self.get_conn().await?;

        let raw: Option<String> = conn
            .hget(self.leases_key(), &token.0)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis HGET failed: {}", e)))?;
        let _: () = conn
            .zrem(self.unacked_key(&queue), &token.0)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis ZREM failed: {}", e)))?;
        let _: () = conn
            .hdel(self.leases_key(), &token.0)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis HDEL failed: {}", e)))?;

        if requeue {
            if let Some(raw) = raw {
                let stored = Self::decode(&raw)?;
                drop(conn);
                match delay {
                    Some(delay) if !delay.is_zero() => {
                        self.enqueue_delayed(&queue, stored.entry, stored.priority, delay)
                            .await?;
                    }
                    _ => {
                        self.enqueue(&queue, stored.entry, stored.priority).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn renew_lease(&self, token: &LeaseToken) -> Result<(), TaskError> {
        let queue = Self::token_queue(token)?.to_string();
        let deadline = Utc::now().timestamp_millis() + self.config.lease_ttl.as_millis() as i64;

        let mut conn = self.get_conn().await?;
        // XX: only refresh a lease that still exists
        let updated: i64 = redis::cmd("ZADD")
            .arg(self.unacked_key(&queue))
            .arg("XX")
            .arg("CH")
            .arg(deadline)
            .arg(&token.0)
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::Broker(format!("Redis ZADD XX failed: {}", e)))?;

        if updated == 0 {
            return Err(TaskError::Broker(format!(
                "Lease {} not found (expired or acked)",
                token
            )));
        }
        Ok(())
    }

    async fn purge(&self, queue: &str, task_id: &TaskId) -> Result<bool, TaskError> {
        let mut conn = self.get_conn().await?;

        for key in [self.queue_key(queue), self.delayed_key(queue)] {
            let members: Vec<String> = conn
                .zrange(&key, 0, -1)
                .await
                .map_err(|e| TaskError::Broker(format!("Redis ZRANGE failed: {}", e)))?;
            for raw in members {
                let stored = Self::decode(&raw)?;
                if &stored.entry.task_id == task_id {
                    let removed: i64 = conn
                        .zrem(&key, &raw)
                        .await
                        .map_err(|e| TaskError::Broker(format!("Redis ZREM failed: {}", e)))?;
                    if removed > 0 {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, TaskError> {
        let mut conn = self.get_conn().await?;
        let depth: u64 = conn
            .zcard(self.queue_key(queue))
            .await
            .map_err(|e| TaskError::Broker(format!("Redis ZCARD failed: {}", e)))?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), TaskError> {
        let mut conn = self.get_conn().await?;
        let _: Option<String> = conn
            .get("__health_check__")
            .await
            .map_err(|e| TaskError::Broker(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

impl Clone for RedisBroker {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            pool: self.pool.clone(),
        }
    }
}
