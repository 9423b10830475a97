//! Redis task store
//!
//! Record blobs live at `{prefix}:task:{id}` with an embedded version counter;
//! CAS updates run WATCH/MULTI/EXEC against that key. The per-project index is
//! a sorted set scored by creation time, counters are plain INCRBY keys, the
//! revocation set is a Redis set, and terminal events ride a pub/sub channel.
//! Terminal records get an EXPIRE for the remainder of their TTL; live records
//! never expire.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics::{counters, CounterSnapshot};
use crate::state::TaskState;
use crate::store::{
    MutationStep, Mutator, Page, PageRequest, TaskFilter, TaskStore, TerminalEvent, UpdateOutcome,
    CAS_MAX_ATTEMPTS,
};
use crate::task::{TaskId, TaskRecord, TaskType};
use crate::TaskError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Redis store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis URL (e.g. "redis://localhost:6379")
    pub url: String,
    /// Key prefix for all task data
    pub key_prefix: String,
    /// Connection pool size
    pub pool_size: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "showrunner".to_string(),
            pool_size: 10,
        }
    }
}

/// Redis-backed task store
pub struct RedisStore {
    config: RedisStoreConfig,
    pool: Pool,
    /// Dedicated client for pub/sub subscriptions
    client: redis::Client,
}

impl RedisStore {
    /// Create a new Redis store and verify connectivity
    pub async fn new(config: RedisStoreConfig) -> Result<Self, TaskError> {
        debug!(
            url = %config.url,
            prefix = %config.key_prefix,
            pool_size = config.pool_size,
            "Creating Redis store"
        );

        let pool_config = PoolConfig::from_url(&config.url);
        let pool = pool_config
            .builder()
            .map_err(|e| TaskError::Store(format!("Failed to create pool builder: {}", e)))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| TaskError::Store(format!("Failed to create pool: {}", e)))?;

        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| TaskError::Connection(format!("Invalid Redis URL: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| TaskError::Connection(format!("Failed to get connection: {}", e)))?;
        let _: Option<String> = conn.get("__ping__").await.ok();

        Ok(Self {
            config,
            pool,
            client,
        })
    }

    fn task_key(&self, id: &TaskId) -> String {
        format!("{}:task:{}", self.config.key_prefix, id)
    }

    fn project_key(&self, project_id: &str) -> String {
        format!("{}:project:{}:tasks", self.config.key_prefix, project_id)
    }

    fn counter_key(&self, name: &str) -> String {
        format!("{}:metrics:{}", self.config.key_prefix, name)
    }

    fn revoked_key(&self) -> String {
        format!("{}:revoked", self.config.key_prefix)
    }

    fn running_key(&self) -> String {
        format!("{}:running", self.config.key_prefix)
    }

    fn terminal_channel(&self) -> String {
        format!("{}:terminal", self.config.key_prefix)
    }

    async fn get_conn(&self) -> Result<Connection, TaskError> {
        self.pool
            .get()
            .await
            .map_err(|e| TaskError::Connection(format!("Failed to get connection: {}", e)))
    }

    fn parse_record(raw: &str) -> Result<TaskRecord, TaskError> {
        serde_json::from_str(raw)
            .map_err(|e| TaskError::Deserialization(format!("Failed to parse task record: {}", e)))
    }

    /// Seconds left until the record's TTL deadline, floored at one second
    fn remaining_ttl_secs(record: &TaskRecord) -> i64 {
        (record.ttl_expires_at - Utc::now()).num_seconds().max(1)
    }

    /// Fetch records for the given ids, pruning index members whose record
    /// has been evicted (keeps the project index consistent with the records)
    async fn fetch_project_records(
        &self,
        conn: &mut Connection,
        project_key: &str,
        ids: &[String],
    ) -> Result<Vec<TaskRecord>, TaskError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}:task:{}", self.config.key_prefix, id))
            .collect();

        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(conn)
            .await
            .map_err(|e| TaskError::Store(format!("Redis MGET failed: {}", e)))?;

        let mut records = Vec::with_capacity(ids.len());
        for (id, raw) in ids.iter().zip(raws) {
            match raw {
                Some(raw) => records.push(Self::parse_record(&raw)?),
                None => {
                    // Record evicted; heal the index lazily
                    let _: () = conn
                        .zrem(project_key, id)
                        .await
                        .map_err(|e| TaskError::Store(format!("Redis ZREM failed: {}", e)))?;
                }
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn create(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let key = self.task_key(&record.id);
        let payload = serde_json::to_string(record)
            .map_err(|e| TaskError::Serialization(format!("Failed to serialize record: {}", e)))?;

        let mut conn = self.get_conn().await?;

        let created: bool = conn
            .set_nx(&key, &payload)
            .await
            .map_err(|e| TaskError::Store(format!("Redis SETNX failed: {}", e)))?;
        if !created {
            return Err(TaskError::AlreadyExists(record.id.to_string()));
        }

        let _: () = conn
            .zadd(
                self.project_key(&record.project_id),
                record.id.to_string(),
                record.created_at.timestamp_millis(),
            )
            .await
            .map_err(|e| TaskError::Store(format!("Redis ZADD failed: {}", e)))?;

        debug!(task_id = %record.id, project_id = %record.project_id, "Created task record");
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, TaskError> {
        let mut conn = self.get_conn().await?;
        let raw: Option<String> = conn
            .get(self.task_key(id))
            .await
            .map_err(|e| TaskError::Store(format!("Redis GET failed: {}", e)))?;

        match raw {
            Some(raw) => Ok(Some(Self::parse_record(&raw)?)),
            None => Ok(None),
        }
    }

    async fn list_by_project(
        &self,
        project_id: &str,
        filter: &TaskFilter,
        page: &PageRequest,
    ) -> Result<Page<TaskRecord>, TaskError> {
        let project_key = self.project_key(project_id);
        let mut conn = self.get_conn().await?;

        // Newest first; records per project are bounded by the 24h TTL, so
        // filtering happens in memory after a full index read.
        let ids: Vec<String> = conn
            .zrevrange(&project_key, 0, -1)
            .await
            .map_err(|e| TaskError::Store(format!("Redis ZREVRANGE failed: {}", e)))?;

        let records = self
            .fetch_project_records(&mut conn, &project_key, &ids)
            .await?;

        let matching: Vec<TaskRecord> = records
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
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
        let key = self.task_key(id);
        let mut conn = self.get_conn().await?;

        for _ in 0..CAS_MAX_ATTEMPTS {
            let _: () = redis::cmd("WATCH")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| TaskError::Store(format!("Redis WATCH failed: {}", e)))?;

            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| TaskError::Store(format!("Redis GET failed: {}", e)))?;
            let current = match raw {
                Some(raw) => Self::parse_record(&raw)?,
                None => {
                    let _: () = redis::cmd("UNWATCH")
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| TaskError::Store(format!("Redis UNWATCH failed: {}", e)))?;
                    return Err(TaskError::NotFound(id.to_string()));
                }
            };

            match mutator(&current) {
                MutationStep::Abort(reason) => {
                    let _: () = redis::cmd("UNWATCH")
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| TaskError::Store(format!("Redis UNWATCH failed: {}", e)))?;
                    return Ok(UpdateOutcome::Aborted {
                        reason,
                        record: current,
                    });
                }
                MutationStep::Write(mut updated) => {
                    updated.version = current.version + 1;
                    let payload = serde_json::to_string(&*updated).map_err(|e| {
                        TaskError::Serialization(format!("Failed to serialize record: {}", e))
                    })?;

                    let mut pipe = redis::pipe();
                    pipe.atomic();
                    pipe.set(&key, &payload).ignore();

                    // Keep the running index in step with the state change
                    let entered_running =
                        updated.state == TaskState::Running && current.state != TaskState::Running;
                    let left_running =
                        current.state == TaskState::Running && updated.state != TaskState::Running;
                    if entered_running {
                        pipe.sadd(self.running_key(), id.to_string()).ignore();
                    } else if left_running {
                        pipe.srem(self.running_key(), id.to_string()).ignore();
                    }

                    // Terminal records expire at their TTL deadline
                    if updated.state.is_terminal() {
                        pipe.expire(&key, Self::remaining_ttl_secs(&updated))
                            .ignore();
                    }

                    let exec: Option<()> = pipe
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| TaskError::Store(format!("Redis EXEC failed: {}", e)))?;

                    match exec {
                        Some(()) => return Ok(UpdateOutcome::Updated(*updated)),
                        None => {
                            // Watched key changed underneath us; retry
                            debug!(task_id = %id, "CAS conflict, retrying");
                            continue;
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
        let mut conn = self.get_conn().await?;
        let _: i64 = conn
            .incr(self.counter_key(name), delta)
            .await
            .map_err(|e| TaskError::Store(format!("Redis INCRBY failed: {}", e)))?;
        Ok(())
    }

    async fn read_counters(&self) -> Result<CounterSnapshot, TaskError> {
        let mut conn = self.get_conn().await?;

        let mut names: Vec<String> = [
            counters::TOTAL_SUBMITTED,
            counters::COMPLETED,
            counters::FAILED,
            counters::RETRIED,
            counters::CANCELLED,
            counters::CURRENTLY_RUNNING,
        ]
        .iter()
        .map(|n| self.counter_key(n))
        .collect();
        for task_type in TaskType::ALL {
            names.push(self.counter_key(&counters::submitted_for(task_type)));
        }

        let values: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(&names)
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::Store(format!("Redis MGET failed: {}", e)))?;

        let at = |i: usize| values.get(i).copied().flatten().unwrap_or(0);

        let mut submitted_by_type = std::collections::HashMap::new();
        for (i, task_type) in TaskType::ALL.iter().enumerate() {
            let value = at(6 + i);
            if value > 0 {
                submitted_by_type.insert(task_type.to_string(), value as u64);
            }
        }

        Ok(CounterSnapshot {
            total_submitted: at(0).max(0) as u64,
            completed: at(1).max(0) as u64,
            failed: at(2).max(0) as u64,
            retried: at(3).max(0) as u64,
            cancelled: at(4).max(0) as u64,
            currently_running: at(5),
            submitted_by_type,
        })
    }

    async fn add_revocation(&self, id: &TaskId) -> Result<(), TaskError> {
        let mut conn = self.get_conn().await?;
        let _: () = conn
            .sadd(self.revoked_key(), id.to_string())
            .await
            .map_err(|e| TaskError::Store(format!("Redis SADD failed: {}", e)))?;
        tracing::info!(task_id = %id, "Task added to revocation set");
        Ok(())
    }

    async fn is_revoked(&self, id: &TaskId) -> Result<bool, TaskError> {
        let mut conn = self.get_conn().await?;
        conn.sismember(self.revoked_key(), id.to_string())
            .await
            .map_err(|e| TaskError::Store(format!("Redis SISMEMBER failed: {}", e)))
    }

    async fn clear_revocation(&self, id: &TaskId) -> Result<(), TaskError> {
        let mut conn = self.get_conn().await?;
        let _: () = conn
            .srem(self.revoked_key(), id.to_string())
            .await
            .map_err(|e| TaskError::Store(format!("Redis SREM failed: {}", e)))?;
        Ok(())
    }

    async fn publish_terminal(&self, event: &TerminalEvent) -> Result<(), TaskError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| TaskError::Serialization(format!("Failed to serialize event: {}", e)))?;
        let mut conn = self.get_conn().await?;
        let _: i64 = conn
            .publish(self.terminal_channel(), payload)
            .await
            .map_err(|e| TaskError::Store(format!("Redis PUBLISH failed: {}", e)))?;
        Ok(())
    }

    async fn subscribe_terminal(&self) -> Result<mpsc::Receiver<TerminalEvent>, TaskError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let channel = self.terminal_channel();

        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        warn!(error = %e, "Pub/sub connect failed, will retry");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };
                if let Err(e) = pubsub.subscribe(&channel).await {
                    warn!(error = %e, "SUBSCRIBE failed, will retry");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                while let Some(message) = stream.next().await {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, "Unreadable terminal event payload");
                            continue;
                        }
                    };
                    match serde_json::from_str::<TerminalEvent>(&payload) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Malformed terminal event, skipping");
                        }
                    }
                }

                warn!("Terminal event stream closed, resubscribing");
            }
        });

        Ok(rx)
    }

    async fn list_running(&self) -> Result<Vec<TaskRecord>, TaskError> {
        let mut conn = self.get_conn().await?;
        let ids: Vec<String> = conn
            .smembers(self.running_key())
            .await
            .map_err(|e| TaskError::Store(format!("Redis SMEMBERS failed: {}", e)))?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}:task:{}", self.config.key_prefix, id))
            .collect();
        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::Store(format!("Redis MGET failed: {}", e)))?;

        let mut records = Vec::new();
        for (id, raw) in ids.iter().zip(raws) {
            match raw.as_deref().map(Self::parse_record).transpose()? {
                Some(record) if record.state == TaskState::Running => records.push(record),
                _ => {
                    // Stale index member; heal lazily
                    let _: () = conn
                        .srem(self.running_key(), id)
                        .await
                        .map_err(|e| TaskError::Store(format!("Redis SREM failed: {}", e)))?;
                }
            }
        }

        Ok(records)
    }

    async fn health_check(&self) -> Result<(), TaskError> {
        let mut conn = self.get_conn().await?;
        let _: Option<String> = conn
            .get("__health_check__")
            .await
            .map_err(|e| TaskError::Store(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

impl Clone for RedisStore {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            pool: self.pool.clone(),
            client: self.client.clone(),
        }
    }
}
