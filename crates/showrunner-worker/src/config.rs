//! Worker configuration from environment variables

use anyhow::Context;
use std::env;

use showrunner_tasks::WorkerConfig;

/// Worker process settings
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Redis URL for the task store
    pub store_url: String,
    /// Redis URL for the broker
    pub broker_url: String,
    /// Base URL of the executor service payload requests are forwarded to
    pub executor_url: String,
    /// Queues this worker consumes; empty means every routed queue
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub recycle_after: u64,
    pub memory_limit_bytes: Option<u64>,
}

impl WorkerSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let store_url =
            env::var("STORE_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let broker_url = env::var("BROKER_URL").unwrap_or_else(|_| store_url.clone());
        let executor_url =
            env::var("EXECUTOR_URL").unwrap_or_else(|_| "http://localhost:8100".to_string());

        let queues = env::var("WORKER_QUEUES")
            .map(|raw| {
                raw.split(',')
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let concurrency = env::var("WORKER_CONCURRENCY")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .context("WORKER_CONCURRENCY must be an integer")?;
        let recycle_after = env::var("WORKER_RECYCLE_AFTER")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("WORKER_RECYCLE_AFTER must be an integer")?;
        let memory_limit_mb: u64 = env::var("WORKER_MEMORY_LIMIT_MB")
            .unwrap_or_else(|_| "2048".to_string())
            .parse()
            .context("WORKER_MEMORY_LIMIT_MB must be an integer")?;

        Ok(Self {
            store_url,
            broker_url,
            executor_url,
            queues,
            concurrency,
            recycle_after,
            memory_limit_bytes: (memory_limit_mb > 0).then(|| memory_limit_mb * 1024 * 1024),
        })
    }

    /// Runtime config for the dispatch core's worker
    pub fn worker_config(&self, queues: Vec<String>) -> WorkerConfig {
        WorkerConfig {
            queues,
            concurrency: self.concurrency,
            recycle_after: self.recycle_after,
            memory_limit_bytes: self.memory_limit_bytes,
            ..WorkerConfig::default()
        }
    }
}
