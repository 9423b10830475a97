//! Server configuration from environment variables

use anyhow::Context;
use std::env;
use std::time::Duration;

/// Server settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Shared API key checked on every authenticated route
    pub api_key: String,
    /// Redis URL for the task store
    pub store_url: String,
    /// Redis URL for the broker
    pub broker_url: String,
    /// TTL applied to terminal records
    pub task_ttl: Duration,
    /// Upper bound on the serialized task input
    pub max_input_bytes: usize,
    /// Webhook per-attempt timeout
    pub webhook_timeout: Duration,
    /// Webhook total attempts
    pub webhook_max_attempts: u32,
    /// Webhook delivery concurrency
    pub webhook_concurrency: usize,
    /// Time between reaper passes
    pub reaper_interval: Duration,
}

impl Settings {
    /// Load settings from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("API_PORT")
            .unwrap_or_else(|_| "8001".to_string())
            .parse()
            .context("API_PORT must be a port number")?;
        let api_key = env::var("API_KEY").context("API_KEY must be set")?;
        if api_key.is_empty() {
            anyhow::bail!("API_KEY must not be empty");
        }

        let store_url =
            env::var("STORE_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let broker_url = env::var("BROKER_URL").unwrap_or_else(|_| store_url.clone());

        let task_ttl = Duration::from_secs(
            env::var("TASK_TTL_SECONDS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .context("TASK_TTL_SECONDS must be an integer")?,
        );
        let max_input_bytes = env::var("MAX_INPUT_BYTES")
            .unwrap_or_else(|_| "262144".to_string())
            .parse()
            .context("MAX_INPUT_BYTES must be an integer")?;

        let webhook_timeout = Duration::from_secs(
            env::var("WEBHOOK_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("WEBHOOK_TIMEOUT_SECONDS must be an integer")?,
        );
        let webhook_max_attempts = env::var("WEBHOOK_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .context("WEBHOOK_MAX_ATTEMPTS must be an integer")?;
        let webhook_concurrency = env::var("WEBHOOK_CONCURRENCY")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .context("WEBHOOK_CONCURRENCY must be an integer")?;

        let reaper_interval = Duration::from_secs(
            env::var("REAPER_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("REAPER_INTERVAL_SECONDS must be an integer")?,
        );

        Ok(Self {
            host,
            port,
            api_key,
            store_url,
            broker_url,
            task_ttl,
            max_input_bytes,
            webhook_timeout,
            webhook_max_attempts,
            webhook_concurrency,
            reaper_interval,
        })
    }

    /// Settings for in-process tests
    pub fn for_tests(api_key: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            api_key: api_key.into(),
            store_url: String::new(),
            broker_url: String::new(),
            task_ttl: Duration::from_secs(86_400),
            max_input_bytes: 262_144,
            webhook_timeout: Duration::from_secs(30),
            webhook_max_attempts: 4,
            webhook_concurrency: 8,
            reaper_interval: Duration::from_secs(60),
        }
    }
}
