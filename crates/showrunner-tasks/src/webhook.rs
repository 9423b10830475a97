//! Webhook deliverer
//!
//! Consumes terminal events and POSTs the standard envelope to the
//! submitter-provided callback URL. Delivery runs in a bounded pool decoupled
//! from the lifecycle manager: a slow or dead receiver can never hold up a
//! state transition. Each envelope is serialized once and the same bytes are
//! resent on every attempt. After the attempt budget is spent the event is
//! logged and dropped; delivery failures never touch the task record.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::state::TaskState;
use crate::store::{TaskStore, TerminalEvent};
use crate::TaskError;

/// Delivery policy
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Per-attempt request timeout
    pub timeout: Duration,
    /// Total attempts (first try plus retries)
    pub max_attempts: u32,
    /// First retry backoff; doubles per retry (1s, 2s, 4s)
    pub backoff_base: Duration,
    /// Concurrent deliveries
    pub concurrency: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 4,
            backoff_base: Duration::from_secs(1),
            concurrency: 8,
        }
    }
}

/// Bounded pool delivering terminal webhooks
pub struct WebhookDeliverer {
    store: Arc<dyn TaskStore>,
    client: reqwest::Client,
    config: WebhookConfig,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl WebhookDeliverer {
    pub fn new(store: Arc<dyn TaskStore>, config: WebhookConfig) -> Result<Self, TaskError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TaskError::Configuration(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            store,
            client,
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Consume terminal events until shutdown
    pub async fn run(&self) -> Result<(), TaskError> {
        let mut rx = self.store.subscribe_terminal().await?;
        tracing::info!(
            concurrency = self.config.concurrency,
            max_attempts = self.config.max_attempts,
            "Webhook deliverer started"
        );

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Webhook deliverer stopped");
                    return Ok(());
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::warn!("Terminal event stream closed, resubscribing");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        rx = self.store.subscribe_terminal().await?;
                        continue;
                    }
                },
            };

            let Some(url) = event.callback_url.clone() else {
                tracing::debug!(task_id = %event.task_id, "No callback URL, skipping");
                continue;
            };

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            let client = self.client.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let _permit = permit;
                deliver(&client, &config, &event, &url).await;
            });
        }
    }
}

/// POST one envelope with bounded retry
async fn deliver(
    client: &reqwest::Client,
    config: &WebhookConfig,
    event: &TerminalEvent,
    url: &str,
) {
    let envelope = build_envelope(event);
    let body = match serde_json::to_vec(&envelope) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(task_id = %event.task_id, error = %e, "Envelope serialization failed");
            return;
        }
    };

    for attempt in 1..=config.max_attempts {
        let response = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                tracing::info!(
                    task_id = %event.task_id,
                    url = %url,
                    status = response.status().as_u16(),
                    attempt,
                    "Webhook delivered"
                );
                return;
            }
            Ok(response) => {
                tracing::warn!(
                    task_id = %event.task_id,
                    url = %url,
                    status = response.status().as_u16(),
                    attempt,
                    "Webhook rejected"
                );
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %event.task_id,
                    url = %url,
                    attempt,
                    error = %e,
                    "Webhook request failed"
                );
            }
        }

        if attempt < config.max_attempts {
            let backoff = config.backoff_base * 2u32.saturating_pow(attempt - 1);
            tokio::time::sleep(backoff).await;
        }
    }

    tracing::error!(
        task_id = %event.task_id,
        url = %url,
        attempts = config.max_attempts,
        "Webhook delivery exhausted, dropping"
    );
}

/// Standard terminal envelope
///
/// No credentials are attached; delivery uses only the submitter-supplied
/// URL.
pub fn build_envelope(event: &TerminalEvent) -> serde_json::Value {
    let task_id = event.task_id.to_string();
    let finished_at = event.finished_at.map(|t| t.to_rfc3339());

    match event.state {
        TaskState::Completed => json!({
            "taskId": task_id,
            "projectId": event.project_id,
            "state": "completed",
            "result": event.result,
            "processingTime": event.processing_time_secs(),
            "completedAt": finished_at,
            "metadata": event.metadata,
        }),
        TaskState::Failed => json!({
            "taskId": task_id,
            "projectId": event.project_id,
            "state": "failed",
            "error": event.error.as_ref().map(|e| json!({
                "kind": e.kind.as_str(),
                "message": e.message,
            })),
            "failedAt": finished_at,
            "metadata": event.metadata,
        }),
        // Cancellations also notify the submitter (documented choice)
        _ => json!({
            "taskId": task_id,
            "projectId": event.project_id,
            "state": "cancelled",
            "cancelledAt": finished_at,
            "metadata": event.metadata,
        }),
    }
}
