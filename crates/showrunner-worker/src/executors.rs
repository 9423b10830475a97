//! Forwarding executors
//!
//! Payload logic (rendering, evaluation, gathering) lives in the external
//! executor service; the worker forwards `{taskType, input}` to it over HTTP
//! and maps the response onto the execution outcome. Heartbeats flow while
//! the request is in flight, and cancellation aborts the wait.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use showrunner_tasks::{
    ExecutionContext, ExecutionOutcome, Executor, ExecutorRegistry, ProgressSink, TaskFailure,
    TaskType,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Executor that forwards payload work to the executor service
pub struct ForwardingExecutor {
    task_type: TaskType,
    endpoint: String,
    client: reqwest::Client,
}

impl ForwardingExecutor {
    pub fn new(task_type: TaskType, base_url: &str, client: reqwest::Client) -> Self {
        Self {
            task_type,
            endpoint: format!("{}/execute/{}", base_url.trim_end_matches('/'), task_type),
            client,
        }
    }

    async fn forward(&self, input: serde_json::Value) -> ExecutionOutcome {
        let body = serde_json::json!({
            "taskType": self.task_type.as_str(),
            "input": input,
        });

        let response = match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                // Connection-level problems are worth another attempt
                return ExecutionOutcome::Failure(TaskFailure::transient(format!(
                    "Executor service unreachable: {}",
                    e
                )));
            }
        };

        let status = response.status();
        if status.is_success() {
            match response.json::<serde_json::Value>().await {
                Ok(result) => ExecutionOutcome::Success(result),
                Err(e) => ExecutionOutcome::Failure(TaskFailure::permanent(format!(
                    "Executor returned unreadable result: {}",
                    e
                ))),
            }
        } else if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            ExecutionOutcome::Failure(TaskFailure::permanent(format!(
                "Executor rejected input ({}): {}",
                status, detail
            )))
        } else {
            ExecutionOutcome::Failure(TaskFailure::transient(format!(
                "Executor service error ({})",
                status
            )))
        }
    }
}

#[async_trait]
impl Executor for ForwardingExecutor {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn run(
        &self,
        input: serde_json::Value,
        progress: ProgressSink,
        ctx: ExecutionContext,
    ) -> ExecutionOutcome {
        let forward = self.forward(input);
        tokio::pin!(forward);

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                outcome = &mut forward => return outcome,
                _ = ctx.cancelled() => {
                    tracing::info!(
                        task_type = %self.task_type,
                        "Cancellation observed, abandoning executor request"
                    );
                    return ExecutionOutcome::Cancelled;
                }
                _ = heartbeat.tick() => {
                    progress.heartbeat().await;
                }
            }
        }
    }
}

/// Registry forwarding every task type to the executor service
pub fn registry(base_url: &str, request_timeout: Duration) -> anyhow::Result<Arc<ExecutorRegistry>> {
    let client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()?;

    let registry = ExecutorRegistry::new();
    for task_type in TaskType::ALL {
        registry.register(ForwardingExecutor::new(task_type, base_url, client.clone()));
    }
    Ok(Arc::new(registry))
}
