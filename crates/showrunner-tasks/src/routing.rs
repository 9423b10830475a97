//! Task routing: task type to queue and execution policy
//!
//! The routing table is static configuration loaded at startup. Construction
//! fails unless every registered task type has a policy, so a missing row is
//! caught before any traffic is accepted. The built-in table can be overridden
//! per task type through the `TASK_ROUTES` environment variable (JSON).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::task::{Priority, TaskType};
use crate::TaskError;

/// Execution policy attached to a task type
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPolicy {
    /// Queue the task type is dispatched to
    pub queue: String,
    /// Deadline after which the execution context is cancelled
    pub hard_timeout: Duration,
    /// Cooperative wind-down signal, fired before the hard timeout
    pub soft_timeout: Duration,
    /// Retry budget for retriable failures
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt
    pub retry_initial_delay: Duration,
    /// Priority applied when the submitter does not pick one
    pub default_priority: Priority,
    /// Advisory duration hint returned on submission
    pub estimated_duration: Duration,
}

impl ExecutionPolicy {
    /// Retry schedule derived from this policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_retries,
            self.retry_initial_delay,
            Duration::from_secs(600),
        )
    }

    /// How long a Running record may go without activity before it is
    /// considered abandoned
    pub fn staleness_bound(&self) -> Duration {
        self.hard_timeout * 2
    }
}

/// Serialized form of a policy override (all durations in seconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub queue: String,
    pub hard_timeout_secs: u64,
    pub soft_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_initial_delay_secs: u64,
    #[serde(default)]
    pub default_priority: Priority,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
}

impl From<PolicyConfig> for ExecutionPolicy {
    fn from(config: PolicyConfig) -> Self {
        let estimated = config
            .estimated_duration_secs
            .unwrap_or(config.soft_timeout_secs / 2);
        Self {
            queue: config.queue,
            hard_timeout: Duration::from_secs(config.hard_timeout_secs),
            soft_timeout: Duration::from_secs(config.soft_timeout_secs),
            max_retries: config.max_retries,
            retry_initial_delay: Duration::from_secs(config.retry_initial_delay_secs),
            default_priority: config.default_priority,
            estimated_duration: Duration::from_secs(estimated),
        }
    }
}

/// Routing table: task type -> queue and execution policy
#[derive(Debug, Clone)]
pub struct TaskRouter {
    policies: HashMap<TaskType, ExecutionPolicy>,
}

impl TaskRouter {
    /// Build a router, verifying the table covers every task type
    pub fn new(policies: HashMap<TaskType, ExecutionPolicy>) -> Result<Self, TaskError> {
        for task_type in TaskType::ALL {
            if !policies.contains_key(&task_type) {
                return Err(TaskError::Configuration(format!(
                    "No execution policy for task type {}",
                    task_type
                )));
            }
        }
        Ok(Self { policies })
    }

    /// The built-in routing table
    pub fn builtin() -> Self {
        fn policy(
            queue: &str,
            hard_secs: u64,
            soft_secs: u64,
            priority: Priority,
            estimated_secs: u64,
        ) -> ExecutionPolicy {
            ExecutionPolicy {
                queue: queue.to_string(),
                hard_timeout: Duration::from_secs(hard_secs),
                soft_timeout: Duration::from_secs(soft_secs),
                max_retries: 3,
                retry_initial_delay: Duration::from_secs(60),
                default_priority: priority,
                estimated_duration: Duration::from_secs(estimated_secs),
            }
        }

        let mut policies = HashMap::new();
        policies.insert(
            TaskType::GenerateVideo,
            policy("gpu_heavy", 600, 540, Priority::High, 300),
        );
        policies.insert(
            TaskType::GenerateImage,
            policy("gpu_medium", 300, 270, Priority::Normal, 60),
        );
        policies.insert(
            TaskType::ProcessAudio,
            policy("cpu_intensive", 600, 540, Priority::Normal, 120),
        );
        policies.insert(
            TaskType::EvaluateDepartment,
            policy("cpu_intensive", 300, 270, Priority::High, 30),
        );
        policies.insert(
            TaskType::AutomatedGatherCreation,
            policy("cpu_intensive", 600, 540, Priority::High, 180),
        );

        // The table above covers TaskType::ALL
        Self { policies }
    }

    /// Built-in table with per-type overrides from the `TASK_ROUTES` env var
    ///
    /// The variable holds a JSON map of task type name to [`PolicyConfig`].
    pub fn from_env() -> Result<Self, TaskError> {
        let mut router = Self::builtin();

        if let Ok(json) = std::env::var("TASK_ROUTES") {
            let overrides: HashMap<String, PolicyConfig> = serde_json::from_str(&json)
                .map_err(|e| TaskError::Configuration(format!("Invalid TASK_ROUTES: {}", e)))?;

            for (name, config) in overrides {
                let task_type: TaskType = name
                    .parse()
                    .map_err(|e: String| TaskError::Configuration(e))?;
                router.policies.insert(task_type, config.into());
            }
        }

        Ok(router)
    }

    /// Execution policy for a task type
    pub fn policy(&self, task_type: TaskType) -> &ExecutionPolicy {
        // new()/builtin() guarantee a row per task type
        &self.policies[&task_type]
    }

    /// Queue a task type is dispatched to
    pub fn queue_for(&self, task_type: TaskType) -> &str {
        &self.policy(task_type).queue
    }

    /// Distinct queue names across the table, sorted for stable worker config
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .policies
            .values()
            .map(|p| p.queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        queues
    }

    /// Replace the policy for one task type (used by tests and tooling)
    pub fn with_policy(mut self, task_type: TaskType, policy: ExecutionPolicy) -> Self {
        self.policies.insert(task_type, policy);
        self
    }
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::builtin()
    }
}
