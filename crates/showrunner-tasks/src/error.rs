//! Dispatch-core error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Infrastructure and contract errors raised by the dispatch core
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for TaskError {
    fn from(err: uuid::Error) -> Self {
        TaskError::InvalidTaskId(err.to_string())
    }
}

/// Classified failure kinds stamped on a task's terminal error envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Record was persisted but the broker rejected the enqueue
    EnqueueFailed,
    /// Transient executor failure (network, downstream timeout)
    ExecutorTransient,
    /// Permanent executor failure (invalid input detected at runtime)
    ExecutorPermanent,
    /// Hard timeout fired before the executor returned
    Timeout,
    /// Worker crashed or the heartbeat went stale
    Abandoned,
}

impl FailureKind {
    /// Whether failures of this kind are retried by default
    pub fn default_retriable(&self) -> bool {
        matches!(
            self,
            Self::ExecutorTransient | Self::Timeout | Self::Abandoned
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnqueueFailed => "enqueue_failed",
            Self::ExecutorTransient => "executor_transient",
            Self::ExecutorPermanent => "executor_permanent",
            Self::Timeout => "timeout",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Terminal failure envelope stored on the task record and forwarded in webhooks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Classified by the executor; the lifecycle manager trusts this bit but
    /// still enforces the retry-count ceiling.
    pub retriable: bool,
}

impl TaskFailure {
    /// Create a failure with the kind's default retriability
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retriable: kind.default_retriable(),
        }
    }

    /// Transient executor failure (retriable)
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ExecutorTransient, message)
    }

    /// Permanent executor failure (never retried)
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ExecutorPermanent, message)
    }

    /// Hard-timeout failure (retriable within the budget)
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Stale-heartbeat failure (retriable within the budget)
    pub fn abandoned(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Abandoned, message)
    }

    /// Record creation succeeded but the enqueue did not
    pub fn enqueue_failed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::EnqueueFailed, message)
    }

    /// Override the retriable bit
    pub fn with_retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }
}
