//! Task state machine

use serde::{Deserialize, Serialize};

/// Task state in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Task is waiting in a queue
    #[default]
    Queued,
    /// Task is being executed by a worker
    Running,
    /// Task completed successfully
    Completed,
    /// Task failed permanently
    Failed,
    /// Task was cancelled by the submitter
    Cancelled,
}

impl TaskState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid state transitions
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            // From QUEUED
            (Self::Queued, Self::Running) => true,
            (Self::Queued, Self::Cancelled) => true,
            // Record persisted but enqueue rejected
            (Self::Queued, Self::Failed) => true,

            // From RUNNING
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Running, Self::Cancelled) => true,
            // Retry path: re-queued for the next attempt
            (Self::Running, Self::Queued) => true,

            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task state: {}", s)),
        }
    }
}
