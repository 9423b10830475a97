//! Core task types: ids, task types, priorities, and the authoritative record

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::TaskFailure;
use crate::state::TaskState;

/// Unique task identifier (UUID v4, opaque to clients)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub uuid::Uuid);

impl TaskId {
    /// Create a new task ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse from string
    pub fn from_string(s: &str) -> Result<Self, crate::TaskError> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::TaskError::InvalidTaskId(e.to_string()))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered task types; each maps to a queue and an execution policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    GenerateVideo,
    GenerateImage,
    ProcessAudio,
    EvaluateDepartment,
    AutomatedGatherCreation,
}

impl TaskType {
    /// Every registered task type; the router's completeness check walks this
    pub const ALL: [TaskType; 5] = [
        TaskType::GenerateVideo,
        TaskType::GenerateImage,
        TaskType::ProcessAudio,
        TaskType::EvaluateDepartment,
        TaskType::AutomatedGatherCreation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateVideo => "generate_video",
            Self::GenerateImage => "generate_image",
            Self::ProcessAudio => "process_audio",
            Self::EvaluateDepartment => "evaluate_department",
            Self::AutomatedGatherCreation => "automated_gather_creation",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate_video" => Ok(Self::GenerateVideo),
            "generate_image" => Ok(Self::GenerateImage),
            "process_audio" => Ok(Self::ProcessAudio),
            "evaluate_department" => Ok(Self::EvaluateDepartment),
            "automated_gather_creation" => Ok(Self::AutomatedGatherCreation),
            _ => Err(format!("Unknown task type: {}", s)),
        }
    }
}

/// Ordering weight within a queue; does not reorder across queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Numeric weight; lower weights are delivered first
    pub fn weight(&self) -> u8 {
        match self {
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Authoritative task record, owned by the store
///
/// Created by the submission API, mutated exclusively through
/// `TaskStore::update_atomically`, evicted by TTL once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub project_id: String,
    pub task_type: TaskType,
    /// Opaque structured payload; validated only for size and well-formedness
    pub input: serde_json::Value,
    pub priority: Priority,
    pub callback_url: Option<String>,
    /// Opaque map forwarded verbatim in the terminal webhook
    pub metadata: serde_json::Value,
    pub state: TaskState,
    /// 0 on first dispatch, incremented per retry
    pub attempt: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Advisory; updated by the executor through its progress sink
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Advisory completion percentage, 0.0..=100.0
    pub progress: Option<f64>,
    pub current_step: Option<String>,
    /// Worker that most recently held the task in Running
    pub worker_id: Option<String>,
    /// Terminal records are evicted once this passes; live records never are
    pub ttl_expires_at: DateTime<Utc>,
    /// CAS version, managed by the store
    #[serde(default)]
    pub version: u64,
}

impl TaskRecord {
    /// Create a fresh Queued record
    pub fn new(
        project_id: impl Into<String>,
        task_type: TaskType,
        input: serde_json::Value,
        priority: Priority,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let ttl_expires_at = created_at
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(86_400));

        Self {
            id: TaskId::new(),
            project_id: project_id.into(),
            task_type,
            input,
            priority,
            callback_url: None,
            metadata: serde_json::json!({}),
            state: TaskState::Queued,
            attempt: 0,
            result: None,
            error: None,
            created_at,
            started_at: None,
            finished_at: None,
            last_heartbeat_at: None,
            progress: None,
            current_step: None,
            worker_id: None,
            ttl_expires_at,
            version: 0,
        }
    }

    /// Set the webhook callback URL
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Set the opaque metadata map
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check if the record is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wall-clock execution time, once finished
    pub fn processing_time(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => (finished - started).to_std().ok(),
            _ => None,
        }
    }

    /// The instant crash detection measures staleness from
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_heartbeat_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }

    /// Whether a terminal record has aged past its TTL
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_terminal() && self.ttl_expires_at <= now
    }
}
