//! Request and response bodies

use serde::{Deserialize, Serialize};

use showrunner_tasks::{
    Alert, CounterSnapshot, HealthStatus, Priority, TaskRecord, TaskState, TaskType,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    pub project_id: String,
    pub task_type: TaskType,
    pub input: serde_json::Value,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskResponse {
    pub task_id: String,
    pub state: TaskState,
    /// Best-effort position in the routed queue at submission time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
    /// Advisory duration hint in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub pages: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskRecord>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskResponse {
    pub task_id: String,
    /// "cancelled", or "cancelling" while a running task winds down
    pub state: String,
    pub previous_state: TaskState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsBody {
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    pub success_rate: f64,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub metrics: MetricsBody,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub alerts: Vec<Alert>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub app: &'static str,
    pub timestamp: String,
}
