//! HTTP surface: routing table and handlers

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use showrunner_tasks::{
    CancelOutcome, PageRequest, Priority, TaskFilter, TaskId, TaskRecord, TaskState,
};

use crate::auth;
use crate::dto::{
    CancelTaskResponse, HealthResponse, ListTasksQuery, LivenessResponse, MetricsBody,
    MetricsResponse, Pagination, SubmitTaskRequest, SubmitTaskResponse, TaskListResponse,
};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const MAX_PAGE_LIMIT: u32 = 100;

static PROJECT_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static pattern"));

/// Build the application router
pub fn app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/tasks/submit", post(submit_task))
        .route("/tasks/metrics", get(task_metrics))
        .route("/tasks/health", get(task_health))
        .route("/tasks/:id/status", get(task_status))
        .route("/tasks/:id/retry", post(retry_task))
        .route("/tasks/:id", delete(cancel_task))
        .route("/projects/:project_id/tasks", get(list_project_tasks))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    let api = Router::new()
        .merge(protected)
        // Unauthenticated liveness probe
        .route("/health", get(liveness));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn parse_task_id(raw: &str) -> ApiResult<TaskId> {
    TaskId::from_string(raw)
        .map_err(|_| ApiError::Validation(format!("Invalid task id: {}", raw)))
}

fn validate_project_id(project_id: &str) -> ApiResult<()> {
    if PROJECT_ID_PATTERN.is_match(project_id) {
        Ok(())
    } else {
        Err(ApiError::Validation(
            "projectId must match [A-Za-z0-9_-]+".to_string(),
        ))
    }
}

fn validate_callback_url(raw: &str) -> ApiResult<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ApiError::Validation(format!("Invalid callbackUrl: {}", e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ApiError::Validation(format!(
            "callbackUrl must be http or https, got {}",
            other
        ))),
    }
}

/// POST /api/v1/tasks/submit
async fn submit_task(
    State(state): State<AppState>,
    payload: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitTaskResponse>)> {
    let Json(request) =
        payload.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;

    validate_project_id(&request.project_id)?;
    if let Some(url) = &request.callback_url {
        validate_callback_url(url)?;
    }
    if let Some(metadata) = &request.metadata {
        if !metadata.is_object() {
            return Err(ApiError::Validation("metadata must be an object".to_string()));
        }
    }
    let input_size = serde_json::to_vec(&request.input)
        .map_err(|e| ApiError::Validation(format!("Unserializable input: {}", e)))?
        .len();
    if input_size > state.settings.max_input_bytes {
        return Err(ApiError::Validation(format!(
            "input is {} bytes; limit is {}",
            input_size, state.settings.max_input_bytes
        )));
    }

    let policy = state.router.policy(request.task_type).clone();
    let priority: Priority = request.priority.unwrap_or(policy.default_priority);

    let mut record = TaskRecord::new(
        request.project_id,
        request.task_type,
        request.input,
        priority,
        state.settings.task_ttl,
    );
    if let Some(url) = request.callback_url {
        record = record.with_callback_url(url);
    }
    if let Some(metadata) = request.metadata {
        record = record.with_metadata(metadata);
    }

    let record = state.lifecycle.submit(record).await.map_err(ApiError::from)?;

    // Best-effort position; omitted when the broker cannot answer
    let queue_position = state.broker.queue_depth(&policy.queue).await.ok();

    Ok((
        StatusCode::CREATED,
        Json(SubmitTaskResponse {
            task_id: record.id.to_string(),
            state: record.state,
            queue_position,
            estimated_duration: Some(policy.estimated_duration.as_secs()),
        }),
    ))
}

/// GET /api/v1/tasks/:id/status
async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskRecord>> {
    let task_id = parse_task_id(&id)?;
    match state.store.get(&task_id).await.map_err(ApiError::from)? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::NotFound(format!("Unknown task {}", task_id))),
    }
}

/// GET /api/v1/projects/:project_id/tasks
async fn list_project_tasks(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<TaskListResponse>> {
    validate_project_id(&project_id)?;

    let filter = TaskFilter {
        state: query
            .status
            .as_deref()
            .map(|s| {
                s.parse::<TaskState>()
                    .map_err(|e| ApiError::Validation(e))
            })
            .transpose()?,
        task_type: query
            .task_type
            .as_deref()
            .map(|s| {
                s.parse::<showrunner_tasks::TaskType>()
                    .map_err(|e| ApiError::Validation(e))
            })
            .transpose()?,
    };

    let page = PageRequest {
        page: query.page.unwrap_or(1).max(1),
        limit: query.limit.unwrap_or(20).clamp(1, MAX_PAGE_LIMIT),
    };

    let result = state
        .store
        .list_by_project(&project_id, &filter, &page)
        .await
        .map_err(ApiError::from)?;

    let pages = if result.total == 0 {
        0
    } else {
        (result.total + result.limit as u64 - 1) / result.limit as u64
    };

    Ok(Json(TaskListResponse {
        tasks: result.items,
        pagination: Pagination {
            page: result.page,
            limit: result.limit,
            total: result.total,
            pages,
        },
    }))
}

/// DELETE /api/v1/tasks/:id
///
/// Queued tasks cancel synchronously. For a running task the revocation set
/// is updated and 202 is returned while the worker's revocation watcher
/// drives the terminal transition.
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelTaskResponse>)> {
    let task_id = parse_task_id(&id)?;

    match state.lifecycle.cancel(&task_id).await.map_err(ApiError::from)? {
        CancelOutcome::Cancelled {
            record,
            previous_state,
        } => Ok((
            StatusCode::OK,
            Json(CancelTaskResponse {
                task_id: record.id.to_string(),
                state: "cancelled".to_string(),
                previous_state,
            }),
        )),
        CancelOutcome::Cancelling { record } => Ok((
            StatusCode::ACCEPTED,
            Json(CancelTaskResponse {
                task_id: record.id.to_string(),
                state: "cancelling".to_string(),
                previous_state: TaskState::Running,
            }),
        )),
    }
}

/// POST /api/v1/tasks/:id/retry
///
/// Creates a new task from a retriably-failed one; the original record is
/// never mutated.
async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<SubmitTaskResponse>)> {
    let task_id = parse_task_id(&id)?;
    let original = state
        .store
        .get(&task_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("Unknown task {}", task_id)))?;

    if original.state != TaskState::Failed {
        return Err(ApiError::Conflict(format!(
            "Only failed tasks can be retried; task is {}",
            original.state
        )));
    }
    let retriable = original
        .error
        .as_ref()
        .map(|e| e.retriable)
        .unwrap_or(false);
    if !retriable {
        return Err(ApiError::Conflict(
            "Task failed with a non-retriable error".to_string(),
        ));
    }

    let policy = state.router.policy(original.task_type).clone();
    let mut record = TaskRecord::new(
        original.project_id.clone(),
        original.task_type,
        original.input.clone(),
        original.priority,
        state.settings.task_ttl,
    )
    .with_metadata(original.metadata.clone());
    if let Some(url) = original.callback_url.clone() {
        record = record.with_callback_url(url);
    }

    let record = state.lifecycle.submit(record).await.map_err(ApiError::from)?;
    let queue_position = state.broker.queue_depth(&policy.queue).await.ok();

    tracing::info!(
        original_task_id = %task_id,
        new_task_id = %record.id,
        "Failed task resubmitted"
    );

    Ok((
        StatusCode::CREATED,
        Json(SubmitTaskResponse {
            task_id: record.id.to_string(),
            state: record.state,
            queue_position,
            estimated_duration: Some(policy.estimated_duration.as_secs()),
        }),
    ))
}

/// GET /api/v1/tasks/metrics
async fn task_metrics(State(state): State<AppState>) -> ApiResult<Json<MetricsResponse>> {
    let counters = state.store.read_counters().await.map_err(ApiError::from)?;
    let success_rate = counters.success_rate();
    let failure_rate = counters.failure_rate();

    Ok(Json(MetricsResponse {
        metrics: MetricsBody {
            counters,
            success_rate,
            failure_rate,
        },
        timestamp: Utc::now().to_rfc3339(),
    }))
}

/// GET /api/v1/tasks/health
async fn task_health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let report = state.health.check().await.map_err(ApiError::from)?;
    Ok(Json(HealthResponse {
        status: report.status,
        alerts: report.alerts,
        timestamp: Utc::now().to_rfc3339(),
    }))
}

/// GET /api/v1/health (no authentication; liveness only)
async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "healthy",
        app: "showrunner",
        timestamp: Utc::now().to_rfc3339(),
    })
}
