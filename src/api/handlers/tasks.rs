//! Task handlers: synchronous execution, enqueue, inspection, retry.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::{
    EnqueueTaskRequest, EnqueueTaskResponse, ExecuteTaskRequest, ExecuteTaskResponse,
    ReenqueueParams, TaskListResponse,
};
use crate::app_state::AppState;
use crate::domain::{ScheduledTask, TaskId};
use crate::error::{ErrorResponse, SchedulerError};

/// `POST /tasks/execute`: run a handler now, bypassing the queue.
///
/// # Errors
///
/// Returns [`SchedulerError::UnknownTemplate`] for an unregistered template,
/// or whatever the handler itself returned.
#[utoipa::path(
    post,
    path = "/api/v1/tasks/execute",
    tag = "Tasks",
    summary = "Execute a task handler",
    description = "Runs the named handler synchronously against the payload. Effects are gated by the idempotency key, so re-sending the same request returns `already_applied` instead of repeating them.",
    request_body = ExecuteTaskRequest,
    responses(
        (status = 200, description = "Handler ran", body = ExecuteTaskResponse),
        (status = 400, description = "Malformed payload", body = ErrorResponse),
        (status = 404, description = "Unknown template or appointment", body = ErrorResponse),
        (status = 409, description = "Lifecycle conflict", body = ErrorResponse),
        (status = 500, description = "Handler or collaborator failed", body = ErrorResponse),
    )
)]
pub async fn execute_task(
    State(state): State<AppState>,
    Json(req): Json<ExecuteTaskRequest>,
) -> Result<impl IntoResponse, SchedulerError> {
    let (template_id, payload) = req.into_parts();
    let outcome = state.registry.dispatch(&template_id, &payload).await?;

    Ok((
        StatusCode::OK,
        Json(ExecuteTaskResponse {
            processed: true,
            template_id,
            outcome,
        }),
    ))
}

/// `POST /tasks`: schedule a handler run.
///
/// # Errors
///
/// Returns [`SchedulerError::InvalidRequest`] for a blank template, subject
/// or key.
#[utoipa::path(
    post,
    path = "/api/v1/tasks",
    tag = "Tasks",
    summary = "Enqueue a task",
    description = "Persists a pending task that the dispatcher runs once `due_at` has passed. Templates are resolved at dispatch time.",
    request_body = EnqueueTaskRequest,
    responses(
        (status = 201, description = "Task enqueued", body = EnqueueTaskResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
    )
)]
pub async fn enqueue_task(
    State(state): State<AppState>,
    Json(req): Json<EnqueueTaskRequest>,
) -> Result<impl IntoResponse, SchedulerError> {
    let task_id = state
        .scheduler
        .enqueue(&req.template_id, req.due_at, req.payload)
        .await?;
    let task = state.scheduler.get(task_id).await?;

    Ok((StatusCode::CREATED, Json(EnqueueTaskResponse::from(&task))))
}

/// `GET /tasks/pending`: list tasks waiting to run.
///
/// # Errors
///
/// Returns [`SchedulerError::Persistence`] on storage failure.
#[utoipa::path(
    get,
    path = "/api/v1/tasks/pending",
    tag = "Tasks",
    summary = "List pending tasks",
    description = "Returns every task still waiting for dispatch, earliest due first.",
    responses(
        (status = 200, description = "Pending tasks", body = TaskListResponse),
    )
)]
pub async fn list_pending(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, SchedulerError> {
    let data = state.scheduler.list_pending().await?;
    let total = data.len();
    Ok((StatusCode::OK, Json(TaskListResponse { data, total })))
}

/// `GET /tasks/{id}`: fetch one task with its result or error.
///
/// # Errors
///
/// Returns [`SchedulerError::TaskNotFound`] if the task does not exist.
#[utoipa::path(
    get,
    path = "/api/v1/tasks/{id}",
    tag = "Tasks",
    summary = "Get task",
    params(("id" = TaskId, Path, description = "Task identifier")),
    responses(
        (status = 200, description = "Task", body = ScheduledTask),
        (status = 404, description = "Task not found", body = ErrorResponse),
    )
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> Result<impl IntoResponse, SchedulerError> {
    let task = state.scheduler.get(id).await?;
    Ok((StatusCode::OK, Json(task)))
}

/// `POST /tasks/{id}/reenqueue`: retry a failed task as a new one.
///
/// # Errors
///
/// Returns [`SchedulerError::TaskNotFound`] or
/// [`SchedulerError::InvalidRequest`] if the task has not failed.
#[utoipa::path(
    post,
    path = "/api/v1/tasks/{id}/reenqueue",
    tag = "Tasks",
    summary = "Re-enqueue a failed task",
    description = "Creates a fresh pending task with the failed task's template and payload. The failed task stays as it is.",
    params(
        ("id" = TaskId, Path, description = "Failed task identifier"),
        ReenqueueParams,
    ),
    responses(
        (status = 201, description = "Replacement task enqueued", body = EnqueueTaskResponse),
        (status = 400, description = "Task has not failed", body = ErrorResponse),
        (status = 404, description = "Task not found", body = ErrorResponse),
    )
)]
pub async fn reenqueue_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
    Query(params): Query<ReenqueueParams>,
) -> Result<impl IntoResponse, SchedulerError> {
    let task_id = state.scheduler.reenqueue(id, params.due_at).await?;
    let task = state.scheduler.get(task_id).await?;
    Ok((StatusCode::CREATED, Json(EnqueueTaskResponse::from(&task))))
}

/// Task routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(enqueue_task))
        .route("/tasks/execute", post(execute_task))
        .route("/tasks/pending", get(list_pending))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/reenqueue", post(reenqueue_task))
}
