//! Task DTOs: inbound execution, enqueue, listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::domain::{AppointmentId, ScheduledTask, TaskId, TaskPayload, TaskStatus};
use crate::handlers::HandlerOutcome;

/// Request body for `POST /tasks/execute`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExecuteTaskRequest {
    /// Handler to run.
    pub template_id: String,
    /// Participant the task concerns.
    pub subject_id: String,
    /// Delivery channel override.
    #[serde(default)]
    pub channel: Option<String>,
    /// Deduplication key for the task's effects.
    pub idempotency_key: String,
    /// Appointment the task concerns.
    #[serde(default)]
    pub related_appointment_id: Option<AppointmentId>,
    /// Template-specific arguments.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub data: Option<serde_json::Value>,
}

impl ExecuteTaskRequest {
    /// Splits the request into its template id and handler payload.
    #[must_use]
    pub fn into_parts(self) -> (String, TaskPayload) {
        let payload = TaskPayload {
            subject_id: self.subject_id,
            appointment_id: self.related_appointment_id,
            channel: self.channel,
            idempotency_key: self.idempotency_key,
            data: self.data.unwrap_or(serde_json::Value::Null),
        };
        (self.template_id, payload)
    }
}

/// Response body for `POST /tasks/execute`.
#[derive(Debug, Serialize, ToSchema)]
pub struct ExecuteTaskResponse {
    /// `true` once the handler ran to completion.
    pub processed: bool,
    /// Template that ran.
    pub template_id: String,
    /// What the handler did.
    pub outcome: HandlerOutcome,
}

/// Request body for `POST /tasks`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct EnqueueTaskRequest {
    /// Handler to run when due.
    pub template_id: String,
    /// Earliest dispatch time.
    pub due_at: DateTime<Utc>,
    /// Handler arguments.
    pub payload: TaskPayload,
}

/// Response body for `POST /tasks` and `POST /tasks/{id}/reenqueue`.
#[derive(Debug, Serialize, ToSchema)]
pub struct EnqueueTaskResponse {
    /// Id of the new task.
    pub task_id: TaskId,
    /// Template echoed back.
    pub template_id: String,
    /// Scheduled dispatch time.
    pub due_at: DateTime<Utc>,
    /// Always `pending`.
    pub status: TaskStatus,
}

impl From<&ScheduledTask> for EnqueueTaskResponse {
    fn from(task: &ScheduledTask) -> Self {
        Self {
            task_id: task.task_id,
            template_id: task.template_id.clone(),
            due_at: task.due_at,
            status: task.status,
        }
    }
}

/// Query parameters for `POST /tasks/{id}/reenqueue`.
#[derive(Debug, Deserialize, IntoParams)]
pub struct ReenqueueParams {
    /// New dispatch time; defaults to now.
    pub due_at: Option<DateTime<Utc>>,
}

/// Response body for `GET /tasks/pending`.
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskListResponse {
    /// Pending tasks, earliest due first.
    pub data: Vec<ScheduledTask>,
    /// Number of tasks returned.
    pub total: usize,
}
