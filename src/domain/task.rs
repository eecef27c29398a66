//! Deferred task records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{AppointmentId, TaskId};
use crate::error::SchedulerError;

/// Template ids of the handlers registered by default.
pub mod templates {
    /// Expires a booking that was never confirmed.
    pub const CONFIRMATION_CHECK: &str = "confirmation_check";
    /// Marks an unattended visit as no-show and opens a callback ticket.
    pub const NO_SHOW_RESCUE: &str = "no_show_rescue";
    /// Releases a hold that was never turned into a booking.
    pub const HOLD_EXPIRY: &str = "hold_expiry";
    /// Reminds the participant of an upcoming visit.
    pub const RECONFIRMATION: &str = "reconfirmation";
    /// Contacts a participant whose booking lapsed.
    pub const FOLLOW_UP_CONTACT: &str = "follow_up_contact";
}

/// Lifecycle of a scheduled task.
///
/// `pending → executing → completed | failed`, once per dispatch attempt.
/// `failed` is terminal; retry means enqueuing a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its due time.
    Pending,
    /// Claimed by the dispatcher; handler running.
    Executing,
    /// Handler returned successfully.
    Completed,
    /// Handler returned an error, or no handler was registered.
    Failed,
}

impl TaskStatus {
    /// Returns the storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SchedulerError::Internal(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

/// Arguments a handler receives.
///
/// The `idempotency_key` is mandatory: handlers use it (or keys derived from
/// it) for every ledger write so that redelivery is inert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaskPayload {
    /// Participant the task concerns.
    pub subject_id: String,
    /// Appointment the task concerns, if any.
    #[serde(default)]
    pub appointment_id: Option<AppointmentId>,
    /// Delivery channel for outbound messages (e.g. `"sms"`).
    #[serde(default)]
    pub channel: Option<String>,
    /// Deduplication key for the task's side effects.
    pub idempotency_key: String,
    /// Template-specific extra arguments.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: serde_json::Value,
}

impl TaskPayload {
    /// Creates a payload for an appointment-scoped task.
    #[must_use]
    pub fn for_appointment(
        subject_id: impl Into<String>,
        appointment_id: AppointmentId,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            appointment_id: Some(appointment_id),
            channel: None,
            idempotency_key: idempotency_key.into(),
            data: serde_json::Value::Null,
        }
    }

    /// Sets the delivery channel.
    #[must_use]
    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Sets the template-specific data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Returns the appointment id the task targets.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidRequest`] when the payload carries no
    /// appointment id.
    pub fn require_appointment(&self) -> Result<AppointmentId, SchedulerError> {
        self.appointment_id.ok_or_else(|| {
            SchedulerError::InvalidRequest("task payload has no appointment_id".to_string())
        })
    }
}

/// A deferred unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ScheduledTask {
    /// Generated task identifier.
    pub task_id: TaskId,
    /// Which handler to invoke.
    pub template_id: String,
    /// Earliest dispatch time.
    pub due_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Handler arguments.
    pub payload: TaskPayload,
    /// Error text of the last failed attempt.
    pub last_error: Option<String>,
    /// Handler outcome of a completed attempt.
    #[schema(value_type = Option<Object>)]
    pub result: Option<serde_json::Value>,
    /// Enqueue timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Creates a pending task.
    #[must_use]
    pub fn pending(
        template_id: impl Into<String>,
        due_at: DateTime<Utc>,
        payload: TaskPayload,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            template_id: template_id.into(),
            due_at,
            status: TaskStatus::Pending,
            payload,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if the task is pending and its due time has passed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.due_at <= now
    }
}
