//! Database row models and their conversion into domain types.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    Appointment, AppointmentId, EventId, LedgerEvent, ScheduledTask, TaskId, TaskPayload,
};
use crate::error::SchedulerError;

/// A row from the `ledger_events` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    /// Event primary key.
    pub event_id: Uuid,
    /// Subject the event is about.
    pub subject_id: String,
    /// Event type discriminator.
    pub event_type: String,
    /// Linked appointment.
    pub related_appointment_id: Option<Uuid>,
    /// Unique deduplication key.
    pub idempotency_key: Option<String>,
    /// JSONB payload.
    pub payload: serde_json::Value,
    /// Insert timestamp.
    pub created_at: DateTime<Utc>,
}

impl From<EventRow> for LedgerEvent {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: EventId::from_uuid(row.event_id),
            subject_id: row.subject_id,
            event_type: row.event_type,
            related_appointment_id: row.related_appointment_id.map(AppointmentId::from_uuid),
            idempotency_key: row.idempotency_key,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

/// A row from the `scheduled_tasks` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    /// Task primary key.
    pub task_id: Uuid,
    /// Handler template id.
    pub template_id: String,
    /// Earliest dispatch time.
    pub due_at: DateTime<Utc>,
    /// Status string.
    pub status: String,
    /// JSONB-encoded [`TaskPayload`].
    pub payload: serde_json::Value,
    /// Error text of a failed attempt.
    pub last_error: Option<String>,
    /// JSONB handler outcome.
    pub result: Option<serde_json::Value>,
    /// Enqueue timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for ScheduledTask {
    type Error = SchedulerError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let payload: TaskPayload = serde_json::from_value(row.payload).map_err(|e| {
            SchedulerError::Persistence(format!("corrupt payload on task {}: {e}", row.task_id))
        })?;
        Ok(Self {
            task_id: TaskId::from_uuid(row.task_id),
            template_id: row.template_id,
            due_at: row.due_at,
            status: row.status.parse()?,
            payload,
            last_error: row.last_error,
            result: row.result,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// A row from the `appointments` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppointmentRow {
    /// Appointment primary key.
    pub appointment_id: Uuid,
    /// Participant owning the booking.
    pub owner_id: String,
    /// Slot identity.
    pub resource_key: String,
    /// Visit start.
    pub slot_start: DateTime<Utc>,
    /// Visit type.
    pub visit_type: Option<String>,
    /// Status string.
    pub status: String,
    /// Hold expiry.
    pub slot_held_until: Option<DateTime<Utc>>,
    /// Confirmation deadline.
    pub confirmation_due_at: Option<DateTime<Utc>>,
    /// Failed read-backs.
    pub teach_back_attempts: i32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AppointmentRow> for Appointment {
    type Error = SchedulerError;

    fn try_from(row: AppointmentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            appointment_id: AppointmentId::from_uuid(row.appointment_id),
            owner_id: row.owner_id,
            resource_key: row.resource_key,
            slot_start: row.slot_start,
            visit_type: row.visit_type,
            status: row.status.parse()?,
            slot_held_until: row.slot_held_until,
            confirmation_due_at: row.confirmation_due_at,
            teach_back_attempts: u32::try_from(row.teach_back_attempts).unwrap_or(0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
