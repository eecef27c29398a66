//! Scheduler error types with HTTP status code mapping.
//!
//! [`SchedulerError`] is the central error type. Each variant maps to a
//! numeric code and an HTTP status, rendered as a structured JSON body.
//!
//! A duplicate idempotency key is deliberately absent: it is reported as
//! [`crate::domain::AppendOutcome::AlreadyApplied`], not as an error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{AppointmentId, AppointmentStatus, LifecycleAction, TaskId};

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2101,
///     "message": "slot taken: trial-7/site-2/2026-11-02T09:00",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with HTTP status code mapping.
///
/// # Error Code Ranges
///
/// | Range     | Category          | HTTP Status               |
/// |-----------|-------------------|---------------------------|
/// | 1000–1999 | Validation        | 400 Bad Request           |
/// | 2000–2099 | Not Found         | 404 Not Found             |
/// | 2100–2199 | Slot / Lifecycle  | 409 Conflict              |
/// | 3000–3999 | Server            | 500 Internal Server Error |
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Request validation failed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Appointment with the given ID was not found.
    #[error("appointment not found: {0}")]
    AppointmentNotFound(AppointmentId),

    /// Scheduled task with the given ID was not found.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// No handler is registered for the template id.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    /// Another active appointment already occupies the slot.
    #[error("slot taken: {resource_key}")]
    SlotTaken {
        /// The contested slot.
        resource_key: String,
    },

    /// The action is not legal from the appointment's current status.
    #[error("cannot {action} appointment {appointment_id} in status {from}")]
    InvalidTransition {
        /// Appointment the action targeted.
        appointment_id: AppointmentId,
        /// Status the appointment was in.
        from: AppointmentStatus,
        /// Rejected action.
        action: LifecycleAction,
    },

    /// The hold lapsed before it was booked.
    #[error("hold expired for appointment {0}")]
    HoldExpired(AppointmentId),

    /// The availability provider reports the slot as closed.
    #[error("slot unavailable: {0}")]
    SlotUnavailable(String),

    /// A task handler failed while executing.
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// Persistence layer failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::AppointmentNotFound(_) => 2001,
            Self::TaskNotFound(_) => 2002,
            Self::UnknownTemplate(_) => 2003,
            Self::SlotTaken { .. } => 2101,
            Self::InvalidTransition { .. } => 2102,
            Self::HoldExpired(_) => 2103,
            Self::SlotUnavailable(_) => 2104,
            Self::Internal(_) => 3000,
            Self::Persistence(_) => 3001,
            Self::HandlerFailure(_) => 3002,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::AppointmentNotFound(_) | Self::TaskNotFound(_) | Self::UnknownTemplate(_) => {
                StatusCode::NOT_FOUND
            }
            Self::SlotTaken { .. }
            | Self::InvalidTransition { .. }
            | Self::HoldExpired(_)
            | Self::SlotUnavailable(_) => StatusCode::CONFLICT,
            Self::HandlerFailure(_) | Self::Persistence(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable kind, stored on failed tasks.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::AppointmentNotFound(_) | Self::TaskNotFound(_) => "not_found",
            Self::UnknownTemplate(_) => "unknown_template",
            Self::SlotTaken { .. } => "slot_taken",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::HoldExpired(_) => "hold_expired",
            Self::SlotUnavailable(_) => "slot_unavailable",
            Self::HandlerFailure(_) => "handler_failure",
            Self::Persistence(_) => "persistence",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: Some(self.kind().to_string()),
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
