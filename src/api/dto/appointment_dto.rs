//! Appointment DTOs: holds, bookings, transitions, teach-back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{Appointment, AppointmentId, EventId};
use crate::service::{BookingRequest, HoldRequest, TeachBackOutcome, Transition};

/// Request body for `POST /appointments/holds`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateHoldRequest {
    /// Participant placing the hold.
    pub owner_id: String,
    /// Slot identity.
    pub resource_key: String,
    /// Visit start.
    pub slot_start: DateTime<Utc>,
}

impl From<CreateHoldRequest> for HoldRequest {
    fn from(req: CreateHoldRequest) -> Self {
        Self {
            owner_id: req.owner_id,
            resource_key: req.resource_key,
            slot_start: req.slot_start,
        }
    }
}

/// Request body for `POST /appointments`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct BookDirectRequest {
    /// Participant booking the slot.
    pub owner_id: String,
    /// Slot identity.
    pub resource_key: String,
    /// Visit start.
    pub slot_start: DateTime<Utc>,
    /// Visit type.
    #[serde(default)]
    pub visit_type: Option<String>,
}

impl From<BookDirectRequest> for BookingRequest {
    fn from(req: BookDirectRequest) -> Self {
        Self {
            owner_id: req.owner_id,
            resource_key: req.resource_key,
            slot_start: req.slot_start,
            visit_type: req.visit_type,
        }
    }
}

/// Request body for `POST /appointments/{id}/book`.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct BookHoldRequest {
    /// Visit type chosen at booking.
    #[serde(default)]
    pub visit_type: Option<String>,
}

/// Request body for `POST /appointments/{id}/cancel`.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelRequest {
    /// Why the appointment was cancelled.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Request body for `POST /appointments/{id}/teach-back`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct TeachBackRequest {
    /// Whether the participant read the details back correctly.
    pub passed: bool,
    /// Deduplication key for this read-back report.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Response body for `POST /appointments/{id}/teach-back`.
#[derive(Debug, Serialize, ToSchema)]
pub struct TeachBackResponse {
    /// Appointment the read-back was about.
    pub appointment_id: AppointmentId,
    /// Failed read-backs so far.
    pub attempts: u32,
    /// `true` once a human must take over.
    pub handoff_required: bool,
}

impl From<TeachBackOutcome> for TeachBackResponse {
    fn from(outcome: TeachBackOutcome) -> Self {
        Self {
            appointment_id: outcome.appointment_id,
            attempts: outcome.attempts,
            handoff_required: outcome.handoff_required,
        }
    }
}

/// Response body for lifecycle transitions.
#[derive(Debug, Serialize, ToSchema)]
pub struct TransitionResponse {
    /// The appointment after the change.
    pub appointment: Appointment,
    /// Ledger event recording the change.
    pub event_id: EventId,
}

impl From<Transition> for TransitionResponse {
    fn from(transition: Transition) -> Self {
        Self {
            event_id: transition.event.event().event_id,
            appointment: transition.appointment,
        }
    }
}
