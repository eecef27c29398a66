//! Ledger events and the idempotent append outcome.
//!
//! A [`LedgerEvent`] is immutable once written. The optional idempotency key
//! is globally unique: appending a second event with the same key returns
//! [`AppendOutcome::AlreadyApplied`] with the row that won.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{AppointmentId, EventId};

/// Event type tags written by the appointment lifecycle and task handlers.
pub mod event_types {
    /// A provisional hold was placed on a slot.
    pub const HOLD_CREATED: &str = "hold_created";
    /// A hold lapsed before it was turned into a booking.
    pub const HOLD_EXPIRED: &str = "hold_expired";
    /// A slot was booked (from a hold or directly).
    pub const APPOINTMENT_BOOKED: &str = "appointment_booked";
    /// The participant confirmed a booking.
    pub const APPOINTMENT_CONFIRMED: &str = "appointment_confirmed";
    /// The confirmation deadline passed without a confirmation.
    pub const CONFIRMATION_EXPIRED: &str = "confirmation_expired";
    /// The visit took place.
    pub const APPOINTMENT_COMPLETED: &str = "appointment_completed";
    /// The participant did not attend.
    pub const NO_SHOW: &str = "no_show";
    /// The appointment was cancelled.
    pub const APPOINTMENT_CANCELLED: &str = "appointment_cancelled";
    /// A verbal read-back of appointment details failed.
    pub const TEACH_BACK_FAILED: &str = "teach_back_failed";
    /// A callback ticket was opened for human follow-up.
    pub const CALLBACK_TICKET_CREATED: &str = "callback_ticket_created";
    /// A reconfirmation reminder was sent.
    pub const REMINDER_SENT: &str = "reminder_sent";
    /// A follow-up contact message was sent.
    pub const FOLLOW_UP_SENT: &str = "follow_up_sent";
}

/// A persisted, immutable ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LedgerEvent {
    /// Unique event identifier.
    pub event_id: EventId,
    /// Participant or resource owner the event is about.
    pub subject_id: String,
    /// Event type discriminator (see [`event_types`]).
    pub event_type: String,
    /// Appointment the event relates to, if any.
    pub related_appointment_id: Option<AppointmentId>,
    /// Deduplication key, unique across the ledger when present.
    pub idempotency_key: Option<String>,
    /// Opaque structured payload.
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    /// Server-side creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// An event that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Participant or resource owner the event is about.
    pub subject_id: String,
    /// Event type discriminator.
    pub event_type: String,
    /// Appointment the event relates to, if any.
    pub related_appointment_id: Option<AppointmentId>,
    /// Deduplication key.
    pub idempotency_key: Option<String>,
    /// Opaque structured payload.
    pub payload: serde_json::Value,
}

impl NewEvent {
    /// Creates an unkeyed event with an empty object payload.
    #[must_use]
    pub fn new(subject_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            event_type: event_type.into(),
            related_appointment_id: None,
            idempotency_key: None,
            payload: serde_json::json!({}),
        }
    }

    /// Attaches an idempotency key.
    #[must_use]
    pub fn keyed(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Links the event to an appointment.
    #[must_use]
    pub fn for_appointment(mut self, id: AppointmentId) -> Self {
        self.related_appointment_id = Some(id);
        self
    }

    /// Replaces the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Materialises the event with a fresh id and the given timestamp.
    #[must_use]
    pub fn into_event(self, created_at: DateTime<Utc>) -> LedgerEvent {
        LedgerEvent {
            event_id: EventId::new(),
            subject_id: self.subject_id,
            event_type: self.event_type,
            related_appointment_id: self.related_appointment_id,
            idempotency_key: self.idempotency_key,
            payload: self.payload,
            created_at,
        }
    }
}

/// Result of an append to the ledger.
///
/// A duplicate key is not a failure: it is the expected outcome of a
/// redelivered task, and carries the event that was written first.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// A new row was written.
    Appended(LedgerEvent),
    /// A row with the same idempotency key already existed; nothing written.
    AlreadyApplied(LedgerEvent),
}

impl AppendOutcome {
    /// Returns the event that now represents this logical effect.
    #[must_use]
    pub fn event(&self) -> &LedgerEvent {
        match self {
            Self::Appended(event) | Self::AlreadyApplied(event) => event,
        }
    }

    /// Consumes the outcome, returning the event.
    #[must_use]
    pub fn into_event(self) -> LedgerEvent {
        match self {
            Self::Appended(event) | Self::AlreadyApplied(event) => event,
        }
    }

    /// Returns `true` if this call created the row.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Appended(_))
    }
}

/// Deterministic idempotency keys for lifecycle side effects.
///
/// Redelivering the same logical operation always produces the same key,
/// so the ledger records it once.
pub mod keys {
    use crate::domain::AppointmentId;

    /// Key for the hold-created event.
    #[must_use]
    pub fn hold_created(id: AppointmentId) -> String {
        format!("hold-created-{id}")
    }

    /// Key for the hold-expiry transition.
    #[must_use]
    pub fn hold_expire(id: AppointmentId) -> String {
        format!("hold-expire-{id}")
    }

    /// Key for the booking transition.
    #[must_use]
    pub fn booked(id: AppointmentId) -> String {
        format!("appointment-booked-{id}")
    }

    /// Key for the participant confirmation.
    #[must_use]
    pub fn confirmed(id: AppointmentId) -> String {
        format!("appointment-confirmed-{id}")
    }

    /// Key for the confirmation-deadline expiry.
    #[must_use]
    pub fn confirmation_expire(id: AppointmentId) -> String {
        format!("confirmation-expire-{id}")
    }

    /// Key for the completion transition.
    #[must_use]
    pub fn completed(id: AppointmentId) -> String {
        format!("appointment-completed-{id}")
    }

    /// Key for the no-show transition.
    #[must_use]
    pub fn no_show(id: AppointmentId) -> String {
        format!("no-show-{id}")
    }

    /// Key for the no-show callback ticket.
    #[must_use]
    pub fn callback_ticket(id: AppointmentId) -> String {
        format!("callback-ticket-{id}")
    }

    /// Key for the cancellation.
    #[must_use]
    pub fn cancelled(id: AppointmentId) -> String {
        format!("appointment-cancelled-{id}")
    }

    /// Key for a task enqueued by the lifecycle, scoped by template.
    #[must_use]
    pub fn task(template_id: &str, id: AppointmentId) -> String {
        format!("{template_id}-{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_builder_sets_fields() {
        let id = AppointmentId::new();
        let event = NewEvent::new("participant-1", event_types::NO_SHOW)
            .keyed(keys::no_show(id))
            .for_appointment(id)
            .into_event(Utc::now());
        assert_eq!(event.event_type, "no_show");
        assert_eq!(event.related_appointment_id, Some(id));
        assert_eq!(event.idempotency_key, Some(format!("no-show-{id}")));
    }

    #[test]
    fn outcome_exposes_event_either_way() {
        let event = NewEvent::new("p", "t").into_event(Utc::now());
        let fresh = AppendOutcome::Appended(event.clone());
        let dup = AppendOutcome::AlreadyApplied(event.clone());
        assert!(fresh.is_new());
        assert!(!dup.is_new());
        assert_eq!(fresh.event(), dup.event());
    }

    #[test]
    fn keys_are_deterministic() {
        let id = AppointmentId::new();
        assert_eq!(keys::confirmation_expire(id), keys::confirmation_expire(id));
        assert_eq!(
            keys::task("confirmation_check", id),
            format!("confirmation_check-{id}")
        );
    }
}
