//! Interfaces to the systems this service drives but does not own.
//!
//! Message delivery, slot availability and human follow-up ticketing are
//! provided by external systems. The traits here are the seams; the
//! `Logging*` implementations record intent through `tracing` and are what
//! the binary wires in by default. [`AuditTrailReader`] is the read side
//! offered to reporting consumers and is implemented by
//! [`crate::service::EventLedger`].

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{AppointmentId, LedgerEvent};
use crate::error::SchedulerError;

/// A rendered message for a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    /// Recipient participant.
    pub subject_id: String,
    /// Delivery channel (e.g. `"sms"`, `"voice"`).
    pub channel: String,
    /// Message template name.
    pub template: String,
    /// Rendered body.
    pub body: String,
    /// Appointment the message is about.
    pub appointment_id: Option<AppointmentId>,
    /// Key the provider can use to drop duplicate sends.
    pub idempotency_key: String,
}

/// A request for a human to call a participant back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackTicket {
    /// Participant to call.
    pub subject_id: String,
    /// Appointment that triggered the ticket.
    pub appointment_id: AppointmentId,
    /// Why a human is needed (e.g. `"no_show"`).
    pub reason: String,
    /// Key the sink can use to drop duplicate tickets.
    pub idempotency_key: String,
}

/// Sends messages on a named channel.
#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    /// Delivers `message`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::HandlerFailure`] if the provider rejects
    /// the message.
    async fn send(&self, message: &OutboundMessage) -> Result<(), SchedulerError>;
}

/// Answers whether a slot can be offered at all.
#[async_trait]
pub trait AvailabilityProvider: Send + Sync + Debug {
    /// Returns `true` if `resource_key` at `slot_start` is open for booking.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::HandlerFailure`] if the provider is
    /// unreachable.
    async fn is_available(
        &self,
        resource_key: &str,
        slot_start: DateTime<Utc>,
    ) -> Result<bool, SchedulerError>;
}

/// Opens follow-up tickets for staff.
#[async_trait]
pub trait CallbackTicketSink: Send + Sync + Debug {
    /// Creates a ticket and returns the sink's reference for it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::HandlerFailure`] if the ticket could not be
    /// created.
    async fn create_ticket(&self, ticket: &CallbackTicket) -> Result<String, SchedulerError>;
}

/// Read-only view over the event ledger.
#[async_trait]
pub trait AuditTrailReader: Send + Sync + Debug {
    /// Events about one participant, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn events_for_subject(&self, subject_id: &str)
    -> Result<Vec<LedgerEvent>, SchedulerError>;

    /// Events of one type, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn events_of_type(&self, event_type: &str) -> Result<Vec<LedgerEvent>, SchedulerError>;

    /// Events created in `[from, to)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEvent>, SchedulerError>;
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SchedulerError> {
        tracing::info!(
            subject_id = %message.subject_id,
            channel = %message.channel,
            template = %message.template,
            key = %message.idempotency_key,
            "outbound message"
        );
        Ok(())
    }
}

/// Availability provider that treats every slot as open.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAvailability;

#[async_trait]
impl AvailabilityProvider for OpenAvailability {
    async fn is_available(
        &self,
        _resource_key: &str,
        _slot_start: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        Ok(true)
    }
}

/// Ticket sink that only logs; the reference is the idempotency key.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTicketSink;

#[async_trait]
impl CallbackTicketSink for LoggingTicketSink {
    async fn create_ticket(&self, ticket: &CallbackTicket) -> Result<String, SchedulerError> {
        tracing::info!(
            subject_id = %ticket.subject_id,
            appointment_id = %ticket.appointment_id,
            reason = %ticket.reason,
            "callback ticket requested"
        );
        Ok(ticket.idempotency_key.clone())
    }
}
