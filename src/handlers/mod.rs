//! Task handlers and the registry that maps template ids to them.
//!
//! A handler receives the task payload and a [`HandlerContext`] with the
//! services it may touch. Every handler is idempotent: it re-reads current
//! state, treats "already done" as success, and routes each side effect
//! through the ledger under a deterministic key, so a redelivered task
//! changes nothing.

pub mod confirmation_check;
pub mod follow_up_contact;
pub mod hold_expiry;
pub mod no_show_rescue;
pub mod reconfirmation;

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::Instrument;
use utoipa::ToSchema;

use crate::domain::{
    AppendOutcome, AppointmentId, AppointmentStatus, Clock, EventId, NewEvent, TaskPayload,
};
use crate::error::SchedulerError;
use crate::service::collaborators::{CallbackTicketSink, Notifier};
use crate::service::{AppointmentService, EventLedger, TaskScheduler};

pub use confirmation_check::ConfirmationCheck;
pub use follow_up_contact::FollowUpContact;
pub use hold_expiry::HoldExpiry;
pub use no_show_rescue::NoShowRescue;
pub use reconfirmation::Reconfirmation;

/// Services available to handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Idempotency gate and audit log.
    pub ledger: EventLedger,
    /// Appointment lifecycle.
    pub appointments: Arc<AppointmentService>,
    /// For enqueuing follow-up work.
    pub scheduler: TaskScheduler,
    /// Outbound message delivery.
    pub notifier: Arc<dyn Notifier>,
    /// Human follow-up tickets.
    pub tickets: Arc<dyn CallbackTicketSink>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl HandlerContext {
    /// Channel to use for `payload`: its own, or the configured default.
    #[must_use]
    pub fn channel_for(&self, payload: &TaskPayload) -> String {
        payload
            .channel
            .clone()
            .unwrap_or_else(|| self.appointments.config().default_channel.clone())
    }
}

/// Coarse result of a handler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The deadline the task guards has not passed yet.
    NotYetDue,
    /// The appointment was expired.
    Expired,
    /// The appointment was marked no-show.
    NoShowRecorded,
    /// A message was sent.
    Sent,
    /// The effect had already happened.
    AlreadyApplied,
    /// The participant confirmed in time.
    AlreadyConfirmed,
    /// The visit was completed.
    AlreadyCompleted,
    /// The appointment is in a state the task does not act on.
    Inactive,
}

/// What a handler did. Stored as the task result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct HandlerOutcome {
    /// Coarse result.
    pub status: OutcomeStatus,
    /// `true` if this run changed state or sent something.
    pub applied: bool,
    /// Appointment acted on.
    pub appointment_id: Option<AppointmentId>,
    /// Ledger event that records the effect.
    pub event_id: Option<EventId>,
    /// Free-form detail.
    pub detail: Option<String>,
}

impl HandlerOutcome {
    /// An outcome that changed state.
    #[must_use]
    pub fn applied(
        status: OutcomeStatus,
        appointment_id: Option<AppointmentId>,
        event_id: EventId,
    ) -> Self {
        Self {
            status,
            applied: true,
            appointment_id,
            event_id: Some(event_id),
            detail: None,
        }
    }

    /// An outcome that changed nothing.
    #[must_use]
    pub fn noop(status: OutcomeStatus, appointment_id: Option<AppointmentId>) -> Self {
        Self {
            status,
            applied: false,
            appointment_id,
            event_id: None,
            detail: None,
        }
    }

    /// Builds an outcome from a gated ledger append.
    #[must_use]
    pub fn from_append(
        status: OutcomeStatus,
        appointment_id: Option<AppointmentId>,
        outcome: &AppendOutcome,
    ) -> Self {
        if outcome.is_new() {
            Self::applied(status, appointment_id, outcome.event().event_id)
        } else {
            Self {
                event_id: Some(outcome.event().event_id),
                ..Self::noop(OutcomeStatus::AlreadyApplied, appointment_id)
            }
        }
    }

    /// Attaches detail text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Outcome for an appointment whose status the task does not act on.
#[must_use]
pub fn settled(appointment_id: AppointmentId, status: AppointmentStatus) -> HandlerOutcome {
    let outcome = match status {
        AppointmentStatus::Confirmed => OutcomeStatus::AlreadyConfirmed,
        AppointmentStatus::Completed => OutcomeStatus::AlreadyCompleted,
        _ => OutcomeStatus::Inactive,
    };
    HandlerOutcome::noop(outcome, Some(appointment_id)).with_detail(status.as_str())
}

/// A handler for one task template.
#[async_trait]
pub trait TaskHandler: Send + Sync + Debug {
    /// Template id this handler serves.
    fn template_id(&self) -> &'static str;

    /// Runs the task.
    ///
    /// # Errors
    ///
    /// Any error marks the task failed. "Already applied" is never an error.
    async fn handle(
        &self,
        ctx: &HandlerContext,
        payload: &TaskPayload,
    ) -> Result<HandlerOutcome, SchedulerError>;
}

/// Runs an external effect once per idempotency key.
///
/// If the ledger already holds `event`'s key, the effect is not polled and
/// the existing row comes back as [`AppendOutcome::AlreadyApplied`].
/// Otherwise the effect runs and, on success, `event` is recorded with the
/// effect's JSON object merged into its payload. The key is also handed to
/// the collaborator, which can drop a duplicate if the process died between
/// the effect and the append.
///
/// # Errors
///
/// Returns the effect's error (nothing is recorded), or
/// [`SchedulerError::Internal`] if `event` carries no key.
pub async fn once<F>(
    ctx: &HandlerContext,
    event: NewEvent,
    effect: F,
) -> Result<AppendOutcome, SchedulerError>
where
    F: Future<Output = Result<serde_json::Value, SchedulerError>> + Send,
{
    let Some(key) = event.idempotency_key.as_deref() else {
        return Err(SchedulerError::Internal(
            "gated effect requires an idempotency key".to_string(),
        ));
    };
    if let Some(existing) = ctx.ledger.by_idempotency_key(key).await? {
        return Ok(AppendOutcome::AlreadyApplied(existing));
    }

    let detail = effect.await?;
    let mut event = event;
    if let (Some(payload), serde_json::Value::Object(extra)) = (event.payload.as_object_mut(), detail)
    {
        payload.extend(extra);
    }
    ctx.ledger.record(event).await
}

/// Maps template ids to handlers.
#[derive(Debug)]
pub struct HandlerRegistry {
    context: HandlerContext,
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(context: HandlerContext) -> Self {
        Self {
            context,
            handlers: HashMap::new(),
        }
    }

    /// Creates a registry with every built-in template.
    #[must_use]
    pub fn standard(context: HandlerContext) -> Self {
        let mut registry = Self::new(context);
        registry.register(Arc::new(ConfirmationCheck));
        registry.register(Arc::new(NoShowRescue));
        registry.register(Arc::new(HoldExpiry));
        registry.register(Arc::new(Reconfirmation));
        registry.register(Arc::new(FollowUpContact));
        registry
    }

    /// Adds a handler, returning the one it replaced.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.insert(handler.template_id(), handler)
    }

    /// Registered template ids, sorted.
    #[must_use]
    pub fn templates(&self) -> Vec<&'static str> {
        let mut ids: Vec<&'static str> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns `true` if a handler serves `template_id`.
    #[must_use]
    pub fn contains(&self, template_id: &str) -> bool {
        self.handlers.contains_key(template_id)
    }

    /// Services handed to every handler.
    #[must_use]
    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    /// Runs the handler registered for `template_id`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownTemplate`] if none is registered,
    /// [`SchedulerError::InvalidRequest`] for a blank idempotency key, or
    /// whatever the handler returns.
    pub async fn dispatch(
        &self,
        template_id: &str,
        payload: &TaskPayload,
    ) -> Result<HandlerOutcome, SchedulerError> {
        let handler = self
            .handlers
            .get(template_id)
            .ok_or_else(|| SchedulerError::UnknownTemplate(template_id.to_string()))?;
        if payload.idempotency_key.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "idempotency_key must not be empty".to_string(),
            ));
        }

        let span = tracing::info_span!(
            "task_handler",
            template_id,
            key = %payload.idempotency_key,
            appointment_id = ?payload.appointment_id,
        );
        let outcome = handler.handle(&self.context, payload).instrument(span).await?;
        tracing::debug!(
            template_id,
            status = ?outcome.status,
            applied = outcome.applied,
            "handler finished"
        );
        Ok(outcome)
    }
}
