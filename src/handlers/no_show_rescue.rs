//! `no_show_rescue`: records a missed visit and asks staff to call back.

use async_trait::async_trait;

use super::{HandlerContext, HandlerOutcome, OutcomeStatus, TaskHandler, once, settled};
use crate::domain::event::{event_types, keys};
use crate::domain::task::templates;
use crate::domain::{AppendOutcome, Appointment, AppointmentStatus, NewEvent, TaskPayload};
use crate::error::SchedulerError;
use crate::service::collaborators::CallbackTicket;

/// Runs at the scheduled visit time.
///
/// A visit still `booked` or `confirmed` once its start has passed gets one
/// callback ticket and becomes `no_show`. The ticket is opened first, so a
/// sink failure leaves the visit untouched and a redelivery retries both
/// steps. Any other status is settled, including a `no_show` recorded by
/// staff. Completed visits report `already_completed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoShowRescue;

#[async_trait]
impl TaskHandler for NoShowRescue {
    fn template_id(&self) -> &'static str {
        templates::NO_SHOW_RESCUE
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        payload: &TaskPayload,
    ) -> Result<HandlerOutcome, SchedulerError> {
        let id = payload.require_appointment()?;
        let appointment = ctx.appointments.get(id).await?;
        if !matches!(
            appointment.status,
            AppointmentStatus::Booked | AppointmentStatus::Confirmed
        ) {
            return Ok(settled(id, appointment.status));
        }
        if ctx.clock.now() < appointment.slot_start {
            return Ok(HandlerOutcome::noop(OutcomeStatus::NotYetDue, Some(id)));
        }

        let ticket = open_ticket(ctx, &appointment).await?;
        let transition = match ctx.appointments.mark_no_show(id).await {
            Ok(transition) => transition,
            Err(SchedulerError::InvalidTransition { from, .. }) => return Ok(settled(id, from)),
            Err(err) => return Err(err),
        };
        tracing::info!(
            appointment_id = %id,
            ticket_event = %ticket.event().event_id,
            "no-show recorded"
        );
        Ok(HandlerOutcome::applied(
            OutcomeStatus::NoShowRecorded,
            Some(id),
            transition.event.event().event_id,
        ))
    }
}

/// Opens the callback ticket for a no-show, once.
async fn open_ticket(
    ctx: &HandlerContext,
    appointment: &Appointment,
) -> Result<AppendOutcome, SchedulerError> {
    let key = keys::callback_ticket(appointment.appointment_id);
    let ticket = CallbackTicket {
        subject_id: appointment.owner_id.clone(),
        appointment_id: appointment.appointment_id,
        reason: "no_show".to_string(),
        idempotency_key: key.clone(),
    };
    let event = NewEvent::new(
        appointment.owner_id.clone(),
        event_types::CALLBACK_TICKET_CREATED,
    )
    .keyed(key)
    .for_appointment(appointment.appointment_id)
    .with_payload(serde_json::json!({ "reason": "no_show" }));

    once(ctx, event, async {
        let reference = ctx.tickets.create_ticket(&ticket).await?;
        Ok(serde_json::json!({ "ticket_ref": reference }))
    })
    .await
}
