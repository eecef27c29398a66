//! `hold_expiry`: releases a hold that was never booked.

use async_trait::async_trait;

use super::{HandlerContext, HandlerOutcome, OutcomeStatus, TaskHandler, settled};
use crate::domain::task::templates;
use crate::domain::{AppointmentStatus, TaskPayload};
use crate::error::SchedulerError;

/// Runs at a hold's expiry time.
#[derive(Debug, Clone, Copy, Default)]
pub struct HoldExpiry;

#[async_trait]
impl TaskHandler for HoldExpiry {
    fn template_id(&self) -> &'static str {
        templates::HOLD_EXPIRY
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        payload: &TaskPayload,
    ) -> Result<HandlerOutcome, SchedulerError> {
        let id = payload.require_appointment()?;
        let appointment = ctx.appointments.get(id).await?;
        if appointment.status != AppointmentStatus::Held {
            return Ok(settled(id, appointment.status));
        }
        if !appointment.hold_lapsed(ctx.clock.now()) {
            return Ok(HandlerOutcome::noop(OutcomeStatus::NotYetDue, Some(id)));
        }

        match ctx.appointments.expire_hold(id).await {
            Ok(transition) => Ok(HandlerOutcome::applied(
                OutcomeStatus::Expired,
                Some(id),
                transition.event.event().event_id,
            )),
            Err(SchedulerError::InvalidTransition { from, .. }) => Ok(settled(id, from)),
            Err(err) => Err(err),
        }
    }
}
