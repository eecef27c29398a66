//! `confirmation_check`: expires a booking the participant never confirmed.

use async_trait::async_trait;

use super::{HandlerContext, HandlerOutcome, OutcomeStatus, TaskHandler, settled};
use crate::domain::event::keys;
use crate::domain::task::templates;
use crate::domain::{AppointmentStatus, TaskPayload};
use crate::error::SchedulerError;

/// Runs at the confirmation deadline of a booking.
///
/// Still `booked` after the deadline: the appointment expires and a
/// `follow_up_contact` task is enqueued. Before the deadline, or once the
/// participant confirmed or the appointment ended, nothing happens.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfirmationCheck;

#[async_trait]
impl TaskHandler for ConfirmationCheck {
    fn template_id(&self) -> &'static str {
        templates::CONFIRMATION_CHECK
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        payload: &TaskPayload,
    ) -> Result<HandlerOutcome, SchedulerError> {
        let id = payload.require_appointment()?;
        let appointment = ctx.appointments.get(id).await?;
        if appointment.status != AppointmentStatus::Booked {
            return Ok(settled(id, appointment.status));
        }

        let now = ctx.clock.now();
        if appointment.confirmation_due_at.is_some_and(|due| now < due) {
            return Ok(HandlerOutcome::noop(OutcomeStatus::NotYetDue, Some(id)));
        }

        let transition = match ctx.appointments.expire_unconfirmed(id).await {
            Ok(transition) => transition,
            Err(SchedulerError::InvalidTransition { from, .. }) => return Ok(settled(id, from)),
            Err(err) => return Err(err),
        };

        let follow_up = TaskPayload::for_appointment(
            appointment.owner_id.clone(),
            id,
            keys::task(templates::FOLLOW_UP_CONTACT, id),
        )
        .on_channel(ctx.channel_for(payload))
        .with_data(serde_json::json!({ "reason": "confirmation_expired" }));
        ctx.scheduler
            .enqueue(templates::FOLLOW_UP_CONTACT, now, follow_up)
            .await?;

        Ok(HandlerOutcome::applied(
            OutcomeStatus::Expired,
            Some(id),
            transition.event.event().event_id,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::AppointmentId;
    use crate::domain::event::event_types;
    use crate::test_support::Harness;
    use chrono::Duration;
    use tokio_test::assert_ok;

    fn payload(id: AppointmentId) -> TaskPayload {
        TaskPayload::for_appointment("A", id, keys::task(templates::CONFIRMATION_CHECK, id))
    }

    #[tokio::test]
    async fn before_the_deadline_nothing_happens() {
        let h = Harness::new();
        let booking = h.book("A").await;
        h.clock.advance(Duration::hours(11));

        let outcome = assert_ok!(
            h.dispatch(templates::CONFIRMATION_CHECK, &payload(booking.appointment_id))
                .await
        );
        assert_eq!(outcome.status, OutcomeStatus::NotYetDue);
        assert!(!outcome.applied);
        let appt = assert_ok!(h.state.appointments.get(booking.appointment_id).await);
        assert_eq!(appt.status, AppointmentStatus::Booked);
    }

    #[tokio::test]
    async fn after_the_deadline_expires_once_and_schedules_follow_up() {
        let h = Harness::new();
        let booking = h.book("A").await;
        let id = booking.appointment_id;
        h.clock.advance(Duration::hours(12));

        let first = assert_ok!(
            h.dispatch(templates::CONFIRMATION_CHECK, &payload(id))
                .await
        );
        assert_eq!(first.status, OutcomeStatus::Expired);
        assert!(first.applied);

        let again = assert_ok!(
            h.dispatch(templates::CONFIRMATION_CHECK, &payload(id))
                .await
        );
        assert!(!again.applied);
        assert_eq!(again.status, OutcomeStatus::Inactive);

        let appt = assert_ok!(h.state.appointments.get(id).await);
        assert_eq!(appt.status, AppointmentStatus::ExpiredUnconfirmed);
        let expired = assert_ok!(
            h.state
                .ledger
                .by_type(event_types::CONFIRMATION_EXPIRED)
                .await
        );
        assert_eq!(expired.len(), 1);

        let pending = assert_ok!(h.state.scheduler.list_pending().await);
        let follow_ups = pending
            .iter()
            .filter(|t| t.template_id == templates::FOLLOW_UP_CONTACT)
            .count();
        assert_eq!(follow_ups, 1);
    }

    #[tokio::test]
    async fn confirmed_booking_is_left_alone() {
        let h = Harness::new();
        let booking = h.book("A").await;
        let id = booking.appointment_id;
        assert_ok!(h.state.appointments.participant_confirms(id).await);
        h.clock.advance(Duration::hours(13));

        let outcome = assert_ok!(
            h.dispatch(templates::CONFIRMATION_CHECK, &payload(id))
                .await
        );
        assert_eq!(outcome.status, OutcomeStatus::AlreadyConfirmed);
        let appt = assert_ok!(h.state.appointments.get(id).await);
        assert_eq!(appt.status, AppointmentStatus::Confirmed);
    }

    #[tokio::test]
    async fn missing_appointment_is_not_found() {
        let h = Harness::new();
        let id = AppointmentId::new();
        let result = h
            .dispatch(templates::CONFIRMATION_CHECK, &payload(id))
            .await;
        assert!(matches!(result, Err(SchedulerError::AppointmentNotFound(_))));
    }
}
