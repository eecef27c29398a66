//! `reconfirmation`: reminds a participant of an upcoming visit.

use async_trait::async_trait;

use super::{HandlerContext, HandlerOutcome, OutcomeStatus, TaskHandler, once, settled};
use crate::domain::event::event_types;
use crate::domain::task::templates;
use crate::domain::{AppointmentStatus, NewEvent, TaskPayload};
use crate::error::SchedulerError;
use crate::service::collaborators::OutboundMessage;

/// Sends one reminder per task key while the visit is still on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconfirmation;

#[async_trait]
impl TaskHandler for Reconfirmation {
    fn template_id(&self) -> &'static str {
        templates::RECONFIRMATION
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

        let visit = appointment.visit_type.as_deref().unwrap_or("study");
        let when = appointment.slot_start.format("%Y-%m-%d %H:%M UTC");
        let body = if appointment.status == AppointmentStatus::Booked {
            format!("Reminder: your {visit} visit is on {when}. Reply YES to confirm.")
        } else {
            format!("Reminder: your {visit} visit is on {when}. See you there.")
        };
        let message = OutboundMessage {
            subject_id: appointment.owner_id.clone(),
            channel: ctx.channel_for(payload),
            template: templates::RECONFIRMATION.to_string(),
            body,
            appointment_id: Some(id),
            idempotency_key: payload.idempotency_key.clone(),
        };
        let event = NewEvent::new(appointment.owner_id.clone(), event_types::REMINDER_SENT)
            .keyed(payload.idempotency_key.clone())
            .for_appointment(id)
            .with_payload(serde_json::json!({
                "channel": message.channel,
                "offset_hours": payload.data.get("offset_hours"),
            }));

        let sent = once(ctx, event, async {
            ctx.notifier.send(&message).await?;
            Ok(serde_json::Value::Null)
        })
        .await?;
        Ok(HandlerOutcome::from_append(OutcomeStatus::Sent, Some(id), &sent))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::AppointmentId;
    use tokio_test::assert_ok;

    use crate::test_support::Harness;

    fn payload(id: AppointmentId, key: &str) -> TaskPayload {
        TaskPayload::for_appointment("A", id, key).with_data(serde_json::json!({"offset_hours": 24}))
    }

    #[tokio::test]
    async fn one_message_per_key() {
        let h = Harness::new();
        let booking = h.book("A").await;
        let id = booking.appointment_id;

        let first = assert_ok!(h.dispatch(templates::RECONFIRMATION, &payload(id, "r-24h")).await);
        assert_eq!(first.status, OutcomeStatus::Sent);
        let dup = assert_ok!(h.dispatch(templates::RECONFIRMATION, &payload(id, "r-24h")).await);
        assert_eq!(dup.status, OutcomeStatus::AlreadyApplied);
        let other = assert_ok!(h.dispatch(templates::RECONFIRMATION, &payload(id, "r-48h")).await);
        assert_eq!(other.status, OutcomeStatus::Sent);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.channel == "sms"));
        assert!(sent.iter().all(|m| m.body.contains("Reply YES")));
    }

    #[tokio::test]
    async fn ended_appointment_gets_no_reminder() {
        let h = Harness::new();
        let booking = h.book("A").await;
        let id = booking.appointment_id;
        assert_ok!(h.state.appointments.cancel(id, None).await);

        let outcome = assert_ok!(h.dispatch(templates::RECONFIRMATION, &payload(id, "r-1")).await);
        assert_eq!(outcome.status, OutcomeStatus::Inactive);
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_fails_the_task_without_recording() {
        let h = Harness::new();
        let booking = h.book("A").await;
        let id = booking.appointment_id;
        h.notifier.fail_next();

        let result = h.dispatch(templates::RECONFIRMATION, &payload(id, "r-9")).await;
        assert!(matches!(result, Err(SchedulerError::HandlerFailure(_))));
        let recorded = assert_ok!(h.state.ledger.by_idempotency_key("r-9").await);
        assert!(recorded.is_none());
    }
}
