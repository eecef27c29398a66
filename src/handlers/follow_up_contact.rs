//! `follow_up_contact`: reaches out after a booking lapsed.

use async_trait::async_trait;

use super::{HandlerContext, HandlerOutcome, OutcomeStatus, TaskHandler, once};
use crate::domain::event::event_types;
use crate::domain::task::templates;
use crate::domain::{NewEvent, TaskPayload};
use crate::error::SchedulerError;
use crate::service::collaborators::OutboundMessage;

/// Sends one follow-up message per task key.
///
/// The appointment reference is optional; when present it must exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct FollowUpContact;

#[async_trait]
impl TaskHandler for FollowUpContact {
    fn template_id(&self) -> &'static str {
        templates::FOLLOW_UP_CONTACT
    }

    async fn handle(
        &self,
        ctx: &HandlerContext,
        payload: &TaskPayload,
    ) -> Result<HandlerOutcome, SchedulerError> {
        if let Some(id) = payload.appointment_id {
            ctx.appointments.get(id).await?;
        }

        let reason = payload
            .data
            .get("reason")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("follow_up");
        let message = OutboundMessage {
            subject_id: payload.subject_id.clone(),
            channel: ctx.channel_for(payload),
            template: templates::FOLLOW_UP_CONTACT.to_string(),
            body: "We missed your confirmation. Reply to pick a new visit time.".to_string(),
            appointment_id: payload.appointment_id,
            idempotency_key: payload.idempotency_key.clone(),
        };
        let mut event = NewEvent::new(payload.subject_id.clone(), event_types::FOLLOW_UP_SENT)
            .keyed(payload.idempotency_key.clone())
            .with_payload(serde_json::json!({
                "channel": message.channel,
                "reason": reason,
            }));
        event.related_appointment_id = payload.appointment_id;

        let sent = once(ctx, event, async {
            ctx.notifier.send(&message).await?;
            Ok(serde_json::Value::Null)
        })
        .await?;
        Ok(HandlerOutcome::from_append(
            OutcomeStatus::Sent,
            payload.appointment_id,
            &sent,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn sends_once_without_an_appointment() {
        let h = Harness::new();
        let payload = TaskPayload {
            subject_id: "participant-4".to_string(),
            appointment_id: None,
            channel: Some("voice".to_string()),
            idempotency_key: "follow-up-4".to_string(),
            data: serde_json::json!({"reason": "callback_requested"}),
        };

        let first = assert_ok!(h.dispatch(templates::FOLLOW_UP_CONTACT, &payload).await);
        assert_eq!(first.status, OutcomeStatus::Sent);
        let second = assert_ok!(h.dispatch(templates::FOLLOW_UP_CONTACT, &payload).await);
        assert_eq!(second.status, OutcomeStatus::AlreadyApplied);

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent.first().map(|m| m.channel.as_str()), Some("voice"));

        let Ok(Some(event)) = h.state.ledger.by_idempotency_key("follow-up-4").await else {
            panic!("follow-up must be recorded");
        };
        assert_eq!(event.event_type, event_types::FOLLOW_UP_SENT);
        assert_eq!(
            event.payload.get("reason"),
            Some(&serde_json::json!("callback_requested"))
        );
    }

    #[tokio::test]
    async fn unknown_appointment_is_not_found() {
        let h = Harness::new();
        let payload =
            TaskPayload::for_appointment("p", crate::domain::AppointmentId::new(), "follow-up-x");
        let result = h.dispatch(templates::FOLLOW_UP_CONTACT, &payload).await;
        assert!(matches!(result, Err(SchedulerError::AppointmentNotFound(_))));
        assert!(h.notifier.sent().is_empty());
    }
}
