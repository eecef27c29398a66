//! Event ledger service: the idempotency gate for side effects.
//!
//! [`EventLedger::append`] is the only write. A repeated idempotency key
//! yields [`AppendOutcome::AlreadyApplied`] rather than an error, which is how
//! redelivered tasks find out their effect already happened. The query
//! methods are read-only projections for audit and reporting consumers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::collaborators::AuditTrailReader;
use crate::domain::{AppendOutcome, AppointmentId, Clock, LedgerEvent, NewEvent};
use crate::error::SchedulerError;
use crate::store::{EventFilter, LedgerStore};

/// Append-only, idempotency-keyed event log.
#[derive(Debug, Clone)]
pub struct EventLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl EventLedger {
    /// Creates a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Appends an event.
    ///
    /// With a key that was seen before, nothing is written and the original
    /// event comes back as [`AppendOutcome::AlreadyApplied`]. Without a key
    /// the event is always appended.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    pub async fn append(
        &self,
        subject_id: &str,
        event_type: &str,
        payload: serde_json::Value,
        idempotency_key: Option<&str>,
        related_appointment_id: Option<AppointmentId>,
    ) -> Result<AppendOutcome, SchedulerError> {
        let mut event = NewEvent::new(subject_id, event_type).with_payload(payload);
        event.idempotency_key = idempotency_key.map(str::to_string);
        event.related_appointment_id = related_appointment_id;
        self.record(event).await
    }

    /// Appends a pre-built event. Same semantics as [`Self::append`].
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    pub async fn record(&self, event: NewEvent) -> Result<AppendOutcome, SchedulerError> {
        let outcome = self.store.append(event, self.clock.now()).await?;
        match &outcome {
            AppendOutcome::Appended(e) => {
                tracing::debug!(
                    event_id = %e.event_id,
                    event_type = %e.event_type,
                    subject_id = %e.subject_id,
                    "ledger event appended"
                );
            }
            AppendOutcome::AlreadyApplied(e) => {
                tracing::debug!(
                    event_id = %e.event_id,
                    key = ?e.idempotency_key,
                    "ledger event already applied"
                );
            }
        }
        Ok(outcome)
    }

    /// Returns the event recorded under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    pub async fn by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<LedgerEvent>, SchedulerError> {
        self.store.find_by_key(key).await
    }

    /// Returns every event about `subject_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    pub async fn by_subject(&self, subject_id: &str) -> Result<Vec<LedgerEvent>, SchedulerError> {
        self.query(&EventFilter {
            subject_id: Some(subject_id.to_string()),
            ..EventFilter::default()
        })
        .await
    }

    /// Returns every event of `event_type`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    pub async fn by_type(&self, event_type: &str) -> Result<Vec<LedgerEvent>, SchedulerError> {
        self.query(&EventFilter {
            event_type: Some(event_type.to_string()),
            ..EventFilter::default()
        })
        .await
    }

    /// Returns events created in `[from, to)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    pub async fn in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEvent>, SchedulerError> {
        self.query(&EventFilter {
            from: Some(from),
            to: Some(to),
            ..EventFilter::default()
        })
        .await
    }

    /// Returns every event linked to an appointment, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    pub async fn for_appointment(
        &self,
        appointment_id: AppointmentId,
    ) -> Result<Vec<LedgerEvent>, SchedulerError> {
        self.query(&EventFilter {
            related_appointment_id: Some(appointment_id),
            ..EventFilter::default()
        })
        .await
    }

    /// Runs an arbitrary filter.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, SchedulerError> {
        self.store.query(filter).await
    }
}

#[async_trait]
impl AuditTrailReader for EventLedger {
    async fn events_for_subject(
        &self,
        subject_id: &str,
    ) -> Result<Vec<LedgerEvent>, SchedulerError> {
        self.by_subject(subject_id).await
    }

    async fn events_of_type(&self, event_type: &str) -> Result<Vec<LedgerEvent>, SchedulerError> {
        self.by_type(event_type).await
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEvent>, SchedulerError> {
        self.in_range(from, to).await
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::ManualClock;
    use crate::store::InMemoryStore;
    use chrono::Duration;
    use tokio_test::assert_ok;

    fn ledger_at(start: DateTime<Utc>) -> (EventLedger, Arc<ManualClock>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(start));
        let ledger = EventLedger::new(
            Arc::clone(&store) as Arc<dyn LedgerStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (ledger, clock, store)
    }

    #[tokio::test]
    async fn same_key_twice_persists_one_event() {
        let (ledger, _, store) = ledger_at(Utc::now());
        let payload = serde_json::json!({"channel": "sms"});

        let first = assert_ok!(
            ledger
                .append("p-1", "reminder_sent", payload.clone(), Some("K"), None)
                .await
        );
        let second = assert_ok!(
            ledger
                .append("p-1", "reminder_sent", payload, Some("K"), None)
                .await
        );

        assert!(first.is_new());
        let AppendOutcome::AlreadyApplied(dup) = &second else {
            panic!("second append must be already-applied");
        };
        assert_eq!(dup.event_id, first.event().event_id);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn unkeyed_appends_never_collapse() {
        let (ledger, _, store) = ledger_at(Utc::now());
        for _ in 0..2 {
            assert_ok!(
                ledger
                    .append("p-1", "teach_back_failed", serde_json::json!({}), None, None)
                    .await
            );
        }
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn projections_filter_by_subject_type_and_range() {
        let start = Utc::now();
        let (ledger, clock, _) = ledger_at(start);
        let appt = AppointmentId::new();

        assert_ok!(ledger.append("p-1", "hold_created", serde_json::json!({}), None, Some(appt)).await);
        clock.advance(Duration::hours(1));
        assert_ok!(ledger.append("p-2", "hold_created", serde_json::json!({}), None, None).await);
        clock.advance(Duration::hours(1));
        assert_ok!(ledger.append("p-1", "no_show", serde_json::json!({}), None, Some(appt)).await);

        assert_eq!(assert_ok!(ledger.by_subject("p-1").await).len(), 2);
        assert_eq!(assert_ok!(ledger.by_type("hold_created").await).len(), 2);
        assert_eq!(assert_ok!(ledger.for_appointment(appt).await).len(), 2);

        let window = assert_ok!(
            ledger
                .in_range(start + Duration::minutes(30), start + Duration::minutes(90))
                .await
        );
        assert_eq!(window.len(), 1);
        assert_eq!(window.first().map(|e| e.subject_id.as_str()), Some("p-2"));
    }

    #[tokio::test]
    async fn audit_reader_sees_the_same_rows() {
        let (ledger, _, _) = ledger_at(Utc::now());
        assert_ok!(
            ledger
                .append("p-9", "reminder_sent", serde_json::json!({}), Some("r-1"), None)
                .await
        );
        let reader: Arc<dyn AuditTrailReader> = Arc::new(ledger.clone());
        let rows = assert_ok!(reader.events_for_subject("p-9").await);
        assert_eq!(rows.len(), 1);
        let found = assert_ok!(ledger.by_idempotency_key("r-1").await);
        assert_eq!(found.map(|e| e.event_id), rows.first().map(|e| e.event_id));
    }
}
