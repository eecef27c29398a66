//! Appointment lifecycle service.
//!
//! Every mutation follows the same pattern: load the record, compute the
//! next state with [`Appointment::transitioned`], then write it with a
//! compare-and-set on the prior status together with its ledger event. A
//! concurrent change makes the CAS miss and the operation re-evaluates
//! against the fresh record, so an action that is no longer legal surfaces
//! as `invalid_transition` rather than overwriting someone else's change.
//!
//! Booking also schedules the follow-up tasks (confirmation check,
//! reconfirmation reminders, no-show rescue) that drive the rest of the
//! lifecycle through the dispatcher.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::collaborators::AvailabilityProvider;
use super::ledger::EventLedger;
use super::scheduler::TaskScheduler;
use crate::config::LifecycleConfig;
use crate::domain::event::{event_types, keys};
use crate::domain::task::templates;
use crate::domain::{
    AppendOutcome, Appointment, AppointmentId, Clock, LifecycleAction, NewEvent, TaskPayload,
};
use crate::error::SchedulerError;
use crate::store::{AppointmentStore, CasOutcome, SlotClaim};

/// Request to place a provisional hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldRequest {
    /// Participant placing the hold.
    pub owner_id: String,
    /// Slot identity.
    pub resource_key: String,
    /// Visit start.
    pub slot_start: DateTime<Utc>,
}

/// Request to book a slot without a prior hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    /// Participant booking the slot.
    pub owner_id: String,
    /// Slot identity.
    pub resource_key: String,
    /// Visit start.
    pub slot_start: DateTime<Utc>,
    /// Visit type.
    pub visit_type: Option<String>,
}

/// An applied lifecycle change and the ledger row that records it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// The appointment after the change.
    pub appointment: Appointment,
    /// The ledger event written with the change.
    pub event: AppendOutcome,
}

/// Result of recording a verbal read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeachBackOutcome {
    /// Appointment the read-back was about.
    pub appointment_id: AppointmentId,
    /// Failed read-backs so far.
    pub attempts: u32,
    /// `true` once the failure cap is reached and a human must take over.
    pub handoff_required: bool,
}

/// Drives appointments through their lifecycle.
#[derive(Debug)]
pub struct AppointmentService {
    store: Arc<dyn AppointmentStore>,
    ledger: EventLedger,
    scheduler: TaskScheduler,
    availability: Arc<dyn AvailabilityProvider>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl AppointmentService {
    /// Creates a new `AppointmentService`.
    #[must_use]
    pub fn new(
        store: Arc<dyn AppointmentStore>,
        ledger: EventLedger,
        scheduler: TaskScheduler,
        availability: Arc<dyn AvailabilityProvider>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            scheduler,
            availability,
            clock,
            config,
        }
    }

    /// Returns the lifecycle settings in force.
    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Fetches an appointment.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AppointmentNotFound`] if it does not exist.
    pub async fn get(&self, id: AppointmentId) -> Result<Appointment, SchedulerError> {
        self.store
            .get(id)
            .await?
            .ok_or(SchedulerError::AppointmentNotFound(id))
    }

    /// Places a hold on a free slot and schedules its expiry.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::InvalidRequest`] for blank fields or a past slot.
    /// - [`SchedulerError::SlotUnavailable`] if availability says no.
    /// - [`SchedulerError::SlotTaken`] if another active appointment holds
    ///   the slot.
    pub async fn create_hold(&self, request: HoldRequest) -> Result<Appointment, SchedulerError> {
        let now = self.clock.now();
        self.check_slot(&request.owner_id, &request.resource_key, request.slot_start, now)
            .await?;

        let hold = Appointment::new_hold(
            request.owner_id,
            request.resource_key,
            request.slot_start,
            shifted(now, self.config.hold_ttl(), "hold_ttl_minutes")?,
            now,
        );
        let event = NewEvent::new(hold.owner_id.clone(), event_types::HOLD_CREATED)
            .keyed(keys::hold_created(hold.appointment_id))
            .for_appointment(hold.appointment_id)
            .with_payload(serde_json::json!({
                "resource_key": hold.resource_key,
                "slot_start": hold.slot_start,
                "held_until": hold.slot_held_until,
            }));
        self.insert(&hold, event, now).await?;

        if let Some(held_until) = hold.slot_held_until {
            self.enqueue_for(&hold, templates::HOLD_EXPIRY, held_until, None)
                .await?;
        }
        tracing::info!(
            appointment_id = %hold.appointment_id,
            resource_key = %hold.resource_key,
            "hold created"
        );
        Ok(hold)
    }

    /// Turns a hold into a booking and schedules its follow-up tasks.
    ///
    /// A hold whose expiry has passed is expired on the spot instead.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::HoldExpired`] if the hold had lapsed.
    /// - [`SchedulerError::InvalidTransition`] if the appointment is not held.
    /// - [`SchedulerError::SlotTaken`] if the slot was claimed meanwhile.
    pub async fn confirm_booking(
        &self,
        id: AppointmentId,
        visit_type: Option<String>,
    ) -> Result<Transition, SchedulerError> {
        let current = self.get(id).await?;
        if current.hold_lapsed(self.clock.now()) {
            self.expire_hold(id).await?;
            return Err(SchedulerError::HoldExpired(id));
        }

        let window = self.config.confirmation_window();
        shifted(self.clock.now(), window, "confirmation_window_hours")?;
        let transition = self
            .apply(
                id,
                LifecycleAction::Book,
                |next, now| {
                    if visit_type.is_some() {
                        next.visit_type.clone_from(&visit_type);
                    }
                    next.confirmation_due_at =
                        window.and_then(|window| now.checked_add_signed(window));
                },
                booked_event,
            )
            .await?;
        self.schedule_booking_tasks(&transition.appointment).await?;
        Ok(transition)
    }

    /// Books a free slot directly, without a hold.
    ///
    /// # Errors
    ///
    /// Same as [`Self::create_hold`].
    pub async fn book_direct(&self, request: BookingRequest) -> Result<Appointment, SchedulerError> {
        let now = self.clock.now();
        self.check_slot(&request.owner_id, &request.resource_key, request.slot_start, now)
            .await?;

        let booking = Appointment::new_booking(
            request.owner_id,
            request.resource_key,
            request.slot_start,
            request.visit_type,
            shifted(
                now,
                self.config.confirmation_window(),
                "confirmation_window_hours",
            )?,
            now,
        );
        self.insert(&booking, booked_event(&booking), now).await?;
        self.schedule_booking_tasks(&booking).await?;
        tracing::info!(
            appointment_id = %booking.appointment_id,
            resource_key = %booking.resource_key,
            "appointment booked"
        );
        Ok(booking)
    }

    /// Records the participant's confirmation of a booking.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] unless the appointment
    /// is `booked`.
    pub async fn participant_confirms(
        &self,
        id: AppointmentId,
    ) -> Result<Transition, SchedulerError> {
        self.apply(id, LifecycleAction::Confirm, |_, _| {}, |appt| {
            lifecycle_event(appt, event_types::APPOINTMENT_CONFIRMED, keys::confirmed(id))
        })
        .await
    }

    /// Releases a hold.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] unless the appointment
    /// is `held`.
    pub async fn expire_hold(&self, id: AppointmentId) -> Result<Transition, SchedulerError> {
        self.apply(id, LifecycleAction::ExpireHold, |_, _| {}, |appt| {
            lifecycle_event(appt, event_types::HOLD_EXPIRED, keys::hold_expire(id)).with_payload(
                serde_json::json!({
                    "resource_key": appt.resource_key,
                    "reason": "lapsed",
                }),
            )
        })
        .await
    }

    /// Expires a booking whose confirmation window passed.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] unless the appointment
    /// is `booked`.
    pub async fn expire_unconfirmed(&self, id: AppointmentId) -> Result<Transition, SchedulerError> {
        self.apply(id, LifecycleAction::ExpireUnconfirmed, |_, _| {}, |appt| {
            lifecycle_event(
                appt,
                event_types::CONFIRMATION_EXPIRED,
                keys::confirmation_expire(id),
            )
            .with_payload(serde_json::json!({
                "confirmation_due_at": appt.confirmation_due_at,
            }))
        })
        .await
    }

    /// Marks the visit as attended.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] unless the appointment
    /// is `booked` or `confirmed`.
    pub async fn mark_completed(&self, id: AppointmentId) -> Result<Transition, SchedulerError> {
        self.apply(id, LifecycleAction::Complete, |_, _| {}, |appt| {
            lifecycle_event(appt, event_types::APPOINTMENT_COMPLETED, keys::completed(id))
        })
        .await
    }

    /// Marks the visit as missed.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] unless the appointment
    /// is `booked` or `confirmed`.
    pub async fn mark_no_show(&self, id: AppointmentId) -> Result<Transition, SchedulerError> {
        self.apply(id, LifecycleAction::MarkNoShow, |_, _| {}, |appt| {
            lifecycle_event(appt, event_types::NO_SHOW, keys::no_show(id))
        })
        .await
    }

    /// Cancels an active appointment, freeing its slot.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] if the appointment is
    /// already terminal.
    pub async fn cancel(
        &self,
        id: AppointmentId,
        reason: Option<String>,
    ) -> Result<Transition, SchedulerError> {
        self.apply(id, LifecycleAction::Cancel, |_, _| {}, |appt| {
            lifecycle_event(appt, event_types::APPOINTMENT_CANCELLED, keys::cancelled(id))
                .with_payload(serde_json::json!({ "reason": reason }))
        })
        .await
    }

    /// Records the result of a verbal read-back of the appointment details.
    ///
    /// A failure increments the attempt counter up to the configured cap.
    /// With an idempotency key, a repeated report of the same failure is
    /// counted once. The status never changes.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AppointmentNotFound`] if the appointment
    /// does not exist, or [`SchedulerError::InvalidRequest`] if it is no
    /// longer active.
    pub async fn record_teach_back(
        &self,
        id: AppointmentId,
        passed: bool,
        idempotency_key: Option<&str>,
    ) -> Result<TeachBackOutcome, SchedulerError> {
        let current = self.get(id).await?;
        if !current.status.is_active() {
            return Err(SchedulerError::InvalidRequest(format!(
                "appointment {id} is {}; teach-back only applies to active appointments",
                current.status
            )));
        }
        let cap = self.config.teach_back_max_failures;
        if passed {
            return Ok(self.teach_back_outcome(&current));
        }

        let mut event = NewEvent::new(current.owner_id.clone(), event_types::TEACH_BACK_FAILED)
            .for_appointment(id)
            .with_payload(serde_json::json!({
                "attempt": current.teach_back_attempts.saturating_add(1),
            }));
        if let Some(key) = idempotency_key {
            event = event.keyed(key);
        }
        if !self.ledger.record(event).await?.is_new() {
            return Ok(self.teach_back_outcome(&current));
        }

        let updated = self
            .store
            .increment_teach_back(id, cap, self.clock.now())
            .await?;
        let outcome = self.teach_back_outcome(&updated);
        if outcome.handoff_required {
            tracing::warn!(
                appointment_id = %id,
                attempts = outcome.attempts,
                "teach-back failed repeatedly; human handoff required"
            );
        }
        Ok(outcome)
    }

    fn teach_back_outcome(&self, appointment: &Appointment) -> TeachBackOutcome {
        TeachBackOutcome {
            appointment_id: appointment.appointment_id,
            attempts: appointment.teach_back_attempts,
            handoff_required: appointment.teach_back_attempts
                >= self.config.teach_back_max_failures,
        }
    }

    /// Validates a new claim and asks the availability provider about it.
    async fn check_slot(
        &self,
        owner_id: &str,
        resource_key: &str,
        slot_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        if owner_id.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "owner_id must not be empty".to_string(),
            ));
        }
        if resource_key.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "resource_key must not be empty".to_string(),
            ));
        }
        if slot_start <= now {
            return Err(SchedulerError::InvalidRequest(
                "slot_start must be in the future".to_string(),
            ));
        }
        if !self
            .availability
            .is_available(resource_key, slot_start)
            .await?
        {
            return Err(SchedulerError::SlotUnavailable(resource_key.to_string()));
        }
        Ok(())
    }

    async fn insert(
        &self,
        appointment: &Appointment,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        match self.store.insert_exclusive(appointment, event, now).await? {
            SlotClaim::Claimed { reclaimed, .. } => {
                log_reclaimed(&reclaimed);
                Ok(())
            }
            SlotClaim::Taken { holder } => {
                tracing::info!(
                    resource_key = %appointment.resource_key,
                    holder = %holder,
                    "slot already taken"
                );
                Err(SchedulerError::SlotTaken {
                    resource_key: appointment.resource_key.clone(),
                })
            }
        }
    }

    /// Applies `action` with compare-and-set, retrying on a concurrent change.
    ///
    /// The retry terminates because the status graph is acyclic: each miss
    /// means the status moved forward, and eventually the action is either
    /// applied or illegal.
    async fn apply<P, E>(
        &self,
        id: AppointmentId,
        action: LifecycleAction,
        prepare: P,
        record_for: E,
    ) -> Result<Transition, SchedulerError>
    where
        P: Fn(&mut Appointment, DateTime<Utc>) + Send + Sync,
        E: Fn(&Appointment) -> NewEvent + Send + Sync,
    {
        loop {
            let current = self.get(id).await?;
            let now = self.clock.now();
            let mut next = current.transitioned(action, now)?;
            prepare(&mut next, now);
            let record = record_for(&next);

            match self
                .store
                .compare_and_set(&next, current.status, Some(record), now)
                .await?
            {
                CasOutcome::Applied {
                    appointment,
                    event,
                    reclaimed,
                } => {
                    log_reclaimed(&reclaimed);
                    let event = event.ok_or_else(|| {
                        SchedulerError::Internal("transition recorded no ledger event".to_string())
                    })?;
                    tracing::info!(
                        appointment_id = %id,
                        action = %action,
                        from = %current.status,
                        to = %next.status,
                        "appointment transitioned"
                    );
                    return Ok(Transition { appointment, event });
                }
                CasOutcome::StatusChanged(latest) => {
                    tracing::debug!(
                        appointment_id = %id,
                        expected = %current.status,
                        found = %latest.status,
                        "status changed concurrently; re-evaluating"
                    );
                }
                CasOutcome::SlotTaken { holder } => {
                    tracing::info!(
                        appointment_id = %id,
                        holder = %holder,
                        "slot claimed by another appointment"
                    );
                    return Err(SchedulerError::SlotTaken {
                        resource_key: next.resource_key,
                    });
                }
            }
        }
    }

    /// Enqueues the confirmation check, reminders and no-show rescue.
    async fn schedule_booking_tasks(&self, booking: &Appointment) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        let confirm_by = match booking.confirmation_due_at {
            Some(due) => due,
            None => shifted(
                now,
                self.config.confirmation_window(),
                "confirmation_window_hours",
            )?,
        };
        self.enqueue_for(booking, templates::CONFIRMATION_CHECK, confirm_by, None)
            .await?;

        for &hours in &self.config.reminder_offsets_hours {
            let Some(at) = Duration::try_hours(hours)
                .and_then(|offset| booking.slot_start.checked_sub_signed(offset))
            else {
                tracing::warn!(hours, "reminder offset out of range; skipped");
                continue;
            };
            if at <= now {
                continue;
            }
            let key = format!(
                "{}-{hours}h",
                keys::task(templates::RECONFIRMATION, booking.appointment_id)
            );
            self.enqueue_for(
                booking,
                templates::RECONFIRMATION,
                at,
                Some((key, serde_json::json!({ "offset_hours": hours }))),
            )
            .await?;
        }

        self.enqueue_for(booking, templates::NO_SHOW_RESCUE, booking.slot_start, None)
            .await
    }

    async fn enqueue_for(
        &self,
        appointment: &Appointment,
        template_id: &str,
        due_at: DateTime<Utc>,
        keyed_data: Option<(String, serde_json::Value)>,
    ) -> Result<(), SchedulerError> {
        let (key, data) = keyed_data.unwrap_or_else(|| {
            (
                keys::task(template_id, appointment.appointment_id),
                serde_json::Value::Null,
            )
        });
        let payload = TaskPayload::for_appointment(
            appointment.owner_id.clone(),
            appointment.appointment_id,
            key,
        )
        .on_channel(self.config.default_channel.clone())
        .with_data(data);
        self.scheduler.enqueue(template_id, due_at, payload).await?;
        Ok(())
    }
}

/// `from + span`, failing on a setting that does not fit a timestamp.
fn shifted(
    from: DateTime<Utc>,
    span: Option<Duration>,
    setting: &str,
) -> Result<DateTime<Utc>, SchedulerError> {
    span.and_then(|span| from.checked_add_signed(span))
        .ok_or_else(|| SchedulerError::Internal(format!("lifecycle setting {setting} out of range")))
}

fn lifecycle_event(appointment: &Appointment, event_type: &str, key: String) -> NewEvent {
    NewEvent::new(appointment.owner_id.clone(), event_type)
        .keyed(key)
        .for_appointment(appointment.appointment_id)
}

fn booked_event(appointment: &Appointment) -> NewEvent {
    lifecycle_event(
        appointment,
        event_types::APPOINTMENT_BOOKED,
        keys::booked(appointment.appointment_id),
    )
    .with_payload(serde_json::json!({
        "resource_key": appointment.resource_key,
        "slot_start": appointment.slot_start,
        "visit_type": appointment.visit_type,
        "confirmation_due_at": appointment.confirmation_due_at,
    }))
}

fn log_reclaimed(reclaimed: &[Appointment]) {
    for hold in reclaimed {
        tracing::info!(
            appointment_id = %hold.appointment_id,
            resource_key = %hold.resource_key,
            "lapsed hold reclaimed"
        );
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{AppointmentStatus, ManualClock, TaskStatus};
    use crate::service::collaborators::OpenAvailability;
    use crate::store::{InMemoryStore, LedgerStore, TaskStore};
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    const SLOT: &str = "trial-7/site-2/2026-11-02T09:00";

    #[derive(Debug)]
    struct ClosedAvailability;

    #[async_trait]
    impl AvailabilityProvider for ClosedAvailability {
        async fn is_available(
            &self,
            _resource_key: &str,
            _slot_start: DateTime<Utc>,
        ) -> Result<bool, SchedulerError> {
            Ok(false)
        }
    }

    struct Fixture {
        service: Arc<AppointmentService>,
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        ledger: EventLedger,
        scheduler: TaskScheduler,
    }

    fn fixture_with(availability: Arc<dyn AvailabilityProvider>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let Some(start) = DateTime::from_timestamp(1_793_000_000, 0) else {
            panic!("valid timestamp");
        };
        let clock = Arc::new(ManualClock::new(start));
        let dyn_clock = Arc::clone(&clock) as Arc<dyn Clock>;
        let ledger = EventLedger::new(
            Arc::clone(&store) as Arc<dyn LedgerStore>,
            Arc::clone(&dyn_clock),
        );
        let scheduler = TaskScheduler::new(
            Arc::clone(&store) as Arc<dyn TaskStore>,
            Arc::clone(&dyn_clock),
        );
        let service = Arc::new(AppointmentService::new(
            Arc::clone(&store) as Arc<dyn AppointmentStore>,
            ledger.clone(),
            scheduler.clone(),
            availability,
            dyn_clock,
            LifecycleConfig::default(),
        ));
        Fixture {
            service,
            store,
            clock,
            ledger,
            scheduler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(OpenAvailability))
    }

    fn hold_request(f: &Fixture, owner: &str) -> HoldRequest {
        HoldRequest {
            owner_id: owner.to_string(),
            resource_key: SLOT.to_string(),
            slot_start: f.clock.now() + Duration::days(3),
        }
    }

    fn booking_request(f: &Fixture, owner: &str) -> BookingRequest {
        BookingRequest {
            owner_id: owner.to_string(),
            resource_key: SLOT.to_string(),
            slot_start: f.clock.now() + Duration::days(3),
            visit_type: Some("screening".to_string()),
        }
    }

    #[tokio::test]
    async fn hold_blocks_a_second_booking() {
        let f = fixture();
        let hold = assert_ok!(f.service.create_hold(hold_request(&f, "A")).await);
        assert_eq!(hold.status, AppointmentStatus::Held);

        let Err(SchedulerError::SlotTaken { resource_key }) =
            f.service.book_direct(booking_request(&f, "B")).await
        else {
            panic!("second claim on a held slot must be slot_taken");
        };
        assert_eq!(resource_key, SLOT);
        let all = assert_ok!(f.store.list_by_resource(SLOT).await);
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_bookings_admit_exactly_one() {
        let f = fixture();
        let mut handles = Vec::new();
        for i in 0..8 {
            let service = Arc::clone(&f.service);
            let request = booking_request(&f, &format!("participant-{i}"));
            handles.push(tokio::spawn(async move { service.book_direct(request).await }));
        }

        let mut booked = 0;
        let mut taken = 0;
        for handle in handles {
            let Ok(result) = handle.await else {
                panic!("booking task panicked");
            };
            match result {
                Ok(_) => booked += 1,
                Err(SchedulerError::SlotTaken { .. }) => taken += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(booked, 1);
        assert_eq!(taken, 7);
    }

    #[tokio::test]
    async fn hold_schedules_its_expiry() {
        let f = fixture();
        let hold = assert_ok!(f.service.create_hold(hold_request(&f, "A")).await);
        let pending = assert_ok!(f.scheduler.list_pending().await);
        assert_eq!(pending.len(), 1);
        let Some(task) = pending.first() else {
            panic!("expiry task expected");
        };
        assert_eq!(task.template_id, templates::HOLD_EXPIRY);
        assert_eq!(Some(task.due_at), hold.slot_held_until);
        assert_eq!(task.payload.appointment_id, Some(hold.appointment_id));
    }

    #[tokio::test]
    async fn confirm_booking_schedules_lifecycle_tasks() {
        let f = fixture();
        let hold = assert_ok!(f.service.create_hold(hold_request(&f, "A")).await);
        let booked = assert_ok!(
            f.service
                .confirm_booking(hold.appointment_id, Some("screening".to_string()))
                .await
        );
        let appt = booked.appointment;
        assert_eq!(appt.status, AppointmentStatus::Booked);
        assert_eq!(appt.visit_type.as_deref(), Some("screening"));
        assert_eq!(
            appt.confirmation_due_at,
            Some(f.clock.now() + Duration::hours(12))
        );
        assert!(booked.event.is_new());

        let pending = assert_ok!(f.scheduler.list_pending().await);
        let count = |template: &str| pending.iter().filter(|t| t.template_id == template).count();
        assert_eq!(count(templates::HOLD_EXPIRY), 1);
        assert_eq!(count(templates::CONFIRMATION_CHECK), 1);
        assert_eq!(count(templates::RECONFIRMATION), 2);
        assert_eq!(count(templates::NO_SHOW_RESCUE), 1);

        let keys: Vec<&str> = pending
            .iter()
            .filter(|t| t.template_id == templates::RECONFIRMATION)
            .map(|t| t.payload.idempotency_key.as_str())
            .collect();
        assert_ne!(keys.first(), keys.get(1));
    }

    #[tokio::test]
    async fn reminders_in_the_past_are_skipped() {
        let f = fixture();
        let mut request = booking_request(&f, "A");
        request.slot_start = f.clock.now() + Duration::hours(30);
        assert_ok!(f.service.book_direct(request).await);

        let pending = assert_ok!(f.scheduler.list_pending().await);
        let reminders = pending
            .iter()
            .filter(|t| t.template_id == templates::RECONFIRMATION)
            .count();
        assert_eq!(reminders, 1);
    }

    #[tokio::test]
    async fn confirming_a_lapsed_hold_expires_it() {
        let f = fixture();
        let hold = assert_ok!(f.service.create_hold(hold_request(&f, "A")).await);
        f.clock.advance(Duration::minutes(16));

        let Err(SchedulerError::HoldExpired(id)) =
            f.service.confirm_booking(hold.appointment_id, None).await
        else {
            panic!("lapsed hold must be rejected");
        };
        assert_eq!(id, hold.appointment_id);
        let appt = assert_ok!(f.service.get(id).await);
        assert_eq!(appt.status, AppointmentStatus::ExpiredUnconfirmed);
        let expired = assert_ok!(f.ledger.by_type(event_types::HOLD_EXPIRED).await);
        assert_eq!(expired.len(), 1);
    }

    #[tokio::test]
    async fn lapsed_hold_does_not_block_the_slot() {
        let f = fixture();
        let hold = assert_ok!(f.service.create_hold(hold_request(&f, "A")).await);
        f.clock.advance(Duration::minutes(20));

        let booking = assert_ok!(f.service.book_direct(booking_request(&f, "B")).await);
        assert_eq!(booking.status, AppointmentStatus::Booked);

        let old = assert_ok!(f.service.get(hold.appointment_id).await);
        assert_eq!(old.status, AppointmentStatus::ExpiredUnconfirmed);
        let Ok(Some(event)) = f.ledger.by_idempotency_key(&keys::hold_expire(hold.appointment_id)).await
        else {
            panic!("reclaimed hold must leave a ledger event");
        };
        assert_eq!(event.event_type, event_types::HOLD_EXPIRED);
    }

    #[tokio::test]
    async fn illegal_actions_are_invalid_transitions() {
        let f = fixture();
        let hold = assert_ok!(f.service.create_hold(hold_request(&f, "A")).await);
        let id = hold.appointment_id;

        let Err(SchedulerError::InvalidTransition { from, action, .. }) =
            f.service.mark_completed(id).await
        else {
            panic!("completing a hold is illegal");
        };
        assert_eq!(from, AppointmentStatus::Held);
        assert_eq!(action, LifecycleAction::Complete);

        assert_ok!(f.service.confirm_booking(id, None).await);
        assert_ok!(f.service.participant_confirms(id).await);
        assert_err!(f.service.participant_confirms(id).await);
        assert_err!(f.service.expire_unconfirmed(id).await);

        let done = assert_ok!(f.service.mark_completed(id).await);
        assert_eq!(done.appointment.status, AppointmentStatus::Completed);
        assert_err!(f.service.mark_no_show(id).await);
        assert_err!(f.service.cancel(id, None).await);
    }

    #[tokio::test]
    async fn cancel_frees_the_slot() {
        let f = fixture();
        let first = assert_ok!(f.service.book_direct(booking_request(&f, "A")).await);
        let cancelled = assert_ok!(
            f.service
                .cancel(first.appointment_id, Some("moved away".to_string()))
                .await
        );
        assert_eq!(cancelled.appointment.status, AppointmentStatus::Cancelled);
        assert_eq!(
            cancelled.event.event().payload,
            serde_json::json!({"reason": "moved away"})
        );
        assert_ok!(f.service.book_direct(booking_request(&f, "B")).await);
    }

    #[tokio::test]
    async fn unavailable_slot_is_rejected_before_any_write() {
        let f = fixture_with(Arc::new(ClosedAvailability));
        let Err(SchedulerError::SlotUnavailable(key)) =
            f.service.create_hold(hold_request(&f, "A")).await
        else {
            panic!("closed slot must be rejected");
        };
        assert_eq!(key, SLOT);
        assert_eq!(f.store.event_count().await, 0);
        assert_eq!(f.store.task_count().await, 0);
    }

    #[tokio::test]
    async fn past_slots_and_blank_owners_are_invalid() {
        let f = fixture();
        let mut request = hold_request(&f, "A");
        request.slot_start = f.clock.now() - Duration::hours(1);
        assert!(matches!(
            f.service.create_hold(request).await,
            Err(SchedulerError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.service.book_direct(booking_request(&f, " ")).await,
            Err(SchedulerError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn teach_back_hands_off_after_two_failures() {
        let f = fixture();
        let booking = assert_ok!(f.service.book_direct(booking_request(&f, "A")).await);
        let id = booking.appointment_id;

        let first = assert_ok!(f.service.record_teach_back(id, false, None).await);
        assert_eq!(first.attempts, 1);
        assert!(!first.handoff_required);

        let passed = assert_ok!(f.service.record_teach_back(id, true, None).await);
        assert_eq!(passed.attempts, 1);

        let second = assert_ok!(f.service.record_teach_back(id, false, None).await);
        assert_eq!(second.attempts, 2);
        assert!(second.handoff_required);

        let third = assert_ok!(f.service.record_teach_back(id, false, None).await);
        assert_eq!(third.attempts, 2);

        let appt = assert_ok!(f.service.get(id).await);
        assert_eq!(appt.status, AppointmentStatus::Booked);
    }

    #[tokio::test]
    async fn keyed_teach_back_failure_counts_once() {
        let f = fixture();
        let booking = assert_ok!(f.service.book_direct(booking_request(&f, "A")).await);
        let id = booking.appointment_id;

        for _ in 0..3 {
            let outcome = assert_ok!(f.service.record_teach_back(id, false, Some("call-17")).await);
            assert_eq!(outcome.attempts, 1);
        }
        let failures = assert_ok!(f.ledger.by_type(event_types::TEACH_BACK_FAILED).await);
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn lifecycle_tasks_start_pending() {
        let f = fixture();
        assert_ok!(f.service.book_direct(booking_request(&f, "A")).await);
        let pending = assert_ok!(f.scheduler.list_pending().await);
        assert!(pending.iter().all(|t| t.status == TaskStatus::Pending));
        assert!(
            pending
                .iter()
                .all(|t| t.payload.channel.as_deref() == Some("sms"))
        );
    }

    /// Store that lands a teach-back failure between a transition's read and
    /// its compare-and-set.
    #[derive(Debug)]
    struct TeachBackRacingStore {
        inner: Arc<InMemoryStore>,
    }

    #[async_trait]
    impl AppointmentStore for TeachBackRacingStore {
        async fn get(&self, id: AppointmentId) -> Result<Option<Appointment>, SchedulerError> {
            AppointmentStore::get(self.inner.as_ref(), id).await
        }

        async fn list_by_resource(
            &self,
            resource_key: &str,
        ) -> Result<Vec<Appointment>, SchedulerError> {
            self.inner.list_by_resource(resource_key).await
        }

        async fn insert_exclusive(
            &self,
            appointment: &Appointment,
            event: NewEvent,
            now: DateTime<Utc>,
        ) -> Result<SlotClaim, SchedulerError> {
            self.inner.insert_exclusive(appointment, event, now).await
        }

        async fn compare_and_set(
            &self,
            next: &Appointment,
            expected: AppointmentStatus,
            event: Option<NewEvent>,
            now: DateTime<Utc>,
        ) -> Result<CasOutcome, SchedulerError> {
            self.inner
                .increment_teach_back(next.appointment_id, 2, now)
                .await?;
            self.inner.compare_and_set(next, expected, event, now).await
        }

        async fn increment_teach_back(
            &self,
            id: AppointmentId,
            cap: u32,
            now: DateTime<Utc>,
        ) -> Result<Appointment, SchedulerError> {
            self.inner.increment_teach_back(id, cap, now).await
        }
    }

    #[tokio::test]
    async fn transition_keeps_a_concurrent_teach_back_failure() {
        let f = fixture();
        let racing = Arc::new(TeachBackRacingStore {
            inner: Arc::clone(&f.store),
        });
        let service = AppointmentService::new(
            racing as Arc<dyn AppointmentStore>,
            f.ledger.clone(),
            f.scheduler.clone(),
            Arc::new(OpenAvailability),
            Arc::clone(&f.clock) as Arc<dyn Clock>,
            LifecycleConfig::default(),
        );
        let booking = assert_ok!(service.book_direct(booking_request(&f, "A")).await);
        let id = booking.appointment_id;

        let confirmed = assert_ok!(service.participant_confirms(id).await);
        assert_eq!(confirmed.appointment.status, AppointmentStatus::Confirmed);
        assert_eq!(confirmed.appointment.teach_back_attempts, 1);

        let stored = assert_ok!(service.get(id).await);
        assert_eq!(stored.status, AppointmentStatus::Confirmed);
        assert_eq!(stored.teach_back_attempts, 1);
    }

    fn service_with(f: &Fixture, config: LifecycleConfig) -> AppointmentService {
        AppointmentService::new(
            Arc::clone(&f.store) as Arc<dyn AppointmentStore>,
            f.ledger.clone(),
            f.scheduler.clone(),
            Arc::new(OpenAvailability),
            Arc::clone(&f.clock) as Arc<dyn Clock>,
            config,
        )
    }

    #[tokio::test]
    async fn oversized_durations_fail_instead_of_panicking() {
        let f = fixture();
        let service = service_with(
            &f,
            LifecycleConfig {
                hold_ttl_minutes: i64::MAX,
                confirmation_window_hours: i64::MAX,
                ..LifecycleConfig::default()
            },
        );

        let hold = service.create_hold(hold_request(&f, "A")).await;
        assert!(matches!(hold, Err(SchedulerError::Internal(_))));
        let booking = service.book_direct(booking_request(&f, "A")).await;
        assert!(matches!(booking, Err(SchedulerError::Internal(_))));
        let all = assert_ok!(f.store.list_by_resource(SLOT).await);
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn oversized_reminder_offset_is_skipped() {
        let f = fixture();
        let service = service_with(
            &f,
            LifecycleConfig {
                reminder_offsets_hours: vec![i64::MAX, 24],
                ..LifecycleConfig::default()
            },
        );
        assert_ok!(service.book_direct(booking_request(&f, "A")).await);

        let pending = assert_ok!(f.scheduler.list_pending().await);
        let reminders = pending
            .iter()
            .filter(|t| t.template_id == templates::RECONFIRMATION)
            .count();
        assert_eq!(reminders, 1);
    }
}
