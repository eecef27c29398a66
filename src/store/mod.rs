//! Storage seams for the ledger, the task queue and appointments.
//!
//! Each trait is implemented twice: [`memory::InMemoryStore`] for tests and
//! single-process runs, and [`crate::persistence::postgres::PostgresStore`]
//! for durable deployments. The atomicity contracts documented on each
//! method hold for both.

pub mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AppendOutcome, Appointment, AppointmentId, AppointmentStatus, LedgerEvent, NewEvent,
    ScheduledTask, TaskId, TaskStatus,
};
use crate::error::SchedulerError;

pub use memory::InMemoryStore;

/// Read filter over the ledger. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    /// Only events about this subject.
    pub subject_id: Option<String>,
    /// Only events of this type.
    pub event_type: Option<String>,
    /// Only events linked to this appointment.
    pub related_appointment_id: Option<AppointmentId>,
    /// Only events created at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Only events created strictly before this instant.
    pub to: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Returns `true` if `event` passes the filter.
    #[must_use]
    pub fn matches(&self, event: &LedgerEvent) -> bool {
        self.subject_id
            .as_deref()
            .is_none_or(|s| event.subject_id == s)
            && self
                .event_type
                .as_deref()
                .is_none_or(|t| event.event_type == t)
            && self
                .related_appointment_id
                .is_none_or(|id| event.related_appointment_id == Some(id))
            && self.from.is_none_or(|from| event.created_at >= from)
            && self.to.is_none_or(|to| event.created_at < to)
    }
}

/// Append-only event storage with a unique idempotency key.
#[async_trait]
pub trait LedgerStore: Send + Sync + Debug {
    /// Writes `event` unless its idempotency key already exists, in which case
    /// the existing row is returned as [`AppendOutcome::AlreadyApplied`].
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure. A duplicate
    /// key is never an error.
    async fn append(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, SchedulerError>;

    /// Looks up the event written under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn find_by_key(&self, key: &str) -> Result<Option<LedgerEvent>, SchedulerError>;

    /// Returns matching events ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn query(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, SchedulerError>;
}

/// Durable queue of deferred tasks.
#[async_trait]
pub trait TaskStore: Send + Sync + Debug {
    /// Stores a new task. Never deduplicates.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn insert(&self, task: &ScheduledTask) -> Result<(), SchedulerError>;

    /// Fetches a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn get(&self, task_id: TaskId) -> Result<Option<ScheduledTask>, SchedulerError>;

    /// Lists tasks in `status`, earliest due first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn list_by_status(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<ScheduledTask>, SchedulerError>;

    /// Atomically moves up to `limit` due pending tasks to `executing` and
    /// returns them. A task is returned by at most one concurrent caller.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, SchedulerError>;

    /// Moves an executing task to `completed`, recording the handler result.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TaskNotFound`] if the task does not exist.
    async fn mark_completed(
        &self,
        task_id: TaskId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    /// Moves an executing task to `failed`, recording the error.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TaskNotFound`] if the task does not exist.
    async fn mark_failed(
        &self,
        task_id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    /// Returns tasks stuck in `executing` since before `stale_before` to
    /// `pending`. Returns how many were re-queued.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, SchedulerError>;
}

/// Result of an exclusive insert.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotClaim {
    /// The appointment was written together with its ledger event.
    Claimed {
        /// The event recorded alongside the insert.
        event: AppendOutcome,
        /// Lapsed holds on the same slot expired to make room.
        reclaimed: Vec<Appointment>,
    },
    /// Another active appointment occupies the slot; nothing was written.
    Taken {
        /// The occupying appointment.
        holder: AppointmentId,
    },
}

/// Result of a status compare-and-set.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The new record and its event were written.
    Applied {
        /// The record as stored after the update.
        appointment: Appointment,
        /// The event recorded alongside the update, if one was supplied.
        event: Option<AppendOutcome>,
        /// Lapsed holds on the same slot expired to make room.
        reclaimed: Vec<Appointment>,
    },
    /// The stored status no longer matched; carries the current record.
    StatusChanged(Appointment),
    /// The target status is active and another active appointment holds the
    /// slot; nothing was written.
    SlotTaken {
        /// The occupying appointment.
        holder: AppointmentId,
    },
}

/// Appointment storage with slot-exclusive writes.
///
/// Writes that make an appointment active check the slot-conflict invariant
/// under a serialization primitive scoped to the `resource_key`, so two
/// concurrent claims on one slot can never both succeed. Lapsed holds found
/// during that check are expired in the same critical section.
#[async_trait]
pub trait AppointmentStore: Send + Sync + Debug {
    /// Fetches an appointment by id.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn get(&self, id: AppointmentId) -> Result<Option<Appointment>, SchedulerError>;

    /// Lists every appointment ever recorded for a slot.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn list_by_resource(
        &self,
        resource_key: &str,
    ) -> Result<Vec<Appointment>, SchedulerError>;

    /// Inserts a new active appointment if its slot is free, appending
    /// `event` to the ledger atomically with the insert.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    async fn insert_exclusive(
        &self,
        appointment: &Appointment,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<SlotClaim, SchedulerError>;

    /// Writes the lifecycle fields of `next` (status, visit type, hold and
    /// confirmation deadlines, `updated_at`) if the stored status still
    /// equals `expected`, appending `event` atomically with the update.
    /// Other fields, such as the teach-back counter, keep their stored
    /// values.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AppointmentNotFound`] if no record exists.
    async fn compare_and_set(
        &self,
        next: &Appointment,
        expected: AppointmentStatus,
        event: Option<NewEvent>,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, SchedulerError>;

    /// Atomically increments `teach_back_attempts`, saturating at `cap`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AppointmentNotFound`] if no record exists.
    async fn increment_teach_back(
        &self,
        id: AppointmentId,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<Appointment, SchedulerError>;
}

/// Builds the event recorded when a lapsed hold is reclaimed.
#[must_use]
pub fn reclaimed_hold_event(hold: &Appointment) -> NewEvent {
    NewEvent::new(
        hold.owner_id.clone(),
        crate::domain::event::event_types::HOLD_EXPIRED,
    )
    .keyed(crate::domain::event::keys::hold_expire(hold.appointment_id))
    .for_appointment(hold.appointment_id)
    .with_payload(serde_json::json!({
        "resource_key": hold.resource_key,
        "reason": "reclaimed",
    }))
}
