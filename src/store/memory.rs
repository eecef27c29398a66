//! In-memory implementation of every storage trait.
//!
//! All tables live behind a single [`tokio::sync::RwLock`], so every write
//! (slot claim, status compare-and-set, task claim) is one critical section.
//! That is the serialization primitive for the slot-conflict check.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    AppointmentStore, CasOutcome, EventFilter, LedgerStore, SlotClaim, TaskStore,
    reclaimed_hold_event,
};
use crate::domain::{
    AppendOutcome, Appointment, AppointmentId, AppointmentStatus, LedgerEvent, NewEvent,
    ScheduledTask, TaskId, TaskStatus,
};
use crate::error::SchedulerError;

#[derive(Debug, Default)]
struct Tables {
    events: Vec<LedgerEvent>,
    /// idempotency key → index into `events`.
    event_keys: HashMap<String, usize>,
    tasks: HashMap<TaskId, ScheduledTask>,
    appointments: HashMap<AppointmentId, Appointment>,
}

impl Tables {
    fn append(&mut self, event: NewEvent, now: DateTime<Utc>) -> AppendOutcome {
        if let Some(key) = event.idempotency_key.as_deref()
            && let Some(existing) = self
                .event_keys
                .get(key)
                .and_then(|&idx| self.events.get(idx))
        {
            return AppendOutcome::AlreadyApplied(existing.clone());
        }
        let event = event.into_event(now);
        if let Some(key) = event.idempotency_key.clone() {
            self.event_keys.insert(key, self.events.len());
        }
        self.events.push(event.clone());
        AppendOutcome::Appended(event)
    }

    /// Expires lapsed holds on `resource_key` (other than `except`) and
    /// returns the id of any appointment that still occupies the slot.
    fn reclaim_and_find_holder(
        &mut self,
        resource_key: &str,
        except: Option<AppointmentId>,
        now: DateTime<Utc>,
    ) -> (Vec<Appointment>, Option<AppointmentId>) {
        let mut reclaimed = Vec::new();
        let mut holder = None;
        for appt in self.appointments.values_mut() {
            if appt.resource_key != resource_key
                || !appt.status.is_active()
                || Some(appt.appointment_id) == except
            {
                continue;
            }
            if appt.hold_lapsed(now) {
                appt.status = AppointmentStatus::ExpiredUnconfirmed;
                appt.updated_at = now;
                reclaimed.push(appt.clone());
            } else {
                holder = Some(appt.appointment_id);
            }
        }
        for hold in &reclaimed {
            self.append(reclaimed_hold_event(hold), now);
        }
        (reclaimed, holder)
    }
}

/// Process-local store for the ledger, tasks and appointments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of ledger rows.
    pub async fn event_count(&self) -> usize {
        self.tables.read().await.events.len()
    }

    /// Returns the number of task rows in any status.
    pub async fn task_count(&self) -> usize {
        self.tables.read().await.tasks.len()
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn append(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, SchedulerError> {
        Ok(self.tables.write().await.append(event, now))
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<LedgerEvent>, SchedulerError> {
        let tables = self.tables.read().await;
        Ok(tables
            .event_keys
            .get(key)
            .and_then(|&idx| tables.events.get(idx))
            .cloned())
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, SchedulerError> {
        let tables = self.tables.read().await;
        let mut events: Vec<LedgerEvent> = tables
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn insert(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        self.tables
            .write()
            .await
            .tasks
            .insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<ScheduledTask>, SchedulerError> {
        Ok(self.tables.read().await.tasks.get(&task_id).cloned())
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<ScheduledTask> = tables
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.due_at);
        Ok(tasks)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let mut tables = self.tables.write().await;
        let mut due: Vec<&mut ScheduledTask> =
            tables.tasks.values_mut().filter(|t| t.is_due(now)).collect();
        due.sort_by_key(|t| t.due_at);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|task| {
                task.status = TaskStatus::Executing;
                task.updated_at = now;
                task.clone()
            })
            .collect())
    }

    async fn mark_completed(
        &self,
        task_id: TaskId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.last_error = None;
        task.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        task_id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Failed;
        task.last_error = Some(error.to_string());
        task.updated_at = now;
        Ok(())
    }

    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, SchedulerError> {
        let mut tables = self.tables.write().await;
        let mut count = 0;
        for task in tables.tasks.values_mut() {
            if task.status == TaskStatus::Executing && task.updated_at < stale_before {
                task.status = TaskStatus::Pending;
                task.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl AppointmentStore for InMemoryStore {
    async fn get(&self, id: AppointmentId) -> Result<Option<Appointment>, SchedulerError> {
        Ok(self.tables.read().await.appointments.get(&id).cloned())
    }

    async fn list_by_resource(
        &self,
        resource_key: &str,
    ) -> Result<Vec<Appointment>, SchedulerError> {
        let tables = self.tables.read().await;
        let mut appts: Vec<Appointment> = tables
            .appointments
            .values()
            .filter(|a| a.resource_key == resource_key)
            .cloned()
            .collect();
        appts.sort_by_key(|a| a.created_at);
        Ok(appts)
    }

    async fn insert_exclusive(
        &self,
        appointment: &Appointment,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<SlotClaim, SchedulerError> {
        let mut tables = self.tables.write().await;
        if tables.appointments.contains_key(&appointment.appointment_id) {
            return Err(SchedulerError::Internal(format!(
                "appointment {} already exists",
                appointment.appointment_id
            )));
        }
        let (reclaimed, holder) =
            tables.reclaim_and_find_holder(&appointment.resource_key, None, now);
        if let Some(holder) = holder {
            return Ok(SlotClaim::Taken { holder });
        }
        tables
            .appointments
            .insert(appointment.appointment_id, appointment.clone());
        let event = tables.append(event, now);
        Ok(SlotClaim::Claimed { event, reclaimed })
    }

    async fn compare_and_set(
        &self,
        next: &Appointment,
        expected: AppointmentStatus,
        event: Option<NewEvent>,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, SchedulerError> {
        let mut tables = self.tables.write().await;
        let current = tables
            .appointments
            .get(&next.appointment_id)
            .cloned()
            .ok_or(SchedulerError::AppointmentNotFound(next.appointment_id))?;
        if current.status != expected {
            return Ok(CasOutcome::StatusChanged(current));
        }

        let mut reclaimed = Vec::new();
        if next.status.is_active() {
            let (lapsed, holder) = tables.reclaim_and_find_holder(
                &next.resource_key,
                Some(next.appointment_id),
                now,
            );
            if let Some(holder) = holder {
                return Ok(CasOutcome::SlotTaken { holder });
            }
            reclaimed = lapsed;
        }

        let mut stored = current;
        stored.status = next.status;
        stored.visit_type.clone_from(&next.visit_type);
        stored.slot_held_until = next.slot_held_until;
        stored.confirmation_due_at = next.confirmation_due_at;
        stored.updated_at = next.updated_at;
        tables
            .appointments
            .insert(stored.appointment_id, stored.clone());
        let event = event.map(|e| tables.append(e, now));
        Ok(CasOutcome::Applied {
            appointment: stored,
            event,
            reclaimed,
        })
    }

    async fn increment_teach_back(
        &self,
        id: AppointmentId,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<Appointment, SchedulerError> {
        let mut tables = self.tables.write().await;
        let appt = tables
            .appointments
            .get_mut(&id)
            .ok_or(SchedulerError::AppointmentNotFound(id))?;
        appt.teach_back_attempts = appt.teach_back_attempts.saturating_add(1).min(cap);
        appt.updated_at = now;
        Ok(appt.clone())
    }
}
