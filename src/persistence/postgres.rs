//! PostgreSQL implementation of the storage traits.
//!
//! Slot exclusivity is enforced three ways at once: a transaction-scoped
//! advisory lock on the `resource_key`, `SELECT … FOR UPDATE` on the rows
//! being checked, and the partial unique index
//! `appointments_active_resource_key` as the backstop. A unique violation
//! from that index is reported as [`SchedulerError::SlotTaken`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};

use super::models::{AppointmentRow, EventRow, TaskRow};
use crate::config::SchedulerConfig;
use crate::domain::{
    AppendOutcome, Appointment, AppointmentId, AppointmentStatus, LedgerEvent, NewEvent,
    ScheduledTask, TaskId, TaskStatus,
};
use crate::error::SchedulerError;
use crate::store::{
    AppointmentStore, CasOutcome, EventFilter, LedgerStore, SlotClaim, TaskStore,
    reclaimed_hold_event,
};

const EVENT_COLUMNS: &str = "event_id, subject_id, event_type, related_appointment_id, \
     idempotency_key, payload, created_at";

const TASK_COLUMNS: &str =
    "task_id, template_id, due_at, status, payload, last_error, result, created_at, updated_at";

const APPOINTMENT_COLUMNS: &str = "appointment_id, owner_id, resource_key, slot_start, \
     visit_type, status, slot_held_until, confirmation_due_at, teach_back_attempts, \
     created_at, updated_at";

const ACTIVE_STATUSES: &str = "('held', 'booked', 'confirmed')";

/// PostgreSQL-backed store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wraps an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool sized from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] if the database is unreachable.
    pub async fn connect(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connect_timeout_secs))
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Applies the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), SchedulerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SchedulerError::Persistence(e.to_string()))
    }
}

/// Inserts `event` unless its key exists; reads back the winner otherwise.
async fn append_on(
    conn: &mut PgConnection,
    event: NewEvent,
    now: DateTime<Utc>,
) -> Result<AppendOutcome, SchedulerError> {
    let event = event.into_event(now);
    let inserted = sqlx::query_as::<_, EventRow>(&format!(
        "INSERT INTO ledger_events ({EVENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (idempotency_key) DO NOTHING RETURNING {EVENT_COLUMNS}"
    ))
    .bind(event.event_id.as_uuid())
    .bind(&event.subject_id)
    .bind(&event.event_type)
    .bind(event.related_appointment_id.map(uuid::Uuid::from))
    .bind(event.idempotency_key.as_deref())
    .bind(&event.payload)
    .bind(event.created_at)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = inserted {
        return Ok(AppendOutcome::Appended(row.into()));
    }

    let key = event.idempotency_key.as_deref().ok_or_else(|| {
        SchedulerError::Persistence(format!("event {} was not inserted", event.event_id))
    })?;
    let existing = sqlx::query_as::<_, EventRow>(&format!(
        "SELECT {EVENT_COLUMNS} FROM ledger_events WHERE idempotency_key = $1"
    ))
    .bind(key)
    .fetch_one(&mut *conn)
    .await?;
    Ok(AppendOutcome::AlreadyApplied(existing.into()))
}

/// Serializes writers on one slot for the rest of the transaction.
async fn lock_slot(conn: &mut PgConnection, resource_key: &str) -> Result<(), SchedulerError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(resource_key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Expires lapsed holds on the slot and reports any remaining occupant.
async fn reclaim_and_find_holder(
    conn: &mut PgConnection,
    resource_key: &str,
    except: Option<AppointmentId>,
    now: DateTime<Utc>,
) -> Result<(Vec<Appointment>, Option<AppointmentId>), SchedulerError> {
    let rows = sqlx::query_as::<_, AppointmentRow>(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments \
         WHERE resource_key = $1 AND status IN {ACTIVE_STATUSES} \
         AND ($2::uuid IS NULL OR appointment_id <> $2) FOR UPDATE"
    ))
    .bind(resource_key)
    .bind(except.map(uuid::Uuid::from))
    .fetch_all(&mut *conn)
    .await?;

    let mut reclaimed = Vec::new();
    let mut holder = None;
    for row in rows {
        let mut appt = Appointment::try_from(row)?;
        if appt.hold_lapsed(now) {
            sqlx::query(
                "UPDATE appointments SET status = 'expired_unconfirmed', updated_at = $2 \
                 WHERE appointment_id = $1",
            )
            .bind(appt.appointment_id.as_uuid())
            .bind(now)
            .execute(&mut *conn)
            .await?;
            appt.status = AppointmentStatus::ExpiredUnconfirmed;
            appt.updated_at = now;
            append_on(conn, reclaimed_hold_event(&appt), now).await?;
            reclaimed.push(appt);
        } else {
            holder = Some(appt.appointment_id);
        }
    }
    Ok((reclaimed, holder))
}

fn teach_back_column(attempts: u32) -> Result<i32, SchedulerError> {
    i32::try_from(attempts)
        .map_err(|_| SchedulerError::InvalidRequest(format!("attempt count {attempts} overflows")))
}

/// Maps a unique violation on the active-slot index to `slot_taken`.
fn slot_violation(err: sqlx::Error, resource_key: &str) -> SchedulerError {
    if let sqlx::Error::Database(db) = &err
        && db.is_unique_violation()
    {
        return SchedulerError::SlotTaken {
            resource_key: resource_key.to_string(),
        };
    }
    err.into()
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn append(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, SchedulerError> {
        let mut conn = self.pool.acquire().await?;
        append_on(&mut conn, event, now).await
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<LedgerEvent>, SchedulerError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM ledger_events WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, SchedulerError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {EVENT_COLUMNS} FROM ledger_events WHERE TRUE"
        ));
        if let Some(subject_id) = &filter.subject_id {
            qb.push(" AND subject_id = ").push_bind(subject_id.clone());
        }
        if let Some(event_type) = &filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(id) = filter.related_appointment_id {
            qb.push(" AND related_appointment_id = ")
                .push_bind(uuid::Uuid::from(id));
        }
        if let Some(from) = filter.from {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" AND created_at < ").push_bind(to);
        }
        qb.push(" ORDER BY created_at ASC");

        let rows = qb.build_query_as::<EventRow>().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl TaskStore for PostgresStore {
    async fn insert(&self, task: &ScheduledTask) -> Result<(), SchedulerError> {
        let payload = serde_json::to_value(&task.payload)
            .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        sqlx::query(&format!(
            "INSERT INTO scheduled_tasks ({TASK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(task.task_id.as_uuid())
        .bind(&task.template_id)
        .bind(task.due_at)
        .bind(task.status.as_str())
        .bind(payload)
        .bind(task.last_error.as_deref())
        .bind(task.result.as_ref())
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<ScheduledTask>, SchedulerError> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE task_id = $1"
        ))
        .bind(task_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(ScheduledTask::try_from)
        .transpose()
    }

    async fn list_by_status(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<ScheduledTask>, SchedulerError> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE status = $1 ORDER BY due_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScheduledTask::try_from)
        .collect()
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>, SchedulerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE scheduled_tasks SET status = 'executing', updated_at = $1 \
             WHERE task_id IN ( \
                 SELECT task_id FROM scheduled_tasks \
                 WHERE status = 'pending' AND due_at <= $1 \
                 ORDER BY due_at ASC LIMIT $2 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScheduledTask::try_from)
        .collect()
    }

    async fn mark_completed(
        &self,
        task_id: TaskId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let done = sqlx::query(
            "UPDATE scheduled_tasks SET status = 'completed', result = $2, last_error = NULL, \
             updated_at = $3 WHERE task_id = $1",
        )
        .bind(task_id.as_uuid())
        .bind(result)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        task_id: TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let done = sqlx::query(
            "UPDATE scheduled_tasks SET status = 'failed', last_error = $2, updated_at = $3 \
             WHERE task_id = $1",
        )
        .bind(task_id.as_uuid())
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn requeue_stale(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, SchedulerError> {
        let done = sqlx::query(
            "UPDATE scheduled_tasks SET status = 'pending', updated_at = $2 \
             WHERE status = 'executing' AND updated_at < $1",
        )
        .bind(stale_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl AppointmentStore for PostgresStore {
    async fn get(&self, id: AppointmentId) -> Result<Option<Appointment>, SchedulerError> {
        sqlx::query_as::<_, AppointmentRow>(&format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE appointment_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Appointment::try_from)
        .transpose()
    }

    async fn list_by_resource(
        &self,
        resource_key: &str,
    ) -> Result<Vec<Appointment>, SchedulerError> {
        sqlx::query_as::<_, AppointmentRow>(&format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE resource_key = $1 \
             ORDER BY created_at ASC"
        ))
        .bind(resource_key)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Appointment::try_from)
        .collect()
    }

    async fn insert_exclusive(
        &self,
        appointment: &Appointment,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<SlotClaim, SchedulerError> {
        let mut tx = self.pool.begin().await?;
        lock_slot(&mut tx, &appointment.resource_key).await?;

        let (reclaimed, holder) =
            reclaim_and_find_holder(&mut tx, &appointment.resource_key, None, now).await?;
        if let Some(holder) = holder {
            tx.rollback().await?;
            return Ok(SlotClaim::Taken { holder });
        }

        sqlx::query(&format!(
            "INSERT INTO appointments ({APPOINTMENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(appointment.appointment_id.as_uuid())
        .bind(&appointment.owner_id)
        .bind(&appointment.resource_key)
        .bind(appointment.slot_start)
        .bind(appointment.visit_type.as_deref())
        .bind(appointment.status.as_str())
        .bind(appointment.slot_held_until)
        .bind(appointment.confirmation_due_at)
        .bind(teach_back_column(appointment.teach_back_attempts)?)
        .bind(appointment.created_at)
        .bind(appointment.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| slot_violation(e, &appointment.resource_key))?;

        let event = append_on(&mut tx, event, now).await?;
        tx.commit().await?;
        Ok(SlotClaim::Claimed { event, reclaimed })
    }

    async fn compare_and_set(
        &self,
        next: &Appointment,
        expected: AppointmentStatus,
        event: Option<NewEvent>,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, SchedulerError> {
        let mut tx = self.pool.begin().await?;
        lock_slot(&mut tx, &next.resource_key).await?;

        let current = sqlx::query_as::<_, AppointmentRow>(&format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE appointment_id = $1 FOR UPDATE"
        ))
        .bind(next.appointment_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .map(Appointment::try_from)
        .transpose()?
        .ok_or(SchedulerError::AppointmentNotFound(next.appointment_id))?;

        if current.status != expected {
            tx.rollback().await?;
            return Ok(CasOutcome::StatusChanged(current));
        }

        let mut reclaimed = Vec::new();
        if next.status.is_active() {
            let (lapsed, holder) = reclaim_and_find_holder(
                &mut tx,
                &next.resource_key,
                Some(next.appointment_id),
                now,
            )
            .await?;
            if let Some(holder) = holder {
                tx.rollback().await?;
                return Ok(CasOutcome::SlotTaken { holder });
            }
            reclaimed = lapsed;
        }

        let stored = sqlx::query_as::<_, AppointmentRow>(&format!(
            "UPDATE appointments SET status = $2, visit_type = $3, slot_held_until = $4, \
             confirmation_due_at = $5, updated_at = $6 \
             WHERE appointment_id = $1 RETURNING {APPOINTMENT_COLUMNS}"
        ))
        .bind(next.appointment_id.as_uuid())
        .bind(next.status.as_str())
        .bind(next.visit_type.as_deref())
        .bind(next.slot_held_until)
        .bind(next.confirmation_due_at)
        .bind(next.updated_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| slot_violation(e, &next.resource_key))?;
        let appointment = Appointment::try_from(stored)?;

        let event = match event {
            Some(event) => Some(append_on(&mut tx, event, now).await?),
            None => None,
        };
        tx.commit().await?;
        Ok(CasOutcome::Applied {
            appointment,
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
        sqlx::query_as::<_, AppointmentRow>(&format!(
            "UPDATE appointments \
             SET teach_back_attempts = LEAST(teach_back_attempts + 1, $2), updated_at = $3 \
             WHERE appointment_id = $1 RETURNING {APPOINTMENT_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(teach_back_column(cap)?)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .map(Appointment::try_from)
        .transpose()?
        .ok_or(SchedulerError::AppointmentNotFound(id))
    }
}
