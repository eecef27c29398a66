//! Task scheduler: the enqueue side of the deferred-task queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{Clock, ScheduledTask, TaskId, TaskPayload, TaskStatus};
use crate::error::SchedulerError;
use crate::store::TaskStore;

/// Creates and inspects scheduled tasks.
///
/// Enqueue never deduplicates: two calls with identical arguments create two
/// tasks. Deduplication of *effects* happens in the handlers via the ledger.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl TaskScheduler {
    /// Creates a scheduler over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Stores a new pending task and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidRequest`] if the template id, the
    /// subject or the payload's idempotency key is blank, or
    /// [`SchedulerError::Persistence`] on storage failure.
    pub async fn enqueue(
        &self,
        template_id: &str,
        due_at: DateTime<Utc>,
        payload: TaskPayload,
    ) -> Result<TaskId, SchedulerError> {
        if template_id.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "template_id must not be empty".to_string(),
            ));
        }
        if payload.subject_id.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "subject_id must not be empty".to_string(),
            ));
        }
        if payload.idempotency_key.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "idempotency_key must not be empty".to_string(),
            ));
        }

        let task = ScheduledTask::pending(template_id, due_at, payload, self.clock.now());
        self.store.insert(&task).await?;
        tracing::info!(
            task_id = %task.task_id,
            template_id = %task.template_id,
            due_at = %task.due_at,
            "task enqueued"
        );
        Ok(task.task_id)
    }

    /// Lists pending tasks, earliest due first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Persistence`] on storage failure.
    pub async fn list_pending(&self) -> Result<Vec<ScheduledTask>, SchedulerError> {
        self.store.list_by_status(TaskStatus::Pending).await
    }

    /// Fetches a task.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TaskNotFound`] if no such task exists.
    pub async fn get(&self, task_id: TaskId) -> Result<ScheduledTask, SchedulerError> {
        self.store
            .get(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound(task_id))
    }

    /// Enqueues a fresh pending copy of a failed task.
    ///
    /// The copy keeps the template and payload (including its idempotency
    /// key), so any effect the failed attempt did manage to record is not
    /// repeated. `due_at` defaults to now.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::TaskNotFound`] if the task does not exist and
    /// [`SchedulerError::InvalidRequest`] if it has not failed.
    pub async fn reenqueue(
        &self,
        task_id: TaskId,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<TaskId, SchedulerError> {
        let task = self.get(task_id).await?;
        if task.status != TaskStatus::Failed {
            return Err(SchedulerError::InvalidRequest(format!(
                "task {task_id} is {}; only failed tasks can be re-enqueued",
                task.status
            )));
        }
        let due_at = due_at.unwrap_or_else(|| self.clock.now());
        let new_id = self
            .enqueue(&task.template_id, due_at, task.payload)
            .await?;
        tracing::info!(from = %task_id, to = %new_id, "failed task re-enqueued");
        Ok(new_id)
    }
}
