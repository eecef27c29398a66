//! Background dispatcher: turns due tasks into handler runs.
//!
//! One cycle re-queues abandoned `executing` tasks, claims a batch of due
//! tasks, and runs their handlers one after another. Each handler runs in its
//! own tokio task so a panic is contained to the task it belongs to. Cycles
//! never overlap, and nothing inside a cycle stops the loop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use utoipa::ToSchema;

use crate::config::DispatcherConfig;
use crate::domain::{Clock, ScheduledTask};
use crate::handlers::HandlerRegistry;
use crate::store::TaskStore;

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct CycleReport {
    /// Abandoned tasks returned to `pending`.
    pub requeued: u64,
    /// Tasks claimed for execution.
    pub claimed: usize,
    /// Claimed tasks whose handler succeeded.
    pub completed: usize,
    /// Claimed tasks whose handler failed or was missing.
    pub failed: usize,
    /// `true` if another cycle was still running and this one did nothing.
    pub skipped: bool,
}

/// Polls the task store and runs due handlers.
#[derive(Debug)]
pub struct Dispatcher {
    tasks: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    in_flight: Mutex<()>,
}

impl Dispatcher {
    /// Creates a new `Dispatcher`.
    #[must_use]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            tasks,
            registry,
            clock,
            config,
            in_flight: Mutex::new(()),
        }
    }

    /// Runs one cycle. Returns immediately with `skipped` set if a cycle is
    /// already in progress.
    pub async fn run_cycle(&self) -> CycleReport {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::debug!("previous dispatch cycle still running");
            return CycleReport {
                skipped: true,
                ..CycleReport::default()
            };
        };

        let mut report = CycleReport::default();
        let now = self.clock.now();

        if let Some(stale_before) = stale_cutoff(now, self.config.stale_after_secs) {
            match self.tasks.requeue_stale(stale_before, now).await {
                Ok(0) => {}
                Ok(count) => {
                    report.requeued = count;
                    tracing::warn!(count, "re-queued abandoned executing tasks");
                }
                Err(err) => tracing::error!(error = %err, "failed to re-queue stale tasks"),
            }
        }

        let batch = match self.tasks.claim_due(now, self.config.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(error = %err, "failed to claim due tasks");
                return report;
            }
        };
        report.claimed = batch.len();

        for task in batch {
            if self.execute(task).await {
                report.completed += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                completed = report.completed,
                failed = report.failed,
                "dispatch cycle finished"
            );
        }
        report
    }

    /// Runs one claimed task and records its result. Returns `true` on
    /// success.
    async fn execute(&self, task: ScheduledTask) -> bool {
        let task_id = task.task_id;
        let template_id = task.template_id.clone();
        let registry = Arc::clone(&self.registry);
        let joined = tokio::spawn(async move {
            registry.dispatch(&task.template_id, &task.payload).await
        })
        .await;
        let finished_at = self.clock.now();

        let error = match joined {
            Ok(Ok(outcome)) => {
                let result = serde_json::to_value(&outcome).unwrap_or_else(
                    |err| serde_json::json!({ "unserializable_outcome": err.to_string() }),
                );
                if let Err(err) = self.tasks.mark_completed(task_id, result, finished_at).await {
                    tracing::error!(%task_id, error = %err, "failed to mark task completed");
                }
                tracing::info!(
                    %task_id,
                    template_id = %template_id,
                    status = ?outcome.status,
                    applied = outcome.applied,
                    "task completed"
                );
                return true;
            }
            Ok(Err(err)) => format!("{}: {err}", err.kind()),
            Err(join) if join.is_panic() => "handler_panicked".to_string(),
            Err(_) => "handler_cancelled".to_string(),
        };

        tracing::warn!(%task_id, template_id = %template_id, error = %error, "task failed");
        if let Err(err) = self.tasks.mark_failed(task_id, &error, finished_at).await {
            tracing::error!(%task_id, error = %err, "failed to mark task failed");
        }
        false
    }

    /// Polls on a fixed interval until `shutdown` flips to `true` or its
    /// sender is dropped. A cycle in progress always finishes first.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = std::time::Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            templates = ?self.registry.templates(),
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("dispatcher stopped");
    }

    /// Spawns [`Self::run`] on the runtime.
    #[must_use]
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

fn stale_cutoff(now: DateTime<Utc>, stale_after_secs: u64) -> Option<DateTime<Utc>> {
    let age = chrono::Duration::from_std(std::time::Duration::from_secs(stale_after_secs)).ok()?;
    now.checked_sub_signed(age)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::event::{event_types, keys};
    use crate::domain::task::templates;
    use crate::domain::{TaskPayload, TaskStatus};
    use crate::test_support::Harness;
    use chrono::Duration;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn past_due_task_completes_in_one_cycle() {
        let h = Harness::new();
        let booking = h.book("A").await;
        let id = booking.appointment_id;
        let payload = TaskPayload::for_appointment("A", id, "reminder-now");
        let task_id = assert_ok!(
            h.state
                .scheduler
                .enqueue(templates::RECONFIRMATION, h.clock.now() - Duration::minutes(1), payload)
                .await
        );

        let report = h.state.dispatcher.run_cycle().await;
        assert_eq!(report.claimed, 1);
        assert_eq!(report.completed, 1);

        let task = assert_ok!(h.state.scheduler.get(task_id).await);
        assert_eq!(task.status, TaskStatus::Completed);
        let Some(result) = task.result else {
            panic!("completed task must carry its outcome");
        };
        assert_eq!(result.get("status"), Some(&serde_json::json!("sent")));
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn future_tasks_are_not_claimed() {
        let h = Harness::new();
        h.book("A").await;
        let report = h.state.dispatcher.run_cycle().await;
        assert_eq!(report.claimed, 0);
        assert!(!assert_ok!(h.state.scheduler.list_pending().await).is_empty());
    }

    #[tokio::test]
    async fn unknown_template_marks_the_task_failed() {
        let h = Harness::new();
        let payload = TaskPayload::for_appointment("A", crate::domain::AppointmentId::new(), "k");
        let task_id = assert_ok!(
            h.state
                .scheduler
                .enqueue("send_fax", h.clock.now(), payload)
                .await
        );

        let report = h.state.dispatcher.run_cycle().await;
        assert_eq!(report.failed, 1);
        let task = assert_ok!(h.state.scheduler.get(task_id).await);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(
            task.last_error
                .as_deref()
                .is_some_and(|e| e.starts_with("unknown_template"))
        );
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let h = Harness::new();
        let booking = h.book("A").await;
        let now = h.clock.now();
        let missing = TaskPayload::for_appointment("B", crate::domain::AppointmentId::new(), "x-1");
        let good = TaskPayload::for_appointment("A", booking.appointment_id, "x-2");
        assert_ok!(h.state.scheduler.enqueue(templates::RECONFIRMATION, now, missing).await);
        assert_ok!(h.state.scheduler.enqueue(templates::RECONFIRMATION, now, good).await);

        let report = h.state.dispatcher.run_cycle().await;
        assert_eq!(report.claimed, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn overlapping_cycles_are_skipped() {
        let h = Harness::new();
        let Ok(_held) = h.state.dispatcher.in_flight.try_lock() else {
            panic!("lock should be free");
        };
        let report = h.state.dispatcher.run_cycle().await;
        assert!(report.skipped);
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn abandoned_executing_tasks_are_requeued() {
        let h = Harness::new();
        let payload = TaskPayload::for_appointment("A", crate::domain::AppointmentId::new(), "k");
        let now = h.clock.now();
        let task_id = assert_ok!(h.state.scheduler.enqueue("send_fax", now, payload).await);
        let claimed = assert_ok!(h.store.claim_due(now, 10).await);
        assert_eq!(claimed.len(), 1);

        h.clock.advance(Duration::minutes(10));
        let report = h.state.dispatcher.run_cycle().await;
        assert_eq!(report.requeued, 1);
        assert_eq!(report.claimed, 1);
        let task = assert_ok!(h.state.scheduler.get(task_id).await);
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn confirmation_deadline_flows_through_the_dispatcher() {
        let h = Harness::new();
        let booking = h.book("A").await;
        let id = booking.appointment_id;

        h.clock.advance(Duration::hours(12));
        let report = h.state.dispatcher.run_cycle().await;
        assert_eq!(report.failed, 0);

        let appt = assert_ok!(h.state.appointments.get(id).await);
        assert_eq!(appt.status, crate::domain::AppointmentStatus::ExpiredUnconfirmed);
        let expired = assert_ok!(
            h.state
                .ledger
                .by_idempotency_key(&keys::confirmation_expire(id))
                .await
        );
        assert!(expired.is_some());

        // the follow-up enqueued by the handler is due now
        let report = h.state.dispatcher.run_cycle().await;
        assert_eq!(report.completed, 1);
        let follow_ups = assert_ok!(h.state.ledger.by_type(event_types::FOLLOW_UP_SENT).await);
        assert_eq!(follow_ups.len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = Harness::new();
        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&h.state.dispatcher).spawn(rx);
        assert_ok!(tx.send(true));
        let joined = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }

    #[derive(Debug)]
    struct Exploding;

    #[async_trait::async_trait]
    impl crate::handlers::TaskHandler for Exploding {
        fn template_id(&self) -> &'static str {
            "exploding"
        }

        async fn handle(
            &self,
            _ctx: &crate::handlers::HandlerContext,
            _payload: &TaskPayload,
        ) -> Result<crate::handlers::HandlerOutcome, crate::error::SchedulerError> {
            panic!("handler blew up");
        }
    }

    #[tokio::test]
    async fn handler_panic_fails_only_its_own_task() {
        let h = Harness::new();
        let mut registry = HandlerRegistry::standard(h.state.registry.context().clone());
        registry.register(Arc::new(Exploding));
        let dispatcher = Dispatcher::new(
            Arc::clone(&h.store) as Arc<dyn TaskStore>,
            Arc::new(registry),
            Arc::clone(&h.clock) as Arc<dyn Clock>,
            DispatcherConfig::default(),
        );

        let booking = h.book("A").await;
        let now = h.clock.now();
        let boom = TaskPayload::for_appointment("A", booking.appointment_id, "boom-1");
        let good = TaskPayload::for_appointment("A", booking.appointment_id, "reminder-1");
        let boom_id = assert_ok!(h.state.scheduler.enqueue("exploding", now, boom).await);
        let good_id = assert_ok!(
            h.state
                .scheduler
                .enqueue(templates::RECONFIRMATION, now, good)
                .await
        );

        let report = dispatcher.run_cycle().await;
        assert_eq!(report.claimed, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);

        let exploded = assert_ok!(h.state.scheduler.get(boom_id).await);
        assert_eq!(exploded.status, TaskStatus::Failed);
        assert_eq!(exploded.last_error.as_deref(), Some("handler_panicked"));
        let sent = assert_ok!(h.state.scheduler.get(good_id).await);
        assert_eq!(sent.status, TaskStatus::Completed);

        // the next cycle still runs
        let later = TaskPayload::for_appointment("A", booking.appointment_id, "reminder-2");
        let later_id = assert_ok!(
            h.state
                .scheduler
                .enqueue(templates::RECONFIRMATION, now, later)
                .await
        );
        let report = dispatcher.run_cycle().await;
        assert!(!report.skipped);
        assert_eq!(report.completed, 1);
        let later = assert_ok!(h.state.scheduler.get(later_id).await);
        assert_eq!(later.status, TaskStatus::Completed);
    }

    #[test]
    fn stale_cutoff_handles_huge_ages() {
        let now = Utc::now();
        assert_eq!(stale_cutoff(now, 60), Some(now - Duration::seconds(60)));
        assert_eq!(stale_cutoff(now, u64::MAX), None);
    }
}
