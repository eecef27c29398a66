//! In-memory wiring and recording collaborators shared by unit tests.

#![allow(clippy::panic)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::app_state::{AppState, Collaborators, Stores};
use crate::config::{DispatcherConfig, LifecycleConfig};
use crate::domain::{Appointment, Clock, ManualClock, TaskPayload};
use crate::error::SchedulerError;
use crate::handlers::HandlerOutcome;
use crate::service::collaborators::{
    CallbackTicket, CallbackTicketSink, Notifier, OpenAvailability, OutboundMessage,
};
use crate::service::{BookingRequest, HoldRequest};
use crate::store::InMemoryStore;

/// Notifier that keeps every message and can be told to fail once.
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<OutboundMessage>>,
    fail_next: AtomicBool,
}

impl RecordingNotifier {
    pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SchedulerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::HandlerFailure("provider down".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}

/// Ticket sink that keeps every ticket and can be told to fail once.
#[derive(Debug, Default)]
pub(crate) struct RecordingTicketSink {
    created: Mutex<Vec<CallbackTicket>>,
    fail_next: AtomicBool,
}

impl RecordingTicketSink {
    pub(crate) fn created(&self) -> Vec<CallbackTicket> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CallbackTicketSink for RecordingTicketSink {
    async fn create_ticket(&self, ticket: &CallbackTicket) -> Result<String, SchedulerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::HandlerFailure("ticket sink down".to_string()));
        }
        let mut created = self.created.lock().unwrap_or_else(PoisonError::into_inner);
        created.push(ticket.clone());
        Ok(format!("T-{}", created.len()))
    }
}

/// Fully wired in-memory application on a manual clock.
#[derive(Debug)]
pub(crate) struct Harness {
    pub(crate) store: Arc<InMemoryStore>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) tickets: Arc<RecordingTicketSink>,
    pub(crate) state: AppState,
}

impl Harness {
    /// 2026-10-27T08:53:20Z, a fixed start so slot keys are stable.
    pub(crate) fn start() -> DateTime<Utc> {
        let Some(start) = DateTime::from_timestamp(1_793_091_200, 0) else {
            panic!("valid timestamp");
        };
        start
    }

    pub(crate) fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Self::start()));
        let notifier = Arc::new(RecordingNotifier::default());
        let tickets = Arc::new(RecordingTicketSink::default());
        let state = AppState::assemble(
            Stores::shared(Arc::clone(&store)),
            Collaborators {
                notifier: Arc::clone(&notifier) as Arc<dyn Notifier>,
                availability: Arc::new(OpenAvailability),
                tickets: Arc::clone(&tickets) as Arc<dyn CallbackTicketSink>,
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
            DispatcherConfig::default(),
            LifecycleConfig::default(),
        );
        Self {
            store,
            clock,
            notifier,
            tickets,
            state,
        }
    }

    fn slot_for(owner: &str) -> String {
        format!("trial-7/site-2/{owner}")
    }

    /// Books a slot three days out for `owner` (slot key derived from it).
    pub(crate) async fn book(&self, owner: &str) -> Appointment {
        let request = BookingRequest {
            owner_id: owner.to_string(),
            resource_key: Self::slot_for(owner),
            slot_start: self.clock.now() + Duration::days(3),
            visit_type: Some("screening".to_string()),
        };
        let Ok(booking) = self.state.appointments.book_direct(request).await else {
            panic!("booking should succeed");
        };
        booking
    }

    /// Places a hold three days out for `owner` (slot key derived from it).
    pub(crate) async fn hold(&self, owner: &str) -> Appointment {
        let request = HoldRequest {
            owner_id: owner.to_string(),
            resource_key: Self::slot_for(owner),
            slot_start: self.clock.now() + Duration::days(3),
        };
        let Ok(hold) = self.state.appointments.create_hold(request).await else {
            panic!("hold should succeed");
        };
        hold
    }

    pub(crate) async fn dispatch(
        &self,
        template_id: &str,
        payload: &TaskPayload,
    ) -> Result<HandlerOutcome, SchedulerError> {
        self.state.registry.dispatch(template_id, payload).await
    }
}
