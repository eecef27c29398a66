//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::config::{DispatcherConfig, LifecycleConfig};
use crate::domain::Clock;
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::service::collaborators::{
    AvailabilityProvider, CallbackTicketSink, LoggingNotifier, LoggingTicketSink, Notifier,
    OpenAvailability,
};
use crate::service::{AppointmentService, Dispatcher, EventLedger, TaskScheduler};
use crate::store::{AppointmentStore, LedgerStore, TaskStore};

/// The three storage seams the services run on.
#[derive(Debug, Clone)]
pub struct Stores {
    /// Ledger storage.
    pub ledger: Arc<dyn LedgerStore>,
    /// Task queue storage.
    pub tasks: Arc<dyn TaskStore>,
    /// Appointment storage.
    pub appointments: Arc<dyn AppointmentStore>,
}

impl Stores {
    /// Uses one backend for all three seams.
    #[must_use]
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: LedgerStore + TaskStore + AppointmentStore + 'static,
    {
        Self {
            ledger: Arc::clone(&store) as Arc<dyn LedgerStore>,
            tasks: Arc::clone(&store) as Arc<dyn TaskStore>,
            appointments: store as Arc<dyn AppointmentStore>,
        }
    }
}

/// External systems the services call out to.
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Message delivery.
    pub notifier: Arc<dyn Notifier>,
    /// Slot availability.
    pub availability: Arc<dyn AvailabilityProvider>,
    /// Human follow-up tickets.
    pub tickets: Arc<dyn CallbackTicketSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LoggingNotifier),
            availability: Arc::new(OpenAvailability),
            tickets: Arc::new(LoggingTicketSink),
        }
    }
}

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Event ledger and audit projections.
    pub ledger: EventLedger,
    /// Task enqueue and inspection.
    pub scheduler: TaskScheduler,
    /// Appointment lifecycle.
    pub appointments: Arc<AppointmentService>,
    /// Template id to handler map.
    pub registry: Arc<HandlerRegistry>,
    /// Background dispatcher.
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    /// Wires every service over `stores`.
    #[must_use]
    pub fn assemble(
        stores: Stores,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        dispatcher: DispatcherConfig,
        lifecycle: LifecycleConfig,
    ) -> Self {
        let ledger = EventLedger::new(stores.ledger, Arc::clone(&clock));
        let scheduler = TaskScheduler::new(Arc::clone(&stores.tasks), Arc::clone(&clock));
        let appointments = Arc::new(AppointmentService::new(
            stores.appointments,
            ledger.clone(),
            scheduler.clone(),
            collaborators.availability,
            Arc::clone(&clock),
            lifecycle,
        ));
        let registry = Arc::new(HandlerRegistry::standard(HandlerContext {
            ledger: ledger.clone(),
            appointments: Arc::clone(&appointments),
            scheduler: scheduler.clone(),
            notifier: collaborators.notifier,
            tickets: collaborators.tickets,
            clock: Arc::clone(&clock),
        }));
        let dispatcher = Arc::new(Dispatcher::new(
            stores.tasks,
            Arc::clone(&registry),
            clock,
            dispatcher,
        ));

        Self {
            ledger,
            scheduler,
            appointments,
            registry,
            dispatcher,
        }
    }
}
