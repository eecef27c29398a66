//! Service layer: business logic orchestration.
//!
//! [`EventLedger`] is the idempotency gate, [`TaskScheduler`] and
//! [`Dispatcher`] own the deferred-task queue, and [`AppointmentService`]
//! enforces the appointment lifecycle. Outbound systems are reached through
//! the traits in [`collaborators`].

pub mod appointments;
pub mod collaborators;
pub mod dispatcher;
pub mod ledger;
pub mod scheduler;

pub use appointments::{
    AppointmentService, BookingRequest, HoldRequest, TeachBackOutcome, Transition,
};
pub use dispatcher::{CycleReport, Dispatcher};
pub use ledger::EventLedger;
pub use scheduler::TaskScheduler;
