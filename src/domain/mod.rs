//! Domain layer: identifiers, time source, ledger events, scheduled tasks
//! and the appointment lifecycle rules.
//!
//! Everything here is storage-agnostic. The [`crate::store`] traits and the
//! [`crate::service`] layer build on these types.

pub mod appointment;
pub mod clock;
pub mod event;
pub mod ids;
pub mod task;

pub use appointment::{Appointment, AppointmentStatus, LifecycleAction};
pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{AppendOutcome, LedgerEvent, NewEvent};
pub use ids::{AppointmentId, EventId, TaskId};
pub use task::{ScheduledTask, TaskPayload, TaskStatus};
