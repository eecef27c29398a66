//! # visit-scheduler
//!
//! Deferred task scheduling and appointment lifecycle for study visits.
//!
//! Appointments move through holds, bookings and confirmations. Each step
//! leaves an immutable event in the ledger and schedules the follow-up work
//! it implies (hold expiry, confirmation deadline, reminders, no-show
//! rescue) as tasks. A background dispatcher runs due tasks through the
//! handler registry. Every external effect is gated by an idempotency key,
//! so repeated delivery of a task never repeats the effect.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP)                  Dispatcher (service/)
//!     │                               │ claims due tasks
//!     ├── REST Handlers (api/)        │
//!     │                               ├── HandlerRegistry (handlers/)
//!     ├── AppointmentService ─────────┤
//!     ├── TaskScheduler               │
//!     ├── EventLedger                 │
//!     │                               │
//!     └── Stores (store/): in-memory or PostgreSQL (persistence/)
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod persistence;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
