//! Persistence layer: PostgreSQL ledger, task queue and appointment tables.
//!
//! [`postgres::PostgresStore`] implements every trait in [`crate::store`]
//! on top of `sqlx::PgPool`. The schema lives in `migrations/` and is applied
//! at startup with `sqlx::migrate!`.

pub mod models;
pub mod postgres;

pub use postgres::PostgresStore;
