//! REST endpoint handlers organized by resource.

pub mod appointments;
pub mod system;
pub mod tasks;

use axum::Router;

use crate::app_state::AppState;

/// Composes all resource routes under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(tasks::routes())
        .merge(appointments::routes())
}
