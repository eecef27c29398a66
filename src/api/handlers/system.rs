//! System endpoints: health check, handler catalog, manual dispatch.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::service::CycleReport;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
}

/// `GET /health`: service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns service health status, version, and current timestamp.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Registered task templates.
#[derive(Debug, Serialize, ToSchema)]
pub struct TemplateCatalog {
    templates: Vec<&'static str>,
}

/// `GET /config/templates`: list handler templates the dispatcher knows.
#[utoipa::path(
    get,
    path = "/config/templates",
    tag = "System",
    summary = "List task templates",
    description = "Returns every template id that has a registered handler. Tasks with any other template fail at dispatch.",
    responses(
        (status = 200, description = "Template catalog", body = TemplateCatalog),
    )
)]
pub async fn templates_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(TemplateCatalog {
            templates: state.registry.templates(),
        }),
    )
}

/// `POST /admin/dispatch`: run one dispatch cycle now.
#[utoipa::path(
    post,
    path = "/admin/dispatch",
    tag = "System",
    summary = "Run a dispatch cycle",
    description = "Runs one dispatcher cycle immediately. Reports `skipped` if the background loop is mid-cycle.",
    responses(
        (status = 200, description = "Cycle report", body = CycleReport),
    )
)]
pub async fn dispatch_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.dispatcher.run_cycle().await;
    (StatusCode::OK, Json(report))
}

/// System routes mounted at the root level (not under /api/v1).
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/config/templates", get(templates_handler))
        .route("/admin/dispatch", post(dispatch_handler))
}
