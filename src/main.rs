//! visit-scheduler server entry point.
//!
//! Starts the Axum HTTP server and the background task dispatcher.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use visit_scheduler::api;
use visit_scheduler::app_state::{AppState, Collaborators, Stores};
use visit_scheduler::config::SchedulerConfig;
use visit_scheduler::domain::SystemClock;
use visit_scheduler::persistence::PostgresStore;
use visit_scheduler::store::InMemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config =
        SchedulerConfig::from_env().map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;
    tracing::info!(addr = %config.listen_addr, "starting visit-scheduler");

    // Pick storage
    let stores = if config.persistence_enabled {
        let store = PostgresStore::connect(&config)
            .await
            .context("connecting to PostgreSQL")?;
        store.migrate().await.context("running migrations")?;
        tracing::info!("using PostgreSQL storage");
        Stores::shared(Arc::new(store))
    } else {
        tracing::warn!("persistence disabled; state is lost on restart");
        Stores::shared(Arc::new(InMemoryStore::new()))
    };

    // Build application state
    let app_state = AppState::assemble(
        stores,
        Collaborators::default(),
        Arc::new(SystemClock),
        config.dispatcher,
        config.lifecycle,
    );

    // Start the dispatcher
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = Arc::clone(&app_state.dispatcher).spawn(shutdown_rx);

    // Build router
    let app = Router::new()
        .merge(api::build_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(app_state);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("serving HTTP")?;

    // Let the current dispatch cycle finish
    tracing::info!("shutting down dispatcher");
    if let Err(err) = shutdown_tx.send(true) {
        tracing::warn!(error = %err, "dispatcher was already stopped");
    }
    if let Err(err) = dispatcher.await {
        tracing::error!(error = %err, "dispatcher task ended abnormally");
    }

    Ok(())
}
