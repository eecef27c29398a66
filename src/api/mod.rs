//! REST API layer: route handlers, DTOs, and router composition.
//!
//! Resource endpoints are mounted under `/api/v1`; system endpoints sit at
//! the root.

pub mod dto;
pub mod handlers;
pub mod openapi;

use axum::Router;

use crate::app_state::AppState;

/// Builds the complete API router with all REST endpoints.
pub fn build_router() -> Router<AppState> {
    let router = Router::new()
        .nest("/api/v1", handlers::routes())
        .merge(handlers::system::routes());

    #[cfg(feature = "swagger-ui")]
    let router = {
        use utoipa::OpenApi;
        router.merge(
            utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", openapi::ApiDoc::openapi()),
        )
    };

    router
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::Clock;
    use crate::test_support::Harness;
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use tokio_test::assert_ok;

    async fn serve(h: &Harness) -> SocketAddr {
        let app = build_router().with_state(h.state.clone());
        let listener = assert_ok!(tokio::net::TcpListener::bind("127.0.0.1:0").await);
        let addr = assert_ok!(listener.local_addr());
        tokio::spawn(async move { axum::serve(listener, app).await });
        addr
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let h = Harness::new();
        let addr = serve(&h).await;
        let resp = assert_ok!(reqwest::get(format!("http://{addr}/health")).await);
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = assert_ok!(resp.json().await);
        assert_eq!(body.get("status"), Some(&json!("healthy")));
    }

    #[tokio::test]
    async fn execute_runs_a_handler_once_per_key() {
        let h = Harness::new();
        let addr = serve(&h).await;
        let client = reqwest::Client::new();

        let booked = assert_ok!(
            client
                .post(format!("http://{addr}/api/v1/appointments"))
                .json(&json!({
                    "owner_id": "participant-1",
                    "resource_key": "trial-7/site-2/room-a",
                    "slot_start": (h.clock.now() + chrono::Duration::days(2)).to_rfc3339(),
                    "visit_type": "screening",
                }))
                .send()
                .await
        );
        assert_eq!(booked.status(), reqwest::StatusCode::CREATED);
        let appointment: Value = assert_ok!(booked.json().await);
        let Some(id) = appointment.get("appointment_id").cloned() else {
            panic!("booking must return its id");
        };

        let request = json!({
            "template_id": "reconfirmation",
            "subject_id": "participant-1",
            "idempotency_key": "manual-reminder-1",
            "related_appointment_id": id,
        });
        let mut statuses = Vec::new();
        for _ in 0..2 {
            let resp = assert_ok!(
                client
                    .post(format!("http://{addr}/api/v1/tasks/execute"))
                    .json(&request)
                    .send()
                    .await
            );
            assert_eq!(resp.status(), reqwest::StatusCode::OK);
            let body: Value = assert_ok!(resp.json().await);
            assert_eq!(body.get("processed"), Some(&json!(true)));
            statuses.push(body.pointer("/outcome/status").cloned());
        }
        assert_eq!(
            statuses,
            vec![Some(json!("sent")), Some(json!("already_applied"))]
        );
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn unknown_template_is_not_found() {
        let h = Harness::new();
        let addr = serve(&h).await;
        let resp = assert_ok!(
            reqwest::Client::new()
                .post(format!("http://{addr}/api/v1/tasks/execute"))
                .json(&json!({
                    "template_id": "send_fax",
                    "subject_id": "participant-1",
                    "idempotency_key": "fax-1",
                }))
                .send()
                .await
        );
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = assert_ok!(resp.json().await);
        assert_eq!(body.pointer("/error/code"), Some(&json!(2003)));
    }

    #[tokio::test]
    async fn taken_slot_conflicts() {
        let h = Harness::new();
        let addr = serve(&h).await;
        let client = reqwest::Client::new();
        let body = json!({
            "owner_id": "participant-1",
            "resource_key": "trial-7/site-2/room-b",
            "slot_start": (h.clock.now() + chrono::Duration::days(1)).to_rfc3339(),
        });

        let first = assert_ok!(
            client
                .post(format!("http://{addr}/api/v1/appointments/holds"))
                .json(&body)
                .send()
                .await
        );
        assert_eq!(first.status(), reqwest::StatusCode::CREATED);
        let second = assert_ok!(
            client
                .post(format!("http://{addr}/api/v1/appointments"))
                .json(&body)
                .send()
                .await
        );
        assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
    }
}
