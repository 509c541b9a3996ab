pub mod daemons;
pub mod deployments;
pub mod engines;
pub mod firewall;
pub mod health;
pub mod jobs;
pub mod progress;
pub mod schemas;
pub mod servers;
pub mod sites;
pub mod tasks;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(servers::router())
                .merge(firewall::router())
                .merge(engines::router())
                .merge(schemas::router())
                .merge(daemons::router())
                .merge(tasks::router())
                .merge(sites::router())
                .merge(deployments::router())
                .merge(progress::router())
                .merge(jobs::router())
                .merge(crate::openapi::router()),
        )
        .with_state(state)
}

#[cfg(test)]
mod surface_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::OnceLock;
    use tower::ServiceExt;

    static STATE: OnceLock<AppState> = OnceLock::new();

    fn state() -> AppState {
        STATE.get_or_init(crate::test_support::test_state).clone()
    }

    async fn send(request: Request<Body>) -> axum::http::Response<Body> {
        router(state()).oneshot(request).await.unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn healthz_answers_without_a_database() {
        let resp = send(get_request("/healthz")).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let resp = send(get_request("/api/openapi.json")).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_server_id_is_rejected_before_any_query() {
        let resp = send(get_request("/api/servers/not-a-uuid")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_entity_id_is_rejected_before_any_query() {
        let resp = send(get_request("/api/entities/42/progress")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_job_id_is_rejected_before_any_query() {
        let resp = send(get_request("/api/jobs/42")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_server_rejects_blank_name() {
        let resp = send(
            Request::builder()
                .method("POST")
                .uri("/api/servers")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name": "  ", "address": "192.0.2.9"}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_server_rejects_address_with_whitespace() {
        let resp = send(
            Request::builder()
                .method("POST")
                .uri("/api/servers")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name": "web-1", "address": "192.0.2.9 --"}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
