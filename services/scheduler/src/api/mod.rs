//! HTTP API handlers and routing.

mod candidates;
pub mod error;
mod health;
mod history;
mod schedule;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Main router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .merge(schedule::routes())
        .merge(candidates::routes())
        .merge(history::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::candidate::testing::host;
    use crate::manager::{SchedulerConfig, SchedulerManager};
    use crate::source::MemorySource;

    async fn router() -> Router {
        let source = MemorySource::new();
        source.upsert(host("h1", 4, 8192)).unwrap();
        let (manager, _workers) =
            SchedulerManager::new(SchedulerConfig::default(), Arc::new(source)).unwrap();
        manager.load().await.unwrap();
        create_router(AppState::new(manager))
    }

    #[tokio::test]
    async fn test_history_item_not_found() {
        let response = router()
            .await
            .oneshot(Request::get("/history/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let problem: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(problem["code"], "history_not_found");
    }

    #[tokio::test]
    async fn test_k8s_candidates_splits_node_list() {
        let response = router()
            .await
            .oneshot(
                Request::get("/k8s/candidates?nodes=n1,n2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let hosts: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(hosts, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_readyz_reports_reload_cutoffs() {
        let app = router().await;
        let response = app
            .clone()
            .oneshot(
                Request::post("/cleanup")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(health["components"]["last_reload_all_at"].is_string());
        assert!(health["components"].get("last_reload_at").is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let response = router()
            .await
            .oneshot(
                Request::post("/scheduler")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{\"count\": \"many\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
