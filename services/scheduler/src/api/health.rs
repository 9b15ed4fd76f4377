//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use hostsched_api::ResType;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    /// Inventory source the cache reloads from.
    pub source: ComponentStatus,
    pub candidate_cache: ComponentStatus,
    /// Cutoff of the last partial reload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reload_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reload_all_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok" or "unavailable".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentStatus {
    fn from_check(ok: bool, message: Option<String>) -> Self {
        Self {
            status: if ok { "ok" } else { "unavailable" }.to_string(),
            message,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "hostsched".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Ready once the cache holds a full snapshot and the source answers.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = state.scheduler();
    let source = scheduler.cache().source().health_check().await;
    let source_ok = source.is_ok();
    let ready = scheduler.is_ready();

    let cache_message = if ready {
        Some(format!(
            "{} hosts, {} baremetals",
            scheduler.cache().len(ResType::Host),
            scheduler.cache().len(ResType::Baremetal)
        ))
    } else {
        Some("initial load not complete".to_string())
    };

    let all_ok = source_ok && ready;
    let response = HealthResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        service: "hostsched".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(ComponentHealth {
            source: ComponentStatus::from_check(source_ok, source.err().map(|e| e.to_string())),
            candidate_cache: ComponentStatus::from_check(ready, cache_message),
            last_reload_at: scheduler.ledger().get_reload_start_time(),
            last_reload_all_at: scheduler.ledger().get_reload_all_start_time(),
        }),
    };

    if all_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
