//! Scheduling and reconciliation endpoints.

use axum::{extract::State, routing::post, Json, Router};
use hostsched_api::{
    CleanupArgs, CleanupResult, CompletedNotifyArgs, CompletedNotifyResult, ExpireRequest,
    ExpireResult, ForecastResult, ScheduleInput, ScheduleOutput,
};

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/scheduler", post(schedule))
        .route("/scheduler/forecast", post(forecast))
        .route("/expire", post(expire))
        .route("/completed", post(completed))
        .route("/cleanup", post(cleanup))
}

/// Place servers. Servers that do not fit come back as per-entry errors
/// with a 200.
async fn schedule(
    State(state): State<AppState>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<ScheduleOutput>, ApiError> {
    Ok(Json(state.scheduler().schedule(input).await?))
}

async fn forecast(
    State(state): State<AppState>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<ForecastResult>, ApiError> {
    Ok(Json(state.scheduler().forecast(input).await?))
}

async fn expire(
    State(state): State<AppState>,
    Json(request): Json<ExpireRequest>,
) -> Result<Json<ExpireResult>, ApiError> {
    Ok(Json(state.scheduler().expire(request).await?))
}

async fn completed(
    State(state): State<AppState>,
    Json(args): Json<CompletedNotifyArgs>,
) -> Result<Json<CompletedNotifyResult>, ApiError> {
    Ok(Json(state.scheduler().completed_notify(args)?))
}

async fn cleanup(
    State(state): State<AppState>,
    Json(args): Json<CleanupArgs>,
) -> Result<Json<CleanupResult>, ApiError> {
    Ok(Json(state.scheduler().cleanup(args).await?))
}
