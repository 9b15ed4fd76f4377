use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::history::{HistoryItem, HistoryPage};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/history", get(list_history))
        .route("/history/{task_id}", get(get_history))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Include suggestion-only calls.
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryPage> {
    Json(
        state
            .scheduler()
            .history()
            .list(query.all, query.offset, query.limit),
    )
}

async fn get_history(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<HistoryItem>, ApiError> {
    state
        .scheduler()
        .history()
        .get(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("history_not_found", format!("task {task_id} not found")))
}
