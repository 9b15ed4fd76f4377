//! Read-only candidate views.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use hostsched_api::{CandidateDetail, CandidateList, K8sCandidate, ResType};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::cache::CandidateQuery;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/candidates", get(list_candidates))
        .route("/candidates/{id}", get(get_candidate))
        .route("/k8s/candidates", get(k8s_candidates))
}

#[derive(Debug, Deserialize)]
pub struct ListCandidatesQuery {
    #[serde(default)]
    pub res_type: Option<ResType>,
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub region_id: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

async fn list_candidates(
    State(state): State<AppState>,
    Query(query): Query<ListCandidatesQuery>,
) -> Json<CandidateList> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let scope = CandidateQuery {
        res_type: query.res_type,
        zone_id: query.zone_id,
        pool_id: query.pool_id,
        region_id: query.region_id,
    };
    Json(state.scheduler().candidate_list(&scope, query.offset, limit))
}

async fn get_candidate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CandidateDetail>, ApiError> {
    state
        .scheduler()
        .candidate_detail(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("candidate_not_found", format!("candidate {id} not found")))
}

#[derive(Debug, Deserialize)]
pub struct K8sQuery {
    /// Comma separated node names.
    #[serde(default)]
    pub nodes: String,
}

async fn k8s_candidates(
    State(state): State<AppState>,
    Query(query): Query<K8sQuery>,
) -> Json<Vec<K8sCandidate>> {
    let nodes: Vec<String> = query
        .nodes
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
    Json(state.scheduler().k8s_candidate_hosts(&nodes))
}
