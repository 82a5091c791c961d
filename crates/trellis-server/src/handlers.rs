//! REST API handlers for the Trellis server

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use axum_extra::extract::Query;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trellis_core::{
    CallObservation, CallRecord, Direction, Edge, GraphStats, MergeError, Node, NodeFilter, NodeId, NodeType, Page,
    QueryError,
};

use crate::ServerState;

/// Errors surfaced to HTTP clients as `{"error": "..."}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Merge(#[from] MergeError),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Query(QueryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Query(QueryError::InvalidLimit { .. }) | ApiError::Merge(_) => StatusCode::BAD_REQUEST,
        };
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: GraphStats,
    pub sequence: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeListParams {
    #[serde(rename = "type", alias = "node_type")]
    pub node_type: Option<String>,
    #[serde(alias = "filepath")]
    pub file: Option<PathBuf>,
    pub name: Option<String>,
    pub synthetic: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl NodeListParams {
    fn filter(&self) -> NodeFilter {
        NodeFilter {
            node_type: self.node_type.clone().map(NodeType::from),
            file_path: self.file.clone(),
            name: self.name.clone(),
            synthetic: self.synthetic,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(alias = "keyword")]
    pub q: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct NodeParams {
    #[serde(alias = "node_id")]
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct EdgeParams {
    #[serde(alias = "node_id")]
    pub id: String,
    #[serde(default)]
    pub direction: Direction,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CallParams {
    #[serde(alias = "node_id")]
    pub id: String,
    pub limit: Option<usize>,
}

/// One observation or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CallBatch {
    One(CallObservation),
    Many(Vec<CallObservation>),
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    let health = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    Json(health)
}

pub async fn stats(State(state): State<Arc<ServerState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        stats: state.query.stats(),
        sequence: state.store().sequence(),
    })
}

pub async fn list_nodes(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<NodeListParams>,
) -> Result<Json<Page<Node>>, ApiError> {
    let limit = params.limit.unwrap_or(state.default_limit);
    let page = state
        .query
        .list_nodes(&params.filter(), limit, params.offset.unwrap_or(0))?;
    Ok(Json(page))
}

pub async fn search_nodes(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Node>>, ApiError> {
    let limit = params.limit.unwrap_or(state.default_limit);
    Ok(Json(state.query.search_nodes(&params.q, limit)?))
}

pub async fn get_node(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<NodeParams>,
) -> Result<Json<Node>, ApiError> {
    Ok(Json(state.query.get_node_details(&NodeId::from(params.id))?))
}

pub async fn list_edges(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<EdgeParams>,
) -> Result<Json<Page<Edge>>, ApiError> {
    let limit = params.limit.unwrap_or(state.default_limit);
    let page = state.query.list_edges_for_node(
        &NodeId::from(params.id),
        params.direction,
        limit,
        params.offset.unwrap_or(0),
    )?;
    Ok(Json(page))
}

pub async fn callers(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<CallParams>,
) -> Result<Json<Vec<Node>>, ApiError> {
    let limit = params.limit.unwrap_or(state.default_limit);
    Ok(Json(state.query.find_functions_calling(&NodeId::from(params.id), limit)?))
}

pub async fn callees(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<CallParams>,
) -> Result<Json<Vec<Node>>, ApiError> {
    let limit = params.limit.unwrap_or(state.default_limit);
    Ok(Json(state.query.find_functions_called_by(&NodeId::from(params.id), limit)?))
}

/// Fold runtime call observations into the graph.
pub async fn record_calls(
    State(state): State<Arc<ServerState>>,
    Json(batch): Json<CallBatch>,
) -> Result<Json<Vec<CallRecord>>, ApiError> {
    let observations = match batch {
        CallBatch::One(observation) => vec![observation],
        CallBatch::Many(observations) => observations,
    };
    Ok(Json(state.merge.record_all(&observations)?))
}
