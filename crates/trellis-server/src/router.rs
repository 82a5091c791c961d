//! Axum router setup for the Trellis server

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use crate::{
    ServerState, agent,
    handlers::{callees, callers, get_node, health_check, list_edges, list_nodes, record_calls, search_nodes, stats},
    websocket::ws_handler,
};

/// Create the axum router with all routes
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/health", get(health_check))
        .route("/api/stats", get(stats))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/search", get(search_nodes))
        .route("/api/node", get(get_node))
        .route("/api/edges", get(list_edges))
        .route("/api/callers", get(callers))
        .route("/api/callees", get(callees))
        .route("/api/calls", post(record_calls))
        .route("/api/agent/tools", get(agent::list_tools))
        .route("/api/agent", post(agent::call_tool))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
