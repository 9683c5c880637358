// Setup node admin HTTP API
// This file provides the health, statistics and metrics endpoints
//
// Numan Thabit 2025 Nov

use crate::metrics::gather_text;
use crate::setup::{SetupNode, SetupStats};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router as AxumRouter};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with admin endpoints
pub fn create_api_router(node: Arc<SetupNode>) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(health_check))
        .route("/api/v1/stats", get(get_stats))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn get_stats(State(node): State<Arc<SetupNode>>) -> Json<SetupStats> {
    Json(node.stats())
}

async fn get_metrics() -> String {
    gather_text()
}
