//! Health check endpoints
//!
//! Provides simple health check for monitoring probes.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub node_id: String,
    pub local_streams: usize,
}

/// Readiness with a little node context
pub async fn readiness_check(State(state): State<AppState>) -> Json<ReadinessResponse> {
    Json(ReadinessResponse {
        status: "ok",
        node_id: state.streaming.node_id.clone(),
        local_streams: state.streaming.registry.local_count(),
    })
}
