// Module: http
// Viewer and admin HTTP API

pub mod admin;
pub mod error;
pub mod health;
pub mod live;

use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tvrelay_livestream::StreamingInfrastructure;

pub use error::{AppError, AppResult};

/// Connect timeout for outbound probes
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub streaming: Arc<StreamingInfrastructure>,
    /// Used by the admin source probe
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(streaming: Arc<StreamingInfrastructure>) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            streaming,
            http_client,
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    // Browser players fetch manifests and segments cross-origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::create_health_router())
        .merge(live::create_live_router())
        .merge(admin::create_admin_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
