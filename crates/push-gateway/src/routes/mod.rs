//! HTTP routes besides the WebSocket upgrade.

pub mod health;
pub mod metrics;
pub mod push;

use axum::Router;

use crate::state::AppState;

/// Routes:
/// - GET  /api/health - Health check with registry size
/// - GET  /api/presence/{uid} - Online flag and connection count
/// - POST /api/push/{uid} - Push a payload to every connection of a user
/// - GET  /metrics - Prometheus scrape endpoint
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", push::router())
        .merge(metrics::router())
}
