pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod state;
pub mod transport;
pub mod ws;

use axum::{routing::get, Router};
use state::AppState;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use connection::{ConnectionId, TeardownReason, UserId};
pub use dispatcher::{DeliveryReport, PushDispatcher};
pub use registry::SessionRegistry;
pub use transport::Payload;

pub fn app(state: AppState) -> Router {
    // Web clients connect from their own origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/websocket", get(ws::ws_handler))
        .merge(routes::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
