// src/server/routes.rs
//! Axum router for the manual trigger

use crate::server::handlers;
use crate::server::SharedState;
use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

/// Create the trigger router
///
/// Handlers read the peer address from `ConnectInfo<SocketAddr>`, so serve
/// it with `into_make_service_with_connect_info`.
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/update", get(handlers::trigger::trigger))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
