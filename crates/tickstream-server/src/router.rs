//! Axum router construction.
//!
//! The stream is served at both `/` and `/ws` so clients written against
//! either path connect unchanged.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete router.
///
/// - `GET /` -- `WebSocket` telemetry stream
/// - `GET /ws` -- same stream
/// - `GET /api/status` -- tick stats, connection and binding counts
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(ws::ws_stream))
        .route("/ws", get(ws::ws_stream))
        .route("/api/status", get(handlers::status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
