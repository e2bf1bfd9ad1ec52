//! REST handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use tickstream_core::TickStats;

use crate::state::AppState;

/// Body of `GET /api/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Tick driver counters.
    #[serde(flatten)]
    pub ticks: TickStats,
    /// Connections in the authenticated set.
    pub authenticated_clients: usize,
    /// All open connections, authenticated or not.
    pub open_connections: usize,
    /// Number of bound agent names.
    pub registered_bots: usize,
    /// Bound agent names in sorted order.
    pub bot_names: Vec<String>,
}

/// Read-only snapshot of the stream's state.
///
/// # Route
///
/// `GET /api/status`
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let handler = &state.handler;
    let bot_names: Vec<String> = handler.registry().bound_names().into_iter().collect();
    Json(StatusResponse {
        ticks: handler.driver().stats(),
        authenticated_clients: handler.gate().authenticated_count(),
        open_connections: handler.gate().connection_count(),
        registered_bots: bot_names.len(),
        bot_names,
    })
}
