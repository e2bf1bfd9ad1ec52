//! Axum transport for the Tickstream telemetry stream.
//!
//! This crate provides the network side of the stream:
//!
//! - **`WebSocket` endpoint** (`/` and `/ws`) adapting each socket to the
//!   core's [`ProtocolHandler`] hooks, with ping-based idle detection
//! - **Status endpoint** (`/api/status`) exposing tick stats and connection
//!   counts read-only
//! - **Lifecycle** ([`TransportServer`]) with bind failures surfaced before
//!   serving and graceful stop on a watch signal
//!
//! [`ProtocolHandler`]: tickstream_core::ProtocolHandler

pub mod handlers;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

pub use router::build_router;
pub use server::{ServerConfig, ServerError, TransportServer, start_server};
pub use state::AppState;
