//! Wire protocol for the Tickstream telemetry stream.
//!
//! Every frame exchanged over a connection is one JSON object carrying a
//! `type` tag. This crate defines the two directions as closed sum types:
//!
//! - [`ClientMessage`] -- frames an agent process sends to the server
//!   (`auth`, `register_bot`, `request_sensors`, `heartbeat`).
//! - [`ServerMessage`] -- frames the server pushes (handshake responses,
//!   per-agent `sensor_update`, and the clock/milestone events).
//!
//! Inbound frames are decoded exactly once, at the protocol boundary, by
//! [`decode_client_message`]. Everything past that point works with typed
//! variants.
//!
//! # Modules
//!
//! - [`error`] -- [`ProtocolError`] taxonomy for undecodable frames.
//! - [`message`] -- the message enums and their constructors.
//! - [`telemetry`] -- [`Position`] and the opaque [`TelemetrySnapshot`].

pub mod error;
pub mod message;
pub mod telemetry;

pub use error::ProtocolError;
pub use message::{ClientMessage, ServerMessage, decode_client_message};
pub use telemetry::{Position, TelemetrySnapshot};

/// Current wall-clock time in milliseconds since the UNIX epoch.
///
/// All `timestamp` fields on the wire use this representation.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
