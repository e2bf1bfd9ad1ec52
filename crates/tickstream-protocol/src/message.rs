//! Typed message catalogue.
//!
//! Both enums are internally tagged on `type` with `snake_case` tags and
//! `camelCase` field names, so `ServerMessage::RegistrationSuccess` goes
//! out as `{"type":"registration_success","botName":..,"message":..}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::now_millis;
use crate::telemetry::TelemetrySnapshot;

/// Frames accepted from a connected agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Present the shared secret.
    Auth {
        /// The token compared against the configured secret.
        token: String,
    },

    /// Bind this connection to a logical agent name.
    RegisterBot {
        /// The agent name. An empty name is rejected by the registry.
        #[serde(default)]
        bot_name: String,
        /// Free-form agent kind reported by the client.
        #[serde(default)]
        agent_type: Option<String>,
    },

    /// Ask for telemetry for the bound agent.
    RequestSensors,

    /// Liveness probe; answered with a server `heartbeat`.
    Heartbeat,
}

impl ClientMessage {
    /// Type tags [`decode_client_message`] recognises.
    pub const TYPES: [&'static str; 4] = ["auth", "register_bot", "request_sensors", "heartbeat"];

    /// The wire tag of this message.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::RegisterBot { .. } => "register_bot",
            Self::RequestSensors => "request_sensors",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Decode one inbound text frame.
///
/// The frame must be a JSON object with a string `type` tag naming one of
/// [`ClientMessage::TYPES`]; the remaining fields are then checked against
/// that variant.
///
/// # Errors
///
/// - [`ProtocolError::Malformed`] for non-JSON input, non-object JSON, or a
///   missing/non-string `type`.
/// - [`ProtocolError::UnknownType`] when the tag is not recognised.
/// - [`ProtocolError::InvalidFields`] when a known type is missing a
///   required field.
pub fn decode_client_message(frame: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed(String::from("frame is not a JSON object")))?
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed(String::from("missing string `type` field")))?
        .to_owned();

    if !ClientMessage::TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidFields {
        kind,
        reason: e.to_string(),
    })
}

/// Frames pushed by the server.
///
/// Values are built once, serialized once with [`to_frame`](Self::to_frame),
/// and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent immediately after a connection opens.
    AuthRequired {
        /// Human-readable prompt.
        message: String,
    },

    /// The token matched; the connection is authenticated.
    AuthSuccess {
        /// Human-readable confirmation.
        message: String,
    },

    /// A request was rejected.
    Error {
        /// What went wrong.
        message: String,
    },

    /// The connection is now bound to `bot_name`.
    RegistrationSuccess {
        /// The bound agent name.
        bot_name: String,
        /// Human-readable confirmation.
        message: String,
    },

    /// Acknowledges a `request_sensors` from a bound connection.
    SensorRequestReceived {
        /// The agent name bound to the requesting connection.
        bot_name: String,
    },

    /// Reply to a client heartbeat.
    Heartbeat {
        /// Server time in epoch milliseconds.
        timestamp: i64,
    },

    /// Per-agent telemetry pushed by the fan-out engine.
    SensorUpdate {
        /// The agent this snapshot belongs to.
        bot_name: String,
        /// Server time in epoch milliseconds.
        timestamp: i64,
        /// The provider's snapshot.
        data: TelemetrySnapshot,
    },

    /// Clock event broadcast to every authenticated connection.
    ServerTick {
        /// The tick counter value.
        tick: u64,
        /// Server time in epoch milliseconds.
        timestamp: i64,
        /// Measured ticks per second.
        tps: f64,
        /// Number of peers currently present in the simulation.
        online_players: usize,
    },

    /// Periodic state-saving milestone.
    Checkpoint {
        /// The tick counter value.
        tick: u64,
        /// Server time in epoch milliseconds.
        timestamp: i64,
        /// Ticks elapsed since the previous checkpoint.
        ticks_since_last_checkpoint: u64,
    },

    /// Periodic population-update milestone.
    Evolution {
        /// The tick counter value.
        tick: u64,
        /// Server time in epoch milliseconds.
        timestamp: i64,
        /// Ticks elapsed since the previous evolution event.
        ticks_since_last_evolution: u64,
    },

    /// The server is going away; a close frame follows.
    ServerShutdown {
        /// Human-readable notice.
        message: String,
    },
}

impl ServerMessage {
    /// `auth_required` with the standard prompt.
    pub fn auth_required() -> Self {
        Self::AuthRequired {
            message: String::from("Please send auth token"),
        }
    }

    /// `auth_success` with the standard confirmation.
    pub fn auth_success() -> Self {
        Self::AuthSuccess {
            message: String::from("Authentication successful"),
        }
    }

    /// An `error` frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// `registration_success` for `bot_name`.
    pub fn registration_success(bot_name: impl Into<String>) -> Self {
        Self::RegistrationSuccess {
            bot_name: bot_name.into(),
            message: String::from("Bot registered successfully"),
        }
    }

    /// `heartbeat` stamped with the current time.
    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: now_millis(),
        }
    }

    /// `sensor_update` stamped with the current time.
    pub fn sensor_update(bot_name: impl Into<String>, data: TelemetrySnapshot) -> Self {
        Self::SensorUpdate {
            bot_name: bot_name.into(),
            timestamp: now_millis(),
            data,
        }
    }

    /// `server_shutdown` with the standard notice.
    pub fn server_shutdown() -> Self {
        Self::ServerShutdown {
            message: String::from("Server is shutting down"),
        }
    }

    /// The wire tag of this message.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AuthRequired { .. } => "auth_required",
            Self::AuthSuccess { .. } => "auth_success",
            Self::Error { .. } => "error",
            Self::RegistrationSuccess { .. } => "registration_success",
            Self::SensorRequestReceived { .. } => "sensor_request_received",
            Self::Heartbeat { .. } => "heartbeat",
            Self::SensorUpdate { .. } => "sensor_update",
            Self::ServerTick { .. } => "server_tick",
            Self::Checkpoint { .. } => "checkpoint",
            Self::Evolution { .. } => "evolution",
            Self::ServerShutdown { .. } => "server_shutdown",
        }
    }

    /// Serialize to a single JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}
