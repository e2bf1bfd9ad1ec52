//! Decode errors for inbound frames.

/// Reasons an inbound frame could not be turned into a [`ClientMessage`].
///
/// None of these close the connection; the gate answers each one with an
/// `error` frame and keeps reading.
///
/// [`ClientMessage`]: crate::ClientMessage
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not a JSON object or has no string `type` field.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The `type` tag names a message this server does not accept.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A known message type is missing a required field or carries a
    /// field of the wrong shape.
    #[error("invalid `{kind}` message: {reason}")]
    InvalidFields {
        /// The message type tag.
        kind: String,
        /// What the decoder rejected.
        reason: String,
    },

    /// An outbound message could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Text sent back to the peer inside an `error` frame.
    pub fn client_message(&self) -> String {
        match self {
            Self::Malformed(_) => String::from("Invalid message format"),
            Self::UnknownType(kind) => format!("Unknown message type: {kind}"),
            Self::InvalidFields { kind, reason } => format!("Invalid {kind} message: {reason}"),
            Self::Encode(_) => String::from("Internal error"),
        }
    }
}
