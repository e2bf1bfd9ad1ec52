//! Connection gate: the authentication state machine.
//!
//! Every open connection has a session in the gate: `AuthPending`,
//! `Authenticated`, or `Rejected` after a bad token. The authenticated set
//! is exactly the sessions in the `Authenticated` state. `Rejected` is
//! terminal; a later `auth` cannot revive it. A connection leaves the gate
//! only through [`close`], which the transport calls once when the socket
//! ends.
//!
//! [`close`]: ConnectionGate::close

use std::sync::Arc;

use dashmap::DashMap;
use tickstream_protocol::ServerMessage;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionId, ConnectionState, close_code};

/// Result of an `auth` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Token matched; the connection is in the authenticated set.
    Accepted,
    /// Token did not match, or the connection was already rejected. On the
    /// first rejection an `error` was sent and the connection is being
    /// closed with [`close_code::POLICY_VIOLATION`].
    Rejected,
    /// The connection is not known to the gate (already closed).
    UnknownConnection,
}

#[derive(Debug)]
struct Session {
    handle: ConnectionHandle,
    state: ConnectionState,
}

/// Tracks open connections and their authentication state.
#[derive(Debug)]
pub struct ConnectionGate {
    auth_token: String,
    sessions: DashMap<ConnectionId, Session>,
}

impl ConnectionGate {
    /// Create a gate that accepts `auth_token` as the shared secret.
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            sessions: DashMap::new(),
        }
    }

    /// Admit a new connection in `AuthPending` and prompt it for a token.
    pub fn open(&self, handle: ConnectionHandle) {
        let id = handle.id();
        if let Err(e) = handle.send(&ServerMessage::auth_required()) {
            debug!(connection = %id, error = %e, "failed to send auth_required");
        }
        self.sessions.insert(
            id,
            Session {
                handle,
                state: ConnectionState::AuthPending,
            },
        );
        info!(connection = %id, "client connected");
    }

    /// Check `token` against the shared secret.
    ///
    /// A match moves the connection into the authenticated set. A mismatch
    /// drops it from the set (if it was there), marks it `Rejected`, sends
    /// an `error` and asks the transport to close it. A rejected connection
    /// stays rejected whatever it sends afterwards.
    pub fn authenticate(&self, id: ConnectionId, token: &str) -> AuthOutcome {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            return AuthOutcome::UnknownConnection;
        };
        if session.state == ConnectionState::Rejected {
            debug!(connection = %id, "auth from rejected connection ignored");
            return AuthOutcome::Rejected;
        }

        if token == self.auth_token {
            session.state = ConnectionState::Authenticated;
            let handle = session.handle.clone();
            drop(session);
            if let Err(e) = handle.send(&ServerMessage::auth_success()) {
                debug!(connection = %id, error = %e, "failed to send auth_success");
            }
            info!(connection = %id, "client authenticated");
            AuthOutcome::Accepted
        } else {
            session.state = ConnectionState::Rejected;
            let handle = session.handle.clone();
            drop(session);
            if let Err(e) = handle.send(&ServerMessage::error("Invalid authentication token")) {
                debug!(connection = %id, error = %e, "failed to send auth error");
            }
            if let Err(e) = handle.close(close_code::POLICY_VIOLATION, "Authentication failed") {
                warn!(connection = %id, error = %e, "failed to request close after bad token");
            }
            warn!(connection = %id, "authentication failed");
            AuthOutcome::Rejected
        }
    }

    /// Whether `id` is in the authenticated set.
    pub fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.state(id) == ConnectionState::Authenticated
    }

    /// Current state of `id`; unknown connections report `Closed`.
    pub fn state(&self, id: ConnectionId) -> ConnectionState {
        self.sessions
            .get(&id)
            .map_or(ConnectionState::Closed, |s| s.state)
    }

    /// The handle for an open connection.
    pub fn handle(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.sessions.get(&id).map(|s| s.handle.clone())
    }

    /// Remove a connection. Returns its handle if it was still open.
    pub fn close(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.sessions.remove(&id).map(|(_, session)| session.handle)
    }

    /// Handles of every authenticated connection.
    pub fn authenticated(&self) -> Vec<ConnectionHandle> {
        self.sessions
            .iter()
            .filter(|s| s.state == ConnectionState::Authenticated)
            .map(|s| s.handle.clone())
            .collect()
    }

    /// Handles of every open connection, authenticated or not.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.sessions.iter().map(|s| s.handle.clone()).collect()
    }

    /// Send `message` to every authenticated connection.
    ///
    /// The message is encoded once. Returns how many queues accepted it.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        fan_frame(message, &self.authenticated())
    }

    /// Send `message` to every open connection.
    pub fn broadcast_all(&self, message: &ServerMessage) -> usize {
        fan_frame(message, &self.connections())
    }

    /// Size of the authenticated set.
    pub fn authenticated_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state == ConnectionState::Authenticated)
            .count()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }
}

fn fan_frame(message: &ServerMessage, targets: &[ConnectionHandle]) -> usize {
    if targets.is_empty() {
        return 0;
    }
    let frame: Arc<str> = match message.to_frame() {
        Ok(f) => f.into(),
        Err(e) => {
            warn!(kind = message.kind(), error = %e, "failed to encode broadcast");
            return 0;
        }
    };

    targets
        .iter()
        .filter(|handle| match handle.send_frame(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(e) => {
                debug!(kind = message.kind(), error = %e, "broadcast frame not delivered");
                false
            }
        })
        .count()
}
