//! Transport-agnostic protocol handler.
//!
//! A transport adapter owns the sockets and calls three hooks:
//! [`on_open`](ProtocolHandler::on_open) when a peer connects,
//! [`on_message`](ProtocolHandler::on_message) for every text frame and
//! [`on_close`](ProtocolHandler::on_close) exactly once when the socket
//! ends for any reason. Replies go out through the connection's
//! [`ConnectionHandle`]; the handler never touches the socket.

use std::sync::Arc;

use tickstream_protocol::{ClientMessage, ServerMessage, decode_client_message};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionId, ConnectionState, close_code};
use crate::gate::{AuthOutcome, ConnectionGate};
use crate::registry::{AgentRegistry, RegistryError};
use crate::tick::TickDriver;

const NOT_REGISTERED: &str = "Bot not registered";

/// Dispatches decoded client messages to the gate, registry and driver.
pub struct ProtocolHandler {
    gate: Arc<ConnectionGate>,
    registry: Arc<AgentRegistry>,
    driver: Arc<TickDriver>,
}

impl ProtocolHandler {
    /// Wire a handler to its collaborators.
    pub fn new(gate: Arc<ConnectionGate>, registry: Arc<AgentRegistry>, driver: Arc<TickDriver>) -> Self {
        Self {
            gate,
            registry,
            driver,
        }
    }

    /// A peer connected. Sends `auth_required`.
    pub fn on_open(&self, handle: ConnectionHandle) {
        self.gate.open(handle);
    }

    /// Handle one inbound text frame from `id`.
    pub fn on_message(&self, id: ConnectionId, frame: &str) {
        let Some(handle) = self.gate.handle(id) else {
            debug!(connection = %id, "frame from unknown connection ignored");
            return;
        };
        if self.gate.state(id) == ConnectionState::Rejected {
            debug!(connection = %id, "frame from rejected connection ignored");
            return;
        }

        let message = match decode_client_message(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection = %id, error = %e, "undecodable frame");
                reply(&handle, &ServerMessage::error(e.client_message()));
                return;
            }
        };
        debug!(connection = %id, kind = message.kind(), "message received");

        match message {
            ClientMessage::Auth { token } => {
                if self.gate.authenticate(id, &token) == AuthOutcome::Rejected {
                    // A previously bound name must not outlive the session.
                    self.release(id);
                }
            }
            ClientMessage::RegisterBot { bot_name, agent_type } => {
                let previous = self.registry.name_of(id);
                match self.registry.bind(id, &bot_name) {
                    Ok(_) => {
                        if let Some(previous) = previous.filter(|p| *p != bot_name) {
                            self.driver.forget_agent(&previous);
                        }
                        info!(
                            connection = %id,
                            bot_name = %bot_name,
                            agent_type = agent_type.as_deref().unwrap_or("unknown"),
                            "bot registration accepted"
                        );
                        reply(&handle, &ServerMessage::registration_success(bot_name));
                    }
                    Err(e) => reply(&handle, &ServerMessage::error(e.to_string())),
                }
            }
            ClientMessage::RequestSensors => {
                if !self.gate.is_authenticated(id) {
                    reply(&handle, &ServerMessage::error(RegistryError::NotAuthenticated.to_string()));
                    return;
                }
                let Some(bot_name) = self.registry.name_of(id) else {
                    reply(&handle, &ServerMessage::error(NOT_REGISTERED));
                    return;
                };
                self.driver
                    .record_agent_action(&bot_name, self.driver.current_tick());
                reply(&handle, &ServerMessage::SensorRequestReceived { bot_name });
            }
            ClientMessage::Heartbeat => {
                if self.gate.is_authenticated(id) {
                    reply(&handle, &ServerMessage::heartbeat());
                } else {
                    reply(&handle, &ServerMessage::error(RegistryError::NotAuthenticated.to_string()));
                }
            }
        }
    }

    /// The socket for `id` ended. Purges it from the gate and the registry.
    ///
    /// Safe to call more than once; only the first call has an effect.
    pub fn on_close(&self, id: ConnectionId) {
        if self.gate.close(id).is_none() {
            return;
        }
        match self.release(id) {
            Some(bot_name) => info!(connection = %id, bot_name = %bot_name, "client disconnected"),
            None => info!(connection = %id, "client disconnected"),
        }
    }

    /// Unbind `id`'s name and drop that name's action history.
    fn release(&self, id: ConnectionId) -> Option<String> {
        let bot_name = self.registry.unbind(id)?;
        self.driver.forget_agent(&bot_name);
        Some(bot_name)
    }

    /// Tell every open connection the server is stopping, then close them
    /// all with [`close_code::GOING_AWAY`].
    pub fn shutdown(&self) -> usize {
        let notified = self.gate.broadcast_all(&ServerMessage::server_shutdown());
        for handle in self.gate.connections() {
            if let Err(e) = handle.close(close_code::GOING_AWAY, "Server shutting down") {
                debug!(connection = %handle.id(), error = %e, "close request not queued");
            }
        }
        info!(notified, "shutdown broadcast sent");
        notified
    }

    /// The connection gate.
    pub fn gate(&self) -> &Arc<ConnectionGate> {
        &self.gate
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The tick driver.
    pub fn driver(&self) -> &Arc<TickDriver> {
        &self.driver
    }
}

fn reply(handle: &ConnectionHandle, message: &ServerMessage) {
    if let Err(e) = handle.send(message) {
        warn!(connection = %handle.id(), kind = message.kind(), error = %e, "reply dropped");
    }
}
