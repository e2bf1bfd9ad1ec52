//! Agent registry: logical agent name to live connection.
//!
//! At most one connection is bound to a name, and a connection carries at
//! most one name. Rebinding a name to another connection silently
//! supersedes the old binding; the old connection stays open but no longer
//! receives pushes addressed to that name.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::gate::ConnectionGate;

/// Why a bind was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The connection has not completed the handshake.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The agent name is empty.
    #[error("Invalid bot name")]
    InvalidName,
}

/// Successful bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    /// The connection that previously held the name, if it was another one.
    pub superseded: Option<ConnectionId>,
}

/// Concurrent name-to-connection map.
#[derive(Debug)]
pub struct AgentRegistry {
    gate: Arc<ConnectionGate>,
    bindings: DashMap<String, ConnectionHandle>,
}

impl AgentRegistry {
    /// Create an empty registry that checks authentication against `gate`.
    pub fn new(gate: Arc<ConnectionGate>) -> Self {
        Self {
            gate,
            bindings: DashMap::new(),
        }
    }

    /// Bind `name` to connection `id`, last writer wins.
    ///
    /// Any other name previously bound to `id` is released.
    pub fn bind(&self, id: ConnectionId, name: &str) -> Result<Binding, RegistryError> {
        if !self.gate.is_authenticated(id) {
            return Err(RegistryError::NotAuthenticated);
        }
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidName);
        }
        let handle = self
            .gate
            .handle(id)
            .ok_or(RegistryError::NotAuthenticated)?;

        self.bindings
            .retain(|bound, h| h.id() != id || bound.as_str() == name);
        let superseded = self
            .bindings
            .insert(name.to_owned(), handle)
            .map(|previous| previous.id())
            .filter(|previous| *previous != id);

        // The connection may have closed between the check and the insert;
        // its close-time purge has already run, so undo the insert here.
        if !self.gate.is_authenticated(id) {
            self.bindings.remove_if(name, |_, h| h.id() == id);
            return Err(RegistryError::NotAuthenticated);
        }

        if let Some(previous) = superseded {
            info!(bot_name = name, connection = %id, superseded = %previous, "bot binding superseded");
        } else {
            info!(bot_name = name, connection = %id, "bot registered");
        }
        Ok(Binding { superseded })
    }

    /// Remove whatever binding points at `id`. Returns the released name.
    pub fn unbind(&self, id: ConnectionId) -> Option<String> {
        let mut released = None;
        self.bindings.retain(|name, h| {
            if h.id() == id {
                released = Some(name.clone());
                false
            } else {
                true
            }
        });
        released
    }

    /// The connection currently bound to `name`.
    pub fn lookup(&self, name: &str) -> Option<ConnectionHandle> {
        self.bindings.get(name).map(|h| h.value().clone())
    }

    /// The name bound to connection `id`, if any.
    pub fn name_of(&self, id: ConnectionId) -> Option<String> {
        self.bindings
            .iter()
            .find(|entry| entry.value().id() == id)
            .map(|entry| entry.key().clone())
    }

    /// Every currently bound name.
    ///
    /// Names may be unbound by the time the caller uses them; callers
    /// re-resolve with [`lookup`](Self::lookup).
    pub fn bound_names(&self) -> BTreeSet<String> {
        self.bindings.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no names are bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
