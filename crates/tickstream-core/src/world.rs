//! Collaborators the streaming core consumes from the host simulation.
//!
//! The core never samples world state itself. It asks a [`WorldView`]
//! where an agent currently is (and how many peers are online), and asks a
//! [`SnapshotProvider`] for telemetry around that point. Both are injected
//! at construction.
//!
//! [`InMemoryWorld`] implements both for standalone runs and tests.

use dashmap::DashMap;
use serde_json::json;
use tickstream_protocol::{Position, TelemetrySnapshot};

/// Failure inside a snapshot provider. Isolated to one agent per fan-out.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The world the position refers to is not available.
    #[error("world `{0}` is not loaded")]
    WorldUnavailable(String),

    /// Any other provider failure.
    #[error("snapshot failed: {0}")]
    Failed(String),
}

/// Live position lookup for agents present in the simulation.
pub trait WorldView: Send + Sync {
    /// Where `agent` currently is, or `None` if it is not present.
    fn resolve(&self, agent: &str) -> Option<Position>;

    /// Number of peers currently present in the simulation.
    fn online_count(&self) -> usize;
}

/// Produces point-in-time telemetry around a position.
pub trait SnapshotProvider: Send + Sync {
    /// Sample telemetry within `radius` of `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the sample cannot be taken.
    fn snapshot(&self, position: &Position, radius: u32) -> Result<TelemetrySnapshot, ProviderError>;
}

/// A world held in memory: a map of present agents to their positions.
///
/// Snapshots contain the location plus an `agents` category listing the
/// other present agents within the radius, nearest first.
#[derive(Debug, Default)]
pub struct InMemoryWorld {
    present: DashMap<String, Position>,
    default_position: Option<Position>,
}

impl InMemoryWorld {
    /// An empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty world where any name not explicitly placed resolves to
    /// `position`.
    pub fn with_default_position(position: Position) -> Self {
        Self {
            present: DashMap::new(),
            default_position: Some(position),
        }
    }

    /// Put `agent` at `position`, replacing any earlier position.
    pub fn place(&self, agent: impl Into<String>, position: Position) {
        self.present.insert(agent.into(), position);
    }

    /// Take `agent` out of the world.
    pub fn remove(&self, agent: &str) -> Option<Position> {
        self.present.remove(agent).map(|(_, position)| position)
    }
}

impl WorldView for InMemoryWorld {
    fn resolve(&self, agent: &str) -> Option<Position> {
        self.present
            .get(agent)
            .map(|p| p.value().clone())
            .or_else(|| self.default_position.clone())
    }

    fn online_count(&self) -> usize {
        self.present.len()
    }
}

impl SnapshotProvider for InMemoryWorld {
    fn snapshot(&self, position: &Position, radius: u32) -> Result<TelemetrySnapshot, ProviderError> {
        let limit = f64::from(radius);
        let mut nearby: Vec<(f64, String)> = self
            .present
            .iter()
            .filter(|entry| entry.value().world == position.world)
            .filter_map(|entry| {
                let distance = distance(position, entry.value());
                (distance > 0.0 && distance <= limit).then(|| (distance, entry.key().clone()))
            })
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));

        let agents: Vec<_> = nearby
            .into_iter()
            .map(|(distance, name)| json!({ "name": name, "distance": distance }))
            .collect();

        Ok(TelemetrySnapshot::at(position.clone()).with_sensor("agents", json!(agents)))
    }
}

fn distance(a: &Position, b: &Position) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    let dz = a.z - b.z;
    dz.mul_add(dz, dx.mul_add(dx, dy * dy)).sqrt()
}
