//! Telemetry payload types.
//!
//! The streaming core treats a [`TelemetrySnapshot`] as opaque: it carries
//! the agent's [`Position`] plus whatever sensor categories the snapshot
//! provider chose to fill in (blocks, entities, weather, ...). Those
//! categories are flattened next to `location` on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A point in a named world, with view orientation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Name of the world/dimension the point lives in.
    pub world: String,
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// Z coordinate.
    pub z: f64,
    /// Horizontal view angle in degrees.
    #[serde(default)]
    pub yaw: f32,
    /// Vertical view angle in degrees.
    #[serde(default)]
    pub pitch: f32,
}

impl Position {
    /// Create a position with zero orientation.
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }
}

/// Point-in-time telemetry for one agent, produced by a snapshot provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Where the snapshot was taken.
    pub location: Position,
    /// Provider-defined sensor categories keyed by category name.
    #[serde(flatten)]
    pub sensors: Map<String, Value>,
}

impl TelemetrySnapshot {
    /// A snapshot carrying only the location.
    pub fn at(location: Position) -> Self {
        Self {
            location,
            sensors: Map::new(),
        }
    }

    /// Attach a sensor category, replacing any previous value under `name`.
    #[must_use]
    pub fn with_sensor(mut self, name: impl Into<String>, value: Value) -> Self {
        self.sensors.insert(name.into(), value);
        self
    }
}
