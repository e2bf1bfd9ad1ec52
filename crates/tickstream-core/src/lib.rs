//! Streaming core for Tickstream: authentication, agent bindings, telemetry
//! fan-out and the tick clock.
//!
//! Nothing in this crate knows about sockets. A transport adapter hands each
//! connection's [`ConnectionHandle`] to the [`ProtocolHandler`] and drains the
//! handle's outbound queue onto the wire.
//!
//! # Modules
//!
//! - [`connection`] -- [`ConnectionHandle`], [`ConnectionId`] and the
//!   bounded outbound queue.
//! - [`gate`] -- [`ConnectionGate`], the authentication state machine and
//!   authenticated-set broadcast.
//! - [`registry`] -- [`AgentRegistry`], agent name to connection bindings.
//! - [`world`] -- [`WorldView`] and [`SnapshotProvider`] collaborator traits
//!   plus [`InMemoryWorld`].
//! - [`fanout`] -- [`FanoutEngine`] and the [`FanoutWorker`] that runs it off
//!   the tick path.
//! - [`tick`] -- [`TickDriver`]: clock, checkpoint and evolution events.
//! - [`clock`] -- [`FixedRateClock`] for standalone runs.
//! - [`handler`] -- [`ProtocolHandler`], the `on_open` / `on_message` /
//!   `on_close` hooks.
//! - [`config`] -- [`StreamConfig`] loading from `tickstream.yaml`.

pub mod clock;
pub mod config;
pub mod connection;
pub mod fanout;
pub mod gate;
pub mod handler;
pub mod registry;
pub mod tick;
pub mod world;

pub use clock::FixedRateClock;
pub use config::{ConfigError, ConfigSource, StreamConfig};
pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionState, Outbound, OutboundQueue, SendError, close_code,
};
pub use fanout::{FanoutEngine, FanoutReport, FanoutTrigger, FanoutWorker};
pub use gate::{AuthOutcome, ConnectionGate};
pub use handler::ProtocolHandler;
pub use registry::{AgentRegistry, RegistryError};
pub use tick::{IntervalConfig, TickDriver, TickOutcome, TickStats};
pub use world::{InMemoryWorld, ProviderError, SnapshotProvider, WorldView};
