//! Configuration loading and typed config structures.
//!
//! The configuration lives in `tickstream.yaml` (path overridable with
//! `TICKSTREAM_CONFIG`). Every field has a default, so an empty or absent
//! file is a valid configuration apart from the auth token, which must be
//! supplied either in the file or through `TICKSTREAM_AUTH_TOKEN`.
//!
//! Environment overrides:
//! - `TICKSTREAM_HOST` overrides `server.host`
//! - `TICKSTREAM_PORT` overrides `server.port`
//! - `TICKSTREAM_AUTH_TOKEN` overrides `server.auth_token`
//! - `TICKSTREAM_RADIUS` overrides `telemetry.radius`

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tickstream_protocol::Position;

use crate::tick::IntervalConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value for {var}: {reason}")]
    Env {
        /// The offending variable.
        var: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration is structurally valid but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Where a loaded configuration came from.
///
/// Loading runs before logging is initialized, so the caller reports this
/// once its subscriber is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read from the file at the given path.
    File,
    /// No file at the given path; built-in defaults were used.
    Defaults,
}

impl ConfigSource {
    /// Whether a file was found.
    pub const fn found(self) -> bool {
        matches!(self, Self::File)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StreamConfig {
    /// Listener and connection settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Fan-out settings.
    #[serde(default)]
    pub telemetry: TelemetrySection,

    /// Tick driver cadence.
    #[serde(default)]
    pub ticks: TickSection,

    /// Standalone in-memory world.
    #[serde(default)]
    pub world: WorldSection,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSection,
}

impl StreamConfig {
    /// Load configuration from `path`, apply environment overrides and
    /// validate.
    ///
    /// A missing file is not an error; defaults are used instead and the
    /// returned [`ConfigSource`] says so.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file exists but cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, [`ConfigError::Env`]
    /// for an unparsable override and [`ConfigError::Invalid`] if the
    /// result fails validation.
    pub fn from_file(path: &Path) -> Result<(Self, ConfigSource), ConfigError> {
        Self::from_file_with(path, |var| std::env::var(var).ok())
    }

    /// [`from_file`](Self::from_file) with overrides read through `lookup`.
    pub fn from_file_with<F>(path: &Path, lookup: F) -> Result<(Self, ConfigSource), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (mut config, source) = match std::fs::read_to_string(path) {
            Ok(contents) => (serde_yml::from_str(&contents)?, ConfigSource::File),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Self::default(), ConfigSource::Defaults),
            Err(e) => return Err(e.into()),
        };
        config.apply_overrides_from(lookup)?;
        config.validate()?;
        Ok((config, source))
    }

    /// Parse and validate configuration from a YAML string. No environment
    /// overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if it fails validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TICKSTREAM_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides using `lookup` to read variables.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("TICKSTREAM_HOST") {
            self.server.host = val;
        }
        if let Some(val) = lookup("TICKSTREAM_PORT") {
            self.server.port = val.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Env {
                var: "TICKSTREAM_PORT",
                reason: e.to_string(),
            })?;
        }
        if let Some(val) = lookup("TICKSTREAM_AUTH_TOKEN") {
            self.server.auth_token = val;
        }
        if let Some(val) = lookup("TICKSTREAM_RADIUS") {
            self.telemetry.radius = val.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Env {
                var: "TICKSTREAM_RADIUS",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.auth_token.is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "server.auth_token must be set (or TICKSTREAM_AUTH_TOKEN)",
            )));
        }
        if self.ticks.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(String::from(
                "ticks.tick_interval_ms must be greater than zero",
            )));
        }
        if self.server.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(String::from(
                "server.outbound_buffer must be greater than zero",
            )));
        }
        Ok(())
    }
}

/// Listener and connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSection {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listening port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret every client must present.
    #[serde(default)]
    pub auth_token: String,

    /// Seconds without any inbound frame before a connection is dropped.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Frames queued per connection before new ones are dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl ServerSection {
    /// Idle timeout as a [`Duration`].
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: String::new(),
            idle_timeout_secs: default_idle_timeout_secs(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// Fan-out settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TelemetrySection {
    /// Snapshot radius in blocks.
    #[serde(default = "default_radius")]
    pub radius: u32,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            radius: default_radius(),
        }
    }
}

/// Tick driver cadence.
///
/// Intervals are signed so that zero and negative values can be written and
/// then clamped, matching the runtime setters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickSection {
    /// Real-time milliseconds per host tick.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Whether the driver starts enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ticks between `server_tick` events and fan-out passes.
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval: i64,

    /// Ticks between `checkpoint` events.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: i64,

    /// Ticks between `evolution` events.
    #[serde(default = "default_evolution_interval")]
    pub evolution_interval: i64,
}

impl TickSection {
    /// Host tick period.
    pub const fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// The intervals, clamped to their minimums.
    pub fn intervals(&self) -> IntervalConfig {
        IntervalConfig::clamped(
            self.broadcast_interval,
            self.checkpoint_interval,
            self.evolution_interval,
        )
    }
}

impl Default for TickSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            enabled: true,
            broadcast_interval: default_broadcast_interval(),
            checkpoint_interval: default_checkpoint_interval(),
            evolution_interval: default_evolution_interval(),
        }
    }
}

/// Standalone in-memory world.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WorldSection {
    /// Position every agent resolves to when nothing placed it explicitly.
    #[serde(default)]
    pub default_position: Option<Position>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    3002
}

const fn default_idle_timeout_secs() -> u64 {
    30
}

const fn default_outbound_buffer() -> usize {
    64
}

const fn default_radius() -> u32 {
    16
}

const fn default_tick_interval_ms() -> u64 {
    50
}

const fn default_broadcast_interval() -> i64 {
    1
}

const fn default_checkpoint_interval() -> i64 {
    1200
}

const fn default_evolution_interval() -> i64 {
    12000
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_true() -> bool {
    true
}
