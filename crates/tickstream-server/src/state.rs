//! Shared application state for the transport.
//!
//! [`AppState`] carries the protocol handler every socket task calls into,
//! plus the per-connection transport settings. The handler in turn owns the
//! gate, registry and tick driver, so the status endpoint reads everything
//! through it.

use std::sync::Arc;
use std::time::Duration;

use tickstream_core::ProtocolHandler;

/// State shared by every route and socket task.
pub struct AppState {
    /// Protocol hooks for `on_open` / `on_message` / `on_close`.
    pub handler: Arc<ProtocolHandler>,
    /// Close a connection after this long without an inbound frame.
    pub idle_timeout: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
}

impl AppState {
    /// Default idle timeout.
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default outbound queue capacity.
    pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

    /// State with default transport settings.
    pub const fn new(handler: Arc<ProtocolHandler>) -> Self {
        Self {
            handler,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
            outbound_buffer: Self::DEFAULT_OUTBOUND_BUFFER,
        }
    }

    /// Override the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Override the outbound queue capacity.
    #[must_use]
    pub fn with_outbound_buffer(mut self, outbound_buffer: usize) -> Self {
        self.outbound_buffer = outbound_buffer;
        self
    }
}
