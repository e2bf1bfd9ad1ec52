//! Server lifecycle: bind, serve, graceful stop.
//!
//! Binding is split from serving so that a port that cannot be bound is
//! reported to the caller before anything else starts. [`start_server`]
//! does both in one call for callers that do not need the split.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The host address to bind to (e.g. `0.0.0.0`).
    pub host: String,
    /// The TCP port to listen on. `0` picks a free port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: 3002,
        }
    }
}

/// Errors that can occur when starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to the network address.
    #[error("bind error: {0}")]
    Bind(String),

    /// The server encountered a fatal error while serving.
    #[error("serve error: {0}")]
    Serve(String),
}

/// A bound listener with its router, ready to serve.
pub struct TransportServer {
    listener: TcpListener,
    router: Router,
    addr: SocketAddr,
}

impl TransportServer {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address is invalid or the port
    /// cannot be bound.
    pub async fn bind(config: &ServerConfig, state: Arc<AppState>) -> Result<Self, ServerError> {
        let requested: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Bind(format!("invalid address: {e}")))?;

        let listener = TcpListener::bind(requested)
            .await
            .map_err(|e| ServerError::Bind(format!("bind failed on {requested}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(format!("no local address for {requested}: {e}")))?;

        info!(%addr, "telemetry stream listening");
        Ok(Self {
            listener,
            router: build_router(state),
            addr,
        })
    }

    /// The address actually bound.
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until `shutdown` becomes `true` (or its sender is dropped).
    ///
    /// Stops accepting immediately on shutdown; in-flight HTTP requests are
    /// allowed to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Serve`] on a fatal I/O error.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let addr = self.addr;
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow_and_update() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| ServerError::Serve(format!("serve error: {e}")))?;

        info!(%addr, "telemetry stream stopped");
        Ok(())
    }
}

/// Bind and serve in one call.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] if the port cannot be bound, or
/// [`ServerError::Serve`] on a fatal I/O error while serving.
pub async fn start_server(
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    TransportServer::bind(config, state).await?.serve(shutdown).await
}
