//! Host binary for the Tickstream telemetry stream.
//!
//! Runs the streaming core standalone: an in-memory world stands in for
//! the simulation and a fixed-rate clock drives the tick driver.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `tickstream.yaml` (or `TICKSTREAM_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Build the gate, registry, world, fan-out engine and worker
//! 4. Build the tick driver and protocol handler
//! 5. Bind the listener (fatal on failure)
//! 6. Start serving and start the host clock
//! 7. On Ctrl-C / SIGTERM: stop accepting, notify and close every
//!    connection, then stop the tick driver and its clock, wait for tasks
//!    to finish

mod error;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tickstream_core::config::LogFormat;
use tickstream_core::{
    AgentRegistry, ConnectionGate, FanoutEngine, FanoutWorker, FixedRateClock, InMemoryWorld,
    ProtocolHandler, SnapshotProvider, StreamConfig, TickDriver, WorldView,
};
use tickstream_server::{AppState, ServerConfig, TransportServer};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::HostError;

/// How long to wait for sockets to flush their close frames on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration is invalid, the port cannot be
/// bound, or a background task fails.
#[tokio::main]
async fn main() -> Result<(), HostError> {
    // 1. Load configuration.
    let config_path = std::env::var("TICKSTREAM_CONFIG")
        .map_or_else(|_| PathBuf::from("tickstream.yaml"), PathBuf::from);
    let (config, source) = StreamConfig::from_file(&config_path)?;

    // 2. Initialize structured logging.
    init_logging(&config)?;
    if !source.found() {
        info!(path = %config_path.display(), "config file not found, using defaults");
    }
    info!(
        path = %config_path.display(),
        found = source.found(),
        port = config.server.port,
        radius = config.telemetry.radius,
        tick_interval_ms = config.ticks.tick_interval_ms,
        "Configuration loaded"
    );

    // 3. Core collaborators.
    let gate = Arc::new(ConnectionGate::new(config.server.auth_token.clone()));
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&gate)));
    let world = Arc::new(
        config
            .world
            .default_position
            .clone()
            .map_or_else(InMemoryWorld::new, InMemoryWorld::with_default_position),
    );
    let engine = Arc::new(FanoutEngine::new(
        Arc::clone(&registry),
        Arc::clone(&world) as Arc<dyn WorldView>,
        Arc::clone(&world) as Arc<dyn SnapshotProvider>,
        config.telemetry.radius,
    ));

    // The accept loop stops first; the clock and the fan-out worker stop
    // only after every connection has been told and closed.
    let (accept_tx, accept_rx) = watch::channel(false);
    let (tick_tx, tick_rx) = watch::channel(false);
    let (fanout, fanout_task) = FanoutWorker::spawn(engine, tick_rx.clone());

    // 4. Tick driver and protocol handler.
    let driver = Arc::new(TickDriver::new(
        Arc::clone(&gate),
        world,
        Arc::new(fanout),
        config.ticks.intervals(),
        config.ticks.tick_period(),
    ));
    driver.set_enabled(config.ticks.enabled);
    let intervals = driver.intervals();
    info!(
        broadcast = intervals.broadcast,
        checkpoint = intervals.checkpoint,
        evolution = intervals.evolution,
        enabled = config.ticks.enabled,
        "Tick driver initialized"
    );

    let handler = Arc::new(ProtocolHandler::new(gate, registry, Arc::clone(&driver)));
    let state = Arc::new(
        AppState::new(Arc::clone(&handler))
            .with_idle_timeout(config.server.idle_timeout())
            .with_outbound_buffer(config.server.outbound_buffer),
    );

    // 5. Bind. A port that cannot be bound is the one fatal startup error.
    let server_config = ServerConfig {
        host: config.server.host.clone(),
        port: config.server.port,
    };
    let server = match TransportServer::bind(&server_config, state).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start telemetry stream");
            return Err(e.into());
        }
    };

    // 6. Serve and tick.
    let server_task = tokio::spawn(server.serve(accept_rx));
    let clock_task = FixedRateClock::new(config.ticks.tick_period()).spawn(Arc::clone(&driver), tick_rx);

    shutdown_signal().await;
    info!(tick = driver.current_tick(), "Shutdown requested");

    // 7. Stop accepting, notify and close every connection, then stop
    //    ticking.
    stop(&handler, &accept_tx, &tick_tx);
    drain_connections(&handler).await;

    server_task.await??;
    clock_task.await?;
    fanout_task.await?;
    info!("tickstream-host stopped");
    Ok(())
}

fn init_logging(config: &StreamConfig) -> Result<(), HostError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = match config.logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| HostError::Logging {
        message: e.to_string(),
    })
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Stop accepting, notify and close every connection, then stop the tick
/// driver, its clock and the fan-out worker.
fn stop(handler: &ProtocolHandler, accept_tx: &watch::Sender<bool>, tick_tx: &watch::Sender<bool>) {
    if accept_tx.send(true).is_err() {
        warn!("accept loop already gone");
    }
    handler.shutdown();
    handler.driver().set_enabled(false);
    if tick_tx.send(true).is_err() {
        warn!("clock and fan-out worker already gone");
    }
}

/// Wait for socket tasks to deliver their close frames and run `on_close`.
async fn drain_connections(handler: &ProtocolHandler) {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while handler.gate().connection_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                remaining = handler.gate().connection_count(),
                "connections still open after drain timeout"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tickstream_core::{ConnectionHandle, FanoutTrigger, IntervalConfig, Outbound, OutboundQueue};

    use super::*;

    struct NoFanout;

    impl FanoutTrigger for NoFanout {
        fn trigger(&self, _tick: u64) {}
    }

    fn handler() -> ProtocolHandler {
        let gate = Arc::new(ConnectionGate::new("secret"));
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&gate)));
        let driver = Arc::new(TickDriver::new(
            Arc::clone(&gate),
            Arc::new(InMemoryWorld::new()),
            Arc::new(NoFanout),
            IntervalConfig::default(),
            Duration::from_millis(50),
        ));
        ProtocolHandler::new(gate, registry, driver)
    }

    fn frame_type(rx: &mut OutboundQueue) -> String {
        match rx.try_recv().unwrap() {
            Outbound::Frame(frame) => {
                let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
                value["type"].as_str().unwrap().to_owned()
            }
            Outbound::Close { code, .. } => format!("close:{code}"),
        }
    }

    #[test]
    fn stop_closes_connections_before_halting_the_driver() {
        let handler = handler();
        let (handle, mut rx) = ConnectionHandle::new(16);
        let id = handle.id();
        handler.on_open(handle);
        handler.on_message(id, r#"{"type":"auth","token":"secret"}"#);
        handler.driver().on_tick();
        let (accept_tx, accept_rx) = watch::channel(false);
        let (tick_tx, tick_rx) = watch::channel(false);

        stop(&handler, &accept_tx, &tick_tx);

        assert!(*accept_rx.borrow());
        assert!(*tick_rx.borrow());
        assert!(!handler.driver().is_enabled());
        assert_eq!(handler.driver().on_tick(), None);
        let frames: Vec<String> = (0..5).map(|_| frame_type(&mut rx)).collect();
        assert_eq!(
            frames,
            vec![
                "auth_required",
                "auth_success",
                "server_tick",
                "server_shutdown",
                "close:1001",
            ]
        );
        assert!(rx.try_recv().is_err());
    }
}
