//! Broadcast fan-out: one telemetry snapshot per bound agent.
//!
//! The [`FanoutEngine`] does the work of one pass: enumerate bound names,
//! resolve each agent's live position, ask the snapshot provider for
//! telemetry, and push a `sensor_update` to the connection bound to that
//! name *at delivery time*. Each agent is processed in isolation; a
//! provider error, a departed agent, a closed connection, or even a
//! panicking provider only affects that one agent.
//!
//! The tick driver never calls the engine directly. It calls a
//! [`FanoutTrigger`], which is either the engine itself (inline, for
//! tests) or a [`FanoutWorker`] that runs passes on the blocking pool.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tickstream_protocol::ServerMessage;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::SendError;
use crate::registry::AgentRegistry;
use crate::world::{ProviderError, SnapshotProvider, WorldView};

/// Something the tick driver can ask to start a fan-out pass.
pub trait FanoutTrigger: Send + Sync {
    /// Request a pass for `tick`. Must not block.
    fn trigger(&self, tick: u64);
}

/// Per-agent failure during a pass.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    /// The snapshot provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The bound connection could not take the frame.
    #[error(transparent)]
    Send(#[from] SendError),

    /// The snapshot provider panicked.
    #[error("snapshot provider panicked")]
    Panicked,
}

/// What happened to one agent during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A `sensor_update` was queued on the bound connection.
    Sent,
    /// The agent has no live position right now.
    Absent,
    /// The name was unbound between enumeration and delivery.
    Unbound,
}

/// Tally of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Updates queued.
    pub delivered: usize,
    /// Agents skipped (absent or unbound).
    pub skipped: usize,
    /// Agents whose processing failed.
    pub failed: usize,
}

/// Produces and delivers per-agent telemetry.
pub struct FanoutEngine {
    registry: Arc<AgentRegistry>,
    world: Arc<dyn WorldView>,
    provider: Arc<dyn SnapshotProvider>,
    radius: AtomicU32,
}

impl FanoutEngine {
    /// Create an engine sampling `radius` around each agent.
    pub fn new(
        registry: Arc<AgentRegistry>,
        world: Arc<dyn WorldView>,
        provider: Arc<dyn SnapshotProvider>,
        radius: u32,
    ) -> Self {
        Self {
            registry,
            world,
            provider,
            radius: AtomicU32::new(radius),
        }
    }

    /// Current telemetry radius.
    pub fn radius(&self) -> u32 {
        self.radius.load(Ordering::Relaxed)
    }

    /// Change the telemetry radius for subsequent passes.
    pub fn set_radius(&self, radius: u32) {
        self.radius.store(radius, Ordering::Relaxed);
    }

    /// Run one pass over every bound agent.
    pub fn run(&self, tick: u64) -> FanoutReport {
        let names = self.registry.bound_names();
        if names.is_empty() {
            return FanoutReport::default();
        }

        let mut report = FanoutReport::default();
        for name in &names {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.deliver(name)))
                .unwrap_or(Err(FanoutError::Panicked));
            match outcome {
                Ok(Delivery::Sent) => report.delivered = report.delivered.saturating_add(1),
                Ok(Delivery::Absent | Delivery::Unbound) => {
                    report.skipped = report.skipped.saturating_add(1);
                }
                Err(e) => {
                    warn!(tick, bot_name = %name, error = %e, "telemetry fan-out failed for agent");
                    report.failed = report.failed.saturating_add(1);
                }
            }
        }
        debug!(
            tick,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "fan-out pass complete"
        );
        report
    }

    /// Produce and push telemetry for a single agent.
    pub fn deliver(&self, name: &str) -> Result<Delivery, FanoutError> {
        let Some(position) = self.world.resolve(name) else {
            return Ok(Delivery::Absent);
        };
        let snapshot = self.provider.snapshot(&position, self.radius())?;
        let message = ServerMessage::sensor_update(name, snapshot);

        let Some(connection) = self.registry.lookup(name) else {
            return Ok(Delivery::Unbound);
        };
        connection.send(&message)?;
        Ok(Delivery::Sent)
    }
}

impl FanoutTrigger for FanoutEngine {
    fn trigger(&self, tick: u64) {
        self.run(tick);
    }
}

/// Runs fan-out passes off the tick path.
///
/// Triggers land on a one-slot queue. While a pass is queued, further
/// triggers are dropped: telemetry is most-recent-wins and the queued pass
/// samples the world when it runs, not when it was requested.
#[derive(Debug, Clone)]
pub struct FanoutWorker {
    queue: mpsc::Sender<u64>,
}

impl FanoutWorker {
    /// Start the worker task. It exits when `shutdown` flips to `true`
    /// or when every worker handle is dropped. An in-flight pass always
    /// completes; a pass still queued at shutdown is abandoned.
    pub fn spawn(engine: Arc<FanoutEngine>, mut shutdown: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let (queue, mut rx) = mpsc::channel::<u64>(1);

        let task = tokio::spawn(async move {
            loop {
                let tick = tokio::select! {
                    next = rx.recv() => match next {
                        Some(tick) => tick,
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                let engine = Arc::clone(&engine);
                if let Err(e) = tokio::task::spawn_blocking(move || engine.run(tick)).await {
                    warn!(tick, error = %e, "fan-out pass aborted");
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("fan-out worker stopped");
        });

        (Self { queue }, task)
    }
}

impl FanoutTrigger for FanoutWorker {
    fn trigger(&self, tick: u64) {
        match self.queue.try_send(tick) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(tick, "fan-out pass already pending, trigger dropped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(tick, "fan-out worker stopped, trigger dropped");
            }
        }
    }
}
