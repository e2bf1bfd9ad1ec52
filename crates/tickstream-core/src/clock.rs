//! Fixed-rate host clock.
//!
//! Standalone runs have no simulation of their own to call
//! [`TickDriver::on_tick`], so [`FixedRateClock`] does it on a tokio
//! interval. Missed ticks are skipped, never burst.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::tick::TickDriver;

/// Calls [`TickDriver::on_tick`] every `period` until shut down.
#[derive(Debug, Clone, Copy)]
pub struct FixedRateClock {
    period: Duration,
}

impl FixedRateClock {
    /// A clock with the given tick period. Zero is raised to one millisecond.
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
        }
    }

    /// The tick period.
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Start ticking on the current runtime.
    ///
    /// The loop ends when `shutdown` becomes `true` or its sender is dropped.
    pub fn spawn(self, driver: Arc<TickDriver>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval completes immediately.
            interval.tick().await;

            info!(period_ms = self.period.as_millis(), "host clock started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Some(outcome) = driver.on_tick() {
                            debug!(tick = outcome.tick, "tick");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(tick = driver.current_tick(), "host clock stopped");
        })
    }
}
