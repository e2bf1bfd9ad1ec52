//! Tick driver: the simulation clock as seen by connected agents.
//!
//! The host calls [`TickDriver::on_tick`] once per simulation tick. Each
//! enabled invocation advances the counter by exactly one and evaluates
//! three independent moduli, in this order:
//!
//! 1. `broadcast_interval` -- `server_tick` to every authenticated
//!    connection, then a fan-out trigger.
//! 2. `checkpoint_interval` -- `checkpoint`.
//! 3. `evolution_interval` -- `evolution`.
//!
//! Any combination may fire on the same tick. Nothing here blocks: all
//! sends are `try_send` and the fan-out runs elsewhere.
//!
//! # Design Principles
//!
//! - The counter is owned here and only ever moves forward.
//! - Intervals are clamped on every write, so a zero or negative value can
//!   never turn the modulus into a division by zero or a busy loop.
//! - A disabled driver does nothing at all, not even advance.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tickstream_protocol::{ServerMessage, now_millis};
use tracing::{debug, info};

use crate::fanout::FanoutTrigger;
use crate::gate::ConnectionGate;
use crate::world::WorldView;

/// Smallest accepted broadcast interval.
pub const MIN_BROADCAST_INTERVAL: u64 = 1;
/// Smallest accepted checkpoint interval.
pub const MIN_CHECKPOINT_INTERVAL: u64 = 20;
/// Smallest accepted evolution interval.
pub const MIN_EVOLUTION_INTERVAL: u64 = 100;

/// Number of recent invocations the throughput meter looks at.
const TPS_WINDOW: usize = 100;

/// The three event cadences, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalConfig {
    /// Ticks between `server_tick` events (and fan-out passes).
    pub broadcast: u64,
    /// Ticks between `checkpoint` events.
    pub checkpoint: u64,
    /// Ticks between `evolution` events.
    pub evolution: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            broadcast: 1,
            checkpoint: 1200,
            evolution: 12000,
        }
    }
}

impl IntervalConfig {
    /// Build a config from raw values, clamping each to its minimum.
    pub fn clamped(broadcast: i64, checkpoint: i64, evolution: i64) -> Self {
        Self {
            broadcast: clamp_interval(broadcast, MIN_BROADCAST_INTERVAL),
            checkpoint: clamp_interval(checkpoint, MIN_CHECKPOINT_INTERVAL),
            evolution: clamp_interval(evolution, MIN_EVOLUTION_INTERVAL),
        }
    }
}

fn clamp_interval(requested: i64, min: u64) -> u64 {
    u64::try_from(requested).unwrap_or(0).max(min)
}

/// Which events one invocation fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// The counter value after this invocation.
    pub tick: u64,
    /// `server_tick` was broadcast and a fan-out triggered.
    pub clock: bool,
    /// `checkpoint` was broadcast.
    pub checkpoint: bool,
    /// `evolution` was broadcast.
    pub evolution: bool,
}

/// Point-in-time driver statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickStats {
    /// Current counter value.
    pub current_tick: u64,
    /// Enabled invocations since the driver was created.
    pub ticks_processed: u64,
    /// Tick of the most recent checkpoint (0 if none yet).
    pub last_checkpoint_tick: u64,
    /// Tick of the most recent evolution event (0 if none yet).
    pub last_evolution_tick: u64,
    /// Agents with a recorded action.
    pub active_agents: usize,
    /// Measured ticks per second.
    pub tps: f64,
    /// Whether the driver is advancing.
    pub enabled: bool,
    /// Active intervals.
    pub intervals: IntervalConfig,
}

/// Sliding-window tick rate, capped at the nominal rate.
#[derive(Debug)]
struct TpsMeter {
    nominal: f64,
    samples: VecDeque<Instant>,
}

impl TpsMeter {
    fn new(nominal: f64) -> Self {
        Self {
            nominal,
            samples: VecDeque::with_capacity(TPS_WINDOW),
        }
    }

    fn record(&mut self, at: Instant) {
        if self.samples.len() >= TPS_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(at);
    }

    fn rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return self.nominal;
        };
        let elapsed = last.saturating_duration_since(*first).as_secs_f64();
        let intervals = u32::try_from(self.samples.len().saturating_sub(1)).unwrap_or(u32::MAX);
        if intervals == 0 || elapsed <= 0.0 {
            return self.nominal;
        }
        (f64::from(intervals) / elapsed).min(self.nominal)
    }
}

#[derive(Debug)]
struct Bookkeeping {
    ticks_processed: u64,
    last_checkpoint_tick: u64,
    last_evolution_tick: u64,
    meter: TpsMeter,
    agent_actions: HashMap<String, u64>,
}

/// Fixed-cadence driver for clock, checkpoint and evolution events.
pub struct TickDriver {
    gate: Arc<ConnectionGate>,
    world: Arc<dyn WorldView>,
    fanout: Arc<dyn FanoutTrigger>,
    tick: AtomicU64,
    enabled: AtomicBool,
    broadcast_interval: AtomicU64,
    checkpoint_interval: AtomicU64,
    evolution_interval: AtomicU64,
    book: Mutex<Bookkeeping>,
}

impl TickDriver {
    /// Create a driver for a host ticking every `tick_period`.
    ///
    /// The driver starts enabled at tick 0.
    pub fn new(
        gate: Arc<ConnectionGate>,
        world: Arc<dyn WorldView>,
        fanout: Arc<dyn FanoutTrigger>,
        intervals: IntervalConfig,
        tick_period: Duration,
    ) -> Self {
        let nominal = if tick_period.is_zero() {
            20.0
        } else {
            tick_period.as_secs_f64().recip()
        };
        let intervals = IntervalConfig {
            broadcast: intervals.broadcast.max(MIN_BROADCAST_INTERVAL),
            checkpoint: intervals.checkpoint.max(MIN_CHECKPOINT_INTERVAL),
            evolution: intervals.evolution.max(MIN_EVOLUTION_INTERVAL),
        };
        Self {
            gate,
            world,
            fanout,
            tick: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
            broadcast_interval: AtomicU64::new(intervals.broadcast),
            checkpoint_interval: AtomicU64::new(intervals.checkpoint),
            evolution_interval: AtomicU64::new(intervals.evolution),
            book: Mutex::new(Bookkeeping {
                ticks_processed: 0,
                last_checkpoint_tick: 0,
                last_evolution_tick: 0,
                meter: TpsMeter::new(nominal),
                agent_actions: HashMap::new(),
            }),
        }
    }

    /// Run one simulation tick. Returns `None` when disabled.
    pub fn on_tick(&self) -> Option<TickOutcome> {
        if !self.enabled.load(Ordering::Acquire) {
            return None;
        }

        let tick = self.tick.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let tps = {
            let mut book = self.book();
            book.ticks_processed = book.ticks_processed.saturating_add(1);
            book.meter.record(Instant::now());
            book.meter.rate()
        };

        let clock = divides(self.broadcast_interval.load(Ordering::Acquire), tick);
        if clock {
            self.gate.broadcast(&ServerMessage::ServerTick {
                tick,
                timestamp: now_millis(),
                tps,
                online_players: self.world.online_count(),
            });
            self.fanout.trigger(tick);
        }

        let checkpoint = divides(self.checkpoint_interval.load(Ordering::Acquire), tick);
        if checkpoint {
            let since = {
                let mut book = self.book();
                let since = tick.saturating_sub(book.last_checkpoint_tick);
                book.last_checkpoint_tick = tick;
                since
            };
            let sent = self.gate.broadcast(&ServerMessage::Checkpoint {
                tick,
                timestamp: now_millis(),
                ticks_since_last_checkpoint: since,
            });
            info!(tick, recipients = sent, "checkpoint triggered");
        }

        let evolution = divides(self.evolution_interval.load(Ordering::Acquire), tick);
        if evolution {
            let since = {
                let mut book = self.book();
                let since = tick.saturating_sub(book.last_evolution_tick);
                book.last_evolution_tick = tick;
                since
            };
            let sent = self.gate.broadcast(&ServerMessage::Evolution {
                tick,
                timestamp: now_millis(),
                ticks_since_last_evolution: since,
            });
            info!(tick, recipients = sent, "evolution triggered");
        }

        Some(TickOutcome {
            tick,
            clock,
            checkpoint,
            evolution,
        })
    }

    /// Current counter value.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Whether the driver is advancing.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Pause or resume. Resuming continues from the current counter.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(enabled, tick = self.current_tick(), "tick driver toggled");
        }
    }

    /// Set the broadcast interval (minimum 1). Returns the applied value.
    pub fn set_broadcast_interval(&self, ticks: i64) -> u64 {
        let applied = clamp_interval(ticks, MIN_BROADCAST_INTERVAL);
        self.broadcast_interval.store(applied, Ordering::Release);
        info!(interval = applied, "broadcast interval set");
        applied
    }

    /// Set the checkpoint interval (minimum 20). Returns the applied value.
    pub fn set_checkpoint_interval(&self, ticks: i64) -> u64 {
        let applied = clamp_interval(ticks, MIN_CHECKPOINT_INTERVAL);
        self.checkpoint_interval.store(applied, Ordering::Release);
        info!(interval = applied, "checkpoint interval set");
        applied
    }

    /// Set the evolution interval (minimum 100). Returns the applied value.
    pub fn set_evolution_interval(&self, ticks: i64) -> u64 {
        let applied = clamp_interval(ticks, MIN_EVOLUTION_INTERVAL);
        self.evolution_interval.store(applied, Ordering::Release);
        info!(interval = applied, "evolution interval set");
        applied
    }

    /// Active intervals.
    pub fn intervals(&self) -> IntervalConfig {
        IntervalConfig {
            broadcast: self.broadcast_interval.load(Ordering::Acquire),
            checkpoint: self.checkpoint_interval.load(Ordering::Acquire),
            evolution: self.evolution_interval.load(Ordering::Acquire),
        }
    }

    /// Note that `agent` acted at `tick`.
    pub fn record_agent_action(&self, agent: &str, tick: u64) {
        self.book().agent_actions.insert(agent.to_owned(), tick);
        debug!(bot_name = agent, tick, "agent action recorded");
    }

    /// Drop `agent`'s action history. Called when its name is released so
    /// the history does not outlive the binding.
    pub fn forget_agent(&self, agent: &str) -> bool {
        let forgotten = self.book().agent_actions.remove(agent).is_some();
        if forgotten {
            debug!(bot_name = agent, "agent action history dropped");
        }
        forgotten
    }

    /// Ticks elapsed since `agent` last acted, if it ever did.
    pub fn ticks_since_last_action(&self, agent: &str) -> Option<u64> {
        let last = self.book().agent_actions.get(agent).copied()?;
        Some(self.current_tick().saturating_sub(last))
    }

    /// Snapshot of the driver's counters.
    pub fn stats(&self) -> TickStats {
        let book = self.book();
        TickStats {
            current_tick: self.current_tick(),
            ticks_processed: book.ticks_processed,
            last_checkpoint_tick: book.last_checkpoint_tick,
            last_evolution_tick: book.last_evolution_tick,
            active_agents: book.agent_actions.len(),
            tps: book.meter.rate(),
            enabled: self.is_enabled(),
            intervals: self.intervals(),
        }
    }

    fn book(&self) -> MutexGuard<'_, Bookkeeping> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn divides(interval: u64, tick: u64) -> bool {
    tick.checked_rem(interval) == Some(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::connection::{ConnectionHandle, Outbound, OutboundQueue};
    use crate::world::InMemoryWorld;

    #[derive(Default)]
    struct CountingTrigger {
        ticks: Mutex<Vec<u64>>,
        calls: AtomicUsize,
    }

    impl FanoutTrigger for CountingTrigger {
        fn trigger(&self, tick: u64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ticks.lock().unwrap().push(tick);
        }
    }

    fn driver_with(intervals: IntervalConfig) -> (TickDriver, Arc<CountingTrigger>, OutboundQueue) {
        let gate = Arc::new(ConnectionGate::new("secret"));
        let (handle, mut rx) = ConnectionHandle::new(1024);
        let id = handle.id();
        gate.open(handle);
        gate.authenticate(id, "secret");
        while rx.try_recv().is_ok() {}

        let trigger = Arc::new(CountingTrigger::default());
        let driver = TickDriver::new(
            gate,
            Arc::new(InMemoryWorld::new()),
            Arc::clone(&trigger) as Arc<dyn FanoutTrigger>,
            intervals,
            Duration::from_millis(50),
        );
        (driver, trigger, rx)
    }

    fn frames(rx: &mut OutboundQueue) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn of_type<'a>(frames: &'a [serde_json::Value], kind: &str) -> Vec<&'a serde_json::Value> {
        frames.iter().filter(|f| f["type"] == kind).collect()
    }

    #[test]
    fn counter_advances_once_per_enabled_tick() {
        let (driver, _, _rx) = driver_with(IntervalConfig::default());
        for _ in 0..7 {
            driver.on_tick();
        }
        assert_eq!(driver.current_tick(), 7);
        assert_eq!(driver.stats().ticks_processed, 7);
    }

    #[test]
    fn disabled_driver_does_nothing_and_resumes_without_reset() {
        let (driver, trigger, mut rx) = driver_with(IntervalConfig::default());
        driver.on_tick();
        driver.on_tick();
        frames(&mut rx);

        driver.set_enabled(false);
        for _ in 0..5 {
            assert_eq!(driver.on_tick(), None);
        }
        assert_eq!(driver.current_tick(), 2);
        assert!(frames(&mut rx).is_empty());

        driver.set_enabled(true);
        assert_eq!(driver.on_tick().unwrap().tick, 3);
        assert_eq!(trigger.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn checkpoint_fires_on_its_modulus_only() {
        let (driver, _, mut rx) = driver_with(IntervalConfig::default());
        driver.set_checkpoint_interval(20);
        driver.set_broadcast_interval(1000);
        for _ in 0..45 {
            driver.on_tick();
        }
        let all = frames(&mut rx);
        let checkpoints = of_type(&all, "checkpoint");
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0]["tick"], 20);
        assert_eq!(checkpoints[0]["ticksSinceLastCheckpoint"], 20);
        assert_eq!(checkpoints[1]["tick"], 40);
        assert_eq!(checkpoints[1]["ticksSinceLastCheckpoint"], 20);
        assert_eq!(driver.stats().last_checkpoint_tick, 40);
    }

    #[test]
    fn checkpoint_interval_five_fires_at_five_and_ten() {
        let intervals = IntervalConfig {
            broadcast: 1000,
            checkpoint: 5,
            evolution: 100_000,
        };
        // Construction clamps too, so go through the raw fields afterwards.
        let (driver, _, mut rx) = driver_with(intervals);
        driver.checkpoint_interval.store(5, Ordering::Release);
        let fired: Vec<u64> = (0..12)
            .filter_map(|_| driver.on_tick())
            .filter(|o| o.checkpoint)
            .map(|o| o.tick)
            .collect();
        assert_eq!(fired, vec![5, 10]);
        assert_eq!(of_type(&frames(&mut rx), "checkpoint").len(), 2);
    }

    #[test]
    fn checkpoint_and_evolution_share_a_tick_in_order() {
        let (driver, trigger, mut rx) = driver_with(IntervalConfig {
            broadcast: 100,
            checkpoint: 50,
            evolution: 100,
        });
        let mut last = None;
        for _ in 0..100 {
            last = driver.on_tick();
        }
        let outcome = last.unwrap();
        assert!(outcome.clock && outcome.checkpoint && outcome.evolution);
        assert_eq!(trigger.ticks.lock().unwrap().as_slice(), &[100]);

        let all = frames(&mut rx);
        let at_100: Vec<&str> = all
            .iter()
            .filter(|f| f["tick"] == 100)
            .filter_map(|f| f["type"].as_str())
            .collect();
        assert_eq!(at_100, vec!["server_tick", "checkpoint", "evolution"]);
        assert_eq!(of_type(&all, "evolution")[0]["ticksSinceLastEvolution"], 100);
    }

    #[test]
    fn server_tick_carries_clock_fields() {
        let (driver, _, mut rx) = driver_with(IntervalConfig::default());
        driver.on_tick();
        let all = frames(&mut rx);
        let ticks = of_type(&all, "server_tick");
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0]["tick"], 1);
        assert!(ticks[0]["timestamp"].is_i64());
        assert!(ticks[0]["tps"].is_f64());
        assert_eq!(ticks[0]["onlinePlayers"], 0);
    }

    #[test]
    fn setters_clamp_to_minimums() {
        let (driver, _, _rx) = driver_with(IntervalConfig::default());
        assert_eq!(driver.set_broadcast_interval(0), 1);
        assert_eq!(driver.set_broadcast_interval(-5), 1);
        assert_eq!(driver.set_checkpoint_interval(3), 20);
        assert_eq!(driver.set_evolution_interval(0), 100);
        assert_eq!(driver.set_evolution_interval(250), 250);
        assert_eq!(
            IntervalConfig::clamped(0, 0, 0),
            IntervalConfig {
                broadcast: 1,
                checkpoint: 20,
                evolution: 100
            }
        );
    }

    #[test]
    fn interval_change_applies_from_next_tick_without_catch_up() {
        let (driver, trigger, _rx) = driver_with(IntervalConfig::default());
        driver.set_broadcast_interval(10);
        for _ in 0..9 {
            driver.on_tick();
        }
        driver.set_broadcast_interval(4);
        // Tick 8 was skipped under the old interval; nothing is replayed.
        driver.on_tick();
        driver.on_tick();
        driver.on_tick();
        assert_eq!(trigger.ticks.lock().unwrap().as_slice(), &[12]);
    }

    #[test]
    fn agent_actions_are_tracked() {
        let (driver, _, _rx) = driver_with(IntervalConfig::default());
        assert_eq!(driver.ticks_since_last_action("alpha"), None);
        driver.on_tick();
        driver.record_agent_action("alpha", driver.current_tick());
        for _ in 0..4 {
            driver.on_tick();
        }
        assert_eq!(driver.ticks_since_last_action("alpha"), Some(4));
        assert_eq!(driver.stats().active_agents, 1);
    }

    #[test]
    fn forgotten_agents_stop_counting_as_active() {
        let (driver, _, _rx) = driver_with(IntervalConfig::default());
        driver.record_agent_action("alpha", 0);
        driver.record_agent_action("bravo", 0);
        assert!(driver.forget_agent("alpha"));
        assert!(!driver.forget_agent("alpha"));
        assert_eq!(driver.ticks_since_last_action("alpha"), None);
        assert_eq!(driver.stats().active_agents, 1);
    }

    #[test]
    fn tps_never_exceeds_nominal() {
        let (driver, _, _rx) = driver_with(IntervalConfig::default());
        for _ in 0..50 {
            driver.on_tick();
        }
        assert!(driver.stats().tps <= 20.0);
    }
}
