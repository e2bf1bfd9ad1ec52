//! End-to-end protocol flows through the transport-agnostic handler.
//!
//! Each simulated client is a [`ConnectionHandle`] plus the receiving end
//! of its outbound queue, so these tests observe exactly the frames a real
//! socket would carry.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tickstream_core::{
    AgentRegistry, ConnectionGate, ConnectionHandle, ConnectionId, FanoutEngine, FanoutTrigger,
    InMemoryWorld, IntervalConfig, Outbound, OutboundQueue, ProtocolHandler, SnapshotProvider,
    TickDriver, WorldView,
};
use tickstream_protocol::Position;

struct Stack {
    handler: ProtocolHandler,
    world: Arc<InMemoryWorld>,
}

fn stack(intervals: IntervalConfig) -> Stack {
    let gate = Arc::new(ConnectionGate::new("s3cret"));
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&gate)));
    let world = Arc::new(InMemoryWorld::new());
    let engine = Arc::new(FanoutEngine::new(
        Arc::clone(&registry),
        Arc::clone(&world) as Arc<dyn WorldView>,
        Arc::clone(&world) as Arc<dyn SnapshotProvider>,
        16,
    ));
    let driver = Arc::new(TickDriver::new(
        Arc::clone(&gate),
        Arc::clone(&world) as Arc<dyn WorldView>,
        engine as Arc<dyn FanoutTrigger>,
        intervals,
        Duration::from_millis(50),
    ));
    Stack {
        handler: ProtocolHandler::new(gate, registry, driver),
        world,
    }
}

fn drain(rx: &mut OutboundQueue) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        match item {
            Outbound::Frame(frame) => out.push(serde_json::from_str(&frame).unwrap()),
            Outbound::Close { code, .. } => out.push(serde_json::json!({ "type": "close", "code": code })),
        }
    }
    out
}

fn types(frames: &[Value]) -> Vec<&str> {
    frames.iter().filter_map(|f| f["type"].as_str()).collect()
}

fn bot(stack: &Stack, name: &str) -> (ConnectionId, OutboundQueue) {
    let (handle, mut rx) = ConnectionHandle::new(64);
    let id = handle.id();
    stack.handler.on_open(handle);
    stack.handler.on_message(id, r#"{"type":"auth","token":"s3cret"}"#);
    stack
        .handler
        .on_message(id, &format!(r#"{{"type":"register_bot","botName":"{name}","agentType":"scout"}}"#));
    stack.world.place(name, Position::new("overworld", 0.0, 64.0, 0.0));
    assert_eq!(
        types(&drain(&mut rx)),
        vec!["auth_required", "auth_success", "registration_success"]
    );
    (id, rx)
}

#[test]
fn one_tick_fans_out_one_update_per_agent() {
    let stack = stack(IntervalConfig::default());
    let (_, mut alpha) = bot(&stack, "alpha");
    let (_, mut bravo) = bot(&stack, "bravo");
    stack.world.place("bravo", Position::new("overworld", 3.0, 64.0, 4.0));

    stack.handler.driver().on_tick();

    let alpha_frames = drain(&mut alpha);
    let bravo_frames = drain(&mut bravo);
    assert_eq!(types(&alpha_frames), vec!["server_tick", "sensor_update"]);
    assert_eq!(types(&bravo_frames), vec!["server_tick", "sensor_update"]);
    assert_eq!(alpha_frames[1]["botName"], "alpha");
    assert_eq!(bravo_frames[1]["botName"], "bravo");
    assert_eq!(alpha_frames[1]["data"]["agents"][0]["name"], "bravo");
    assert_eq!(alpha_frames[0]["onlinePlayers"], 2);
}

#[test]
fn absent_agent_does_not_starve_the_other() {
    let stack = stack(IntervalConfig::default());
    let (_, mut alpha) = bot(&stack, "alpha");
    let (_, mut bravo) = bot(&stack, "bravo");
    stack.world.remove("alpha");

    stack.handler.driver().on_tick();

    assert_eq!(types(&drain(&mut alpha)), vec!["server_tick"]);
    assert_eq!(types(&drain(&mut bravo)), vec!["server_tick", "sensor_update"]);
}

#[test]
fn unauthenticated_peer_hears_no_broadcasts() {
    let stack = stack(IntervalConfig::default());
    let (handle, mut lurker) = ConnectionHandle::new(64);
    stack.handler.on_open(handle);
    drain(&mut lurker);

    for _ in 0..3 {
        stack.handler.driver().on_tick();
    }
    assert!(drain(&mut lurker).is_empty());
}

#[test]
fn failed_auth_never_joins_and_is_closed() {
    let stack = stack(IntervalConfig::default());
    let (handle, mut rx) = ConnectionHandle::new(64);
    let id = handle.id();
    stack.handler.on_open(handle);
    stack.handler.on_message(id, r#"{"type":"auth","token":"S3CRET"}"#);
    // The socket is still draining its close; a retry must not get in.
    stack.handler.on_message(id, r#"{"type":"auth","token":"s3cret"}"#);
    stack.handler.driver().on_tick();

    assert_eq!(types(&drain(&mut rx)), vec!["auth_required", "error", "close"]);
    assert_eq!(stack.handler.gate().authenticated_count(), 0);
    stack.handler.on_close(id);

    stack.handler.driver().on_tick();
    assert!(drain(&mut rx).is_empty());
    assert_eq!(stack.handler.gate().authenticated_count(), 0);
    assert!(stack.handler.registry().is_empty());
}

#[test]
fn rebinding_moves_updates_to_the_new_connection() {
    let stack = stack(IntervalConfig::default());
    let (old_id, mut old) = bot(&stack, "alpha");
    let (_, mut new) = bot(&stack, "alpha");

    stack.handler.driver().on_tick();
    assert_eq!(types(&drain(&mut old)), vec!["server_tick"]);
    assert_eq!(types(&drain(&mut new)), vec!["server_tick", "sensor_update"]);

    // The superseded connection is still open and authenticated.
    assert!(stack.handler.gate().is_authenticated(old_id));
    stack.handler.on_close(old_id);
    assert!(stack.handler.registry().lookup("alpha").is_some());
}

#[test]
fn disconnect_stops_updates_and_frees_the_name() {
    let stack = stack(IntervalConfig::default());
    let (alpha_id, _alpha) = bot(&stack, "alpha");
    let (_, mut bravo) = bot(&stack, "bravo");

    stack.handler.on_close(alpha_id);
    stack.handler.driver().on_tick();

    assert_eq!(types(&drain(&mut bravo)), vec!["server_tick", "sensor_update"]);
    assert!(stack.handler.registry().lookup("alpha").is_none());
}

#[test]
fn milestones_reach_every_authenticated_client() {
    let stack = stack(IntervalConfig::default());
    let driver = stack.handler.driver();
    driver.set_broadcast_interval(1_000);
    driver.set_checkpoint_interval(20);
    driver.set_evolution_interval(100);
    let (_, mut alpha) = bot(&stack, "alpha");

    for _ in 0..100 {
        driver.on_tick();
    }
    let frames = drain(&mut alpha);
    let kinds = types(&frames);
    assert_eq!(kinds.iter().filter(|k| **k == "checkpoint").count(), 5);
    assert_eq!(kinds.iter().filter(|k| **k == "evolution").count(), 1);
    assert!(!kinds.contains(&"server_tick"));

    let stats = driver.stats();
    assert_eq!(stats.current_tick, 100);
    assert_eq!(stats.last_checkpoint_tick, 100);
    assert_eq!(stats.last_evolution_tick, 100);
}

#[test]
fn shutdown_reaches_every_open_connection() {
    let stack = stack(IntervalConfig::default());
    let (_, mut alpha) = bot(&stack, "alpha");
    let (pending, mut pending_rx) = ConnectionHandle::new(8);
    stack.handler.on_open(pending);
    drain(&mut pending_rx);

    stack.handler.shutdown();
    assert_eq!(types(&drain(&mut alpha)), vec!["server_shutdown", "close"]);
    assert_eq!(types(&drain(&mut pending_rx)), vec!["server_shutdown", "close"]);
}
