//! Socket lifecycle tests over loopback.
//!
//! A real server is bound on an ephemeral port and driven by a
//! tokio-tungstenite client, so these tests observe frames and close codes
//! as they travel over the wire, and check that every way a socket can end
//! purges the gate and the registry.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tickstream_core::{
    AgentRegistry, ConnectionGate, FanoutEngine, FanoutTrigger, InMemoryWorld, IntervalConfig,
    ProtocolHandler, SnapshotProvider, TickDriver, WorldView,
};
use tickstream_protocol::Position;
use tickstream_server::{AppState, ServerConfig, TransportServer};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct Running {
    addr: SocketAddr,
    handler: Arc<ProtocolHandler>,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<(), tickstream_server::ServerError>>,
}

impl Running {
    async fn finish(self) {
        self.stop.send(true).unwrap();
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap().unwrap();
    }
}

async fn start(idle_timeout: Duration) -> Running {
    let gate = Arc::new(ConnectionGate::new("secret"));
    let registry = Arc::new(AgentRegistry::new(Arc::clone(&gate)));
    let world = Arc::new(InMemoryWorld::with_default_position(Position::new(
        "overworld",
        0.0,
        64.0,
        0.0,
    )));
    let engine = Arc::new(FanoutEngine::new(
        Arc::clone(&registry),
        Arc::clone(&world) as Arc<dyn WorldView>,
        Arc::clone(&world) as Arc<dyn SnapshotProvider>,
        16,
    ));
    let driver = Arc::new(TickDriver::new(
        Arc::clone(&gate),
        world,
        engine as Arc<dyn FanoutTrigger>,
        IntervalConfig::default(),
        Duration::from_millis(50),
    ));
    let handler = Arc::new(ProtocolHandler::new(gate, registry, driver));
    let state = Arc::new(AppState::new(Arc::clone(&handler)).with_idle_timeout(idle_timeout));

    let config = ServerConfig {
        host: String::from("127.0.0.1"),
        port: 0,
    };
    let server = TransportServer::bind(&config, state).await.unwrap();
    let addr = server.local_addr();
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(server.serve(stop_rx));
    Running {
        addr,
        handler,
        stop,
        task,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = tokio::time::timeout(WAIT, connect_async(format!("ws://{addr}/ws")))
        .await
        .unwrap()
        .unwrap();
    ws
}

/// Next text or close frame. Pings and pongs are skipped.
async fn next_frame(ws: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

fn json(message: &Message) -> Value {
    serde_json::from_str(message.to_text().unwrap()).unwrap()
}

fn close_code(message: &Message) -> Option<u16> {
    match message {
        Message::Close(Some(frame)) => Some(u16::from(frame.code)),
        _ => None,
    }
}

async fn send(ws: &mut Client, text: &str) {
    ws.send(Message::text(text)).await.unwrap();
}

async fn login(ws: &mut Client) {
    assert_eq!(json(&next_frame(ws).await)["type"], "auth_required");
    send(ws, r#"{"type":"auth","token":"secret"}"#).await;
    assert_eq!(json(&next_frame(ws).await)["type"], "auth_success");
}

/// Poll `check` until it holds or the wait runs out.
async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn handshake_registration_and_ticks_over_a_socket() {
    let running = start(Duration::from_secs(30)).await;
    let mut ws = connect(running.addr).await;
    login(&mut ws).await;

    send(&mut ws, r#"{"type":"register_bot","botName":"alpha"}"#).await;
    let registered = json(&next_frame(&mut ws).await);
    assert_eq!(registered["type"], "registration_success");
    assert_eq!(registered["botName"], "alpha");

    running.handler.driver().on_tick();
    let tick = json(&next_frame(&mut ws).await);
    assert_eq!(tick["type"], "server_tick");
    assert_eq!(tick["tick"], 1);
    let update = json(&next_frame(&mut ws).await);
    assert_eq!(update["type"], "sensor_update");
    assert_eq!(update["botName"], "alpha");

    ws.close(None).await.unwrap();
    let handler = Arc::clone(&running.handler);
    assert!(eventually(|| handler.gate().connection_count() == 0 && handler.registry().is_empty()).await);
    running.finish().await;
}

#[tokio::test]
async fn bad_token_is_closed_with_1008_on_the_wire() {
    let running = start(Duration::from_secs(30)).await;
    let mut ws = connect(running.addr).await;
    assert_eq!(json(&next_frame(&mut ws).await)["type"], "auth_required");

    send(&mut ws, r#"{"type":"auth","token":"wrong"}"#).await;
    let error = json(&next_frame(&mut ws).await);
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Invalid authentication token");
    assert_eq!(close_code(&next_frame(&mut ws).await), Some(1008));

    let handler = Arc::clone(&running.handler);
    assert!(eventually(|| handler.gate().connection_count() == 0).await);
    assert_eq!(handler.gate().authenticated_count(), 0);
    running.finish().await;
}

#[tokio::test]
async fn shutdown_notifies_then_closes_with_1001_on_the_wire() {
    let running = start(Duration::from_secs(30)).await;
    let mut ws = connect(running.addr).await;
    login(&mut ws).await;

    assert_eq!(running.handler.shutdown(), 1);
    assert_eq!(json(&next_frame(&mut ws).await)["type"], "server_shutdown");
    assert_eq!(close_code(&next_frame(&mut ws).await), Some(1001));

    let handler = Arc::clone(&running.handler);
    assert!(eventually(|| handler.gate().connection_count() == 0).await);
    running.finish().await;
}

#[tokio::test]
async fn dropped_socket_is_purged_from_gate_and_registry() {
    let running = start(Duration::from_secs(30)).await;
    let mut ws = connect(running.addr).await;
    login(&mut ws).await;
    send(&mut ws, r#"{"type":"register_bot","botName":"alpha"}"#).await;
    assert_eq!(json(&next_frame(&mut ws).await)["type"], "registration_success");
    assert_eq!(running.handler.registry().len(), 1);

    // No close handshake: the TCP stream just goes away.
    drop(ws);

    let handler = Arc::clone(&running.handler);
    assert!(eventually(|| handler.gate().connection_count() == 0).await);
    assert!(handler.registry().lookup("alpha").is_none());
    assert_eq!(handler.gate().authenticated_count(), 0);
    running.finish().await;
}

#[tokio::test]
async fn silent_peer_is_closed_after_idle_timeout() {
    let running = start(Duration::from_millis(300)).await;
    let mut ws = connect(running.addr).await;
    assert_eq!(json(&next_frame(&mut ws).await)["type"], "auth_required");

    // Not reading means the client never answers the server's pings.
    tokio::time::sleep(Duration::from_millis(900)).await;

    let closing = next_frame(&mut ws).await;
    assert_eq!(close_code(&closing), Some(1000));
    let handler = Arc::clone(&running.handler);
    assert!(eventually(|| handler.gate().connection_count() == 0).await);
    running.finish().await;
}

#[tokio::test]
async fn active_peer_outlives_the_idle_timeout() {
    let running = start(Duration::from_millis(300)).await;
    let mut ws = connect(running.addr).await;
    login(&mut ws).await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        send(&mut ws, r#"{"type":"heartbeat"}"#).await;
        assert_eq!(json(&next_frame(&mut ws).await)["type"], "heartbeat");
    }
    assert_eq!(running.handler.gate().authenticated_count(), 1);

    ws.close(None).await.unwrap();
    running.finish().await;
}
