//! `WebSocket` transport adapter.
//!
//! Each upgraded socket gets a [`ConnectionHandle`] whose outbound queue is
//! drained onto the socket by the same task that reads inbound frames. The
//! task calls the protocol handler's hooks and nothing else: `on_open` once,
//! `on_message` per text frame, and `on_close` exactly once on the way out,
//! whatever ended the connection (peer close, read or write error, idle
//! timeout, or a close requested by the core).
//!
//! A peer that sends nothing, not even a pong, for the idle timeout is
//! closed with a normal (1000) close frame.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tickstream_core::{ConnectionHandle, Outbound, close_code};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::state::AppState;

/// Upgrade an HTTP request to a telemetry stream connection.
///
/// # Route
///
/// `GET /` and `GET /ws`
pub async fn ws_stream(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let (handle, mut outbound) = ConnectionHandle::new(state.outbound_buffer);
    let id = handle.id();
    state.handler.on_open(handle);

    let idle = state.idle_timeout.max(Duration::from_millis(2));
    let mut ping = tokio::time::interval(idle / 2);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ping.tick().await;
    let deadline = tokio::time::sleep(idle);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Frame(frame)) => {
                    if socket.send(Message::Text(frame.as_ref().into())).await.is_err() {
                        debug!(connection = %id, "write failed");
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
                        debug!(connection = %id, error = %e, "close frame not sent");
                    }
                    break;
                }
                None => break,
            },
            inbound = socket.recv() => {
                deadline.as_mut().reset(Instant::now() + idle);
                match inbound {
                    Some(Ok(Message::Text(text))) => state.handler.on_message(id, text.as_str()),
                    Some(Ok(Message::Binary(_))) => {
                        debug!(connection = %id, "binary frame ignored");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection = %id, error = %e, "read failed");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!(connection = %id, "ping failed");
                    break;
                }
            }
            () = &mut deadline => {
                info!(connection = %id, idle_ms = idle.as_millis(), "idle timeout");
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "Idle timeout".into(),
                };
                if let Err(e) = socket.send(Message::Close(Some(frame))).await {
                    debug!(connection = %id, error = %e, "idle close frame not sent");
                }
                break;
            }
        }
    }

    state.handler.on_close(id);
}
