//! Transport-agnostic connection handles.
//!
//! A [`ConnectionHandle`] is the core's only way to talk to a peer. Frames
//! go through a bounded queue that the transport adapter drains onto the
//! socket. Every frame send is a non-blocking `try_send`, so neither the
//! tick driver nor the fan-out engine can ever stall on a slow peer; a full
//! queue drops the frame.
//!
//! Close requests travel on a separate single-slot watch channel, so a peer
//! that has filled its frame queue can still be closed. The
//! [`OutboundQueue`] yields queued frames first and the close last.

use std::fmt;
use std::sync::Arc;

use tickstream_protocol::{ProtocolError, ServerMessage};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// `WebSocket` close codes used by the server.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The server is going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Authentication failed.
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// Opaque identity of one connection, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle of a connection as seen by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `auth_required` sent, waiting for a matching `auth`.
    AuthPending,
    /// Handshake complete; member of the authenticated set.
    Authenticated,
    /// A bad token was presented. Terminal: the close has been requested
    /// and every further frame is ignored until the transport reports the
    /// socket gone.
    Rejected,
    /// Not known to the gate.
    Closed,
}

/// One item queued for the transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized JSON text frame. Shared so broadcasts encode once.
    Frame(Arc<str>),
    /// Close the connection with the given code and reason.
    Close {
        /// `WebSocket` close code.
        code: u16,
        /// Close reason text.
        reason: &'static str,
    },
}

/// Why a send did not reach the connection's queue.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The transport side has gone away.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    /// The peer is not draining its queue; the frame was dropped.
    #[error("outbound buffer full for connection {0}, frame dropped")]
    Full(ConnectionId),

    /// The message could not be serialized.
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// A pending request to close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CloseRequest {
    code: u16,
    reason: &'static str,
}

/// Cheap, cloneable sending half of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    frames: mpsc::Sender<Arc<str>>,
    close: Arc<watch::Sender<Option<CloseRequest>>>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh id and a frame queue of `capacity`
    /// items. The transport keeps the [`OutboundQueue`] and writes what it
    /// yields.
    pub fn new(capacity: usize) -> (Self, OutboundQueue) {
        let (frames, frames_rx) = mpsc::channel(capacity.max(1));
        let (close, close_rx) = watch::channel(None);
        let handle = Self {
            id: ConnectionId::new(),
            frames,
            close: Arc::new(close),
        };
        let queue = OutboundQueue {
            frames: frames_rx,
            close: close_rx,
            finished: false,
        };
        (handle, queue)
    }

    /// This connection's identity.
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Serialize and queue one message.
    pub fn send(&self, message: &ServerMessage) -> Result<(), SendError> {
        let frame: Arc<str> = message.to_frame()?.into();
        self.send_frame(frame)
    }

    /// Queue an already-serialized frame.
    pub fn send_frame(&self, frame: Arc<str>) -> Result<(), SendError> {
        self.frames.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full(self.id),
            TrySendError::Closed(_) => SendError::Closed(self.id),
        })
    }

    /// Ask the transport to close the connection.
    ///
    /// Never blocked by a full frame queue. The first request wins; later
    /// ones are accepted and ignored.
    pub fn close(&self, code: u16, reason: &'static str) -> Result<(), SendError> {
        if self.close.is_closed() {
            return Err(SendError::Closed(self.id));
        }
        self.close.send_if_modified(|pending| {
            if pending.is_some() {
                return false;
            }
            *pending = Some(CloseRequest { code, reason });
            true
        });
        Ok(())
    }

    /// Whether the transport has dropped its receiving half.
    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

/// Receiving half of a connection, owned by the transport writer.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: mpsc::Receiver<Arc<str>>,
    close: watch::Receiver<Option<CloseRequest>>,
    finished: bool,
}

impl OutboundQueue {
    /// Take the next item without waiting.
    ///
    /// Queued frames come first. Once they are drained a pending close is
    /// yielded exactly once, after which the queue reports disconnected.
    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        if self.finished {
            return Err(TryRecvError::Disconnected);
        }
        let empty = match self.frames.try_recv() {
            Ok(frame) => return Ok(Outbound::Frame(frame)),
            Err(e) => e,
        };
        let pending = *self.close.borrow_and_update();
        match pending {
            Some(CloseRequest { code, reason }) => {
                self.finished = true;
                Ok(Outbound::Close { code, reason })
            }
            None => Err(empty),
        }
    }

    /// Wait for the next item. `None` once a close has been yielded or
    /// every handle is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            match self.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }
            tokio::select! {
                frame = self.frames.recv() => {
                    if let Some(frame) = frame {
                        return Some(Outbound::Frame(frame));
                    }
                }
                _ = self.close.changed() => {}
            }
        }
    }
}
