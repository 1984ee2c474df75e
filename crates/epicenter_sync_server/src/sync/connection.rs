use super::room::{Broadcast, SyncRoom};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one physical WebSocket connection.
///
/// Allocated once when the socket is accepted and carried by every event the
/// socket produces. Per-connection state is keyed by this id, never by the
/// event objects themselves, which are rebuilt for every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One inbound message as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub connection: ConnectionId,
    pub payload: Vec<u8>,
}

impl InboundEvent {
    pub fn new(connection: ConnectionId, payload: Vec<u8>) -> Self {
        Self {
            connection,
            payload,
        }
    }
}

/// Server-side bookkeeping for a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Document name of the room the connection joined.
    pub room: String,
    /// Awareness client ids announced over this connection; removed for
    /// everyone else when it closes.
    pub awareness_ids: HashSet<u64>,
    pub frames_received: u64,
}

impl ConnectionState {
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            awareness_ids: HashSet::new(),
            frames_received: 0,
        }
    }
}

/// Represents a connected client
pub struct ClientConnection {
    pub id: ConnectionId,
    room: Arc<SyncRoom>,
    broadcast_rx: broadcast::Receiver<Broadcast>,
}

impl ClientConnection {
    pub(crate) fn new(
        id: ConnectionId,
        room: Arc<SyncRoom>,
        broadcast_rx: broadcast::Receiver<Broadcast>,
    ) -> Self {
        Self {
            id,
            room,
            broadcast_rx,
        }
    }

    pub fn room(&self) -> &Arc<SyncRoom> {
        &self.room
    }

    /// Frames sent right after the socket opens: the server's step1, then
    /// the presence of everyone already in the room.
    pub fn opening_frames(&self) -> Vec<Vec<u8>> {
        self.room.opening_frames()
    }

    /// Wrap a received payload for [`SyncState::handle_inbound`](super::SyncState::handle_inbound).
    pub fn inbound(&self, payload: Vec<u8>) -> InboundEvent {
        InboundEvent::new(self.id, payload)
    }

    /// Receive the next broadcast message (from other clients)
    pub async fn recv_broadcast(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.broadcast_rx.recv().await {
                Ok(msg) if msg.from == self.id => continue,
                Ok(msg) => return Some(msg.frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        "Connection {} lagged {} messages in '{}', resending full state",
                        self.id,
                        n,
                        self.room.name()
                    );
                    return Some(self.room.full_state());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.room.unsubscribe();
        debug!(
            "Client disconnected: connection={}, room={}",
            self.id,
            self.room.name()
        );
    }
}
