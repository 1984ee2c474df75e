//! Document synchronization between peers.
//!
//! # Architecture
//!
//! ```text
//!  peer A ──┐                          ┌── peer B
//!           │   SYNC_STEP1 / STEP2     │
//!           ├──── SYNC_UPDATE ─────────┤
//!           │   AWARENESS / QUERY      │
//!           └──────── relay server ────┘
//! ```
//!
//! - [`SyncMessage`]: the binary frame codec shared by clients and the server
//! - [`Awareness`]: ephemeral presence state with per-client logical clocks
//! - [`SyncPeer`]: handshake and update handling over a [`WorkspaceDocument`](crate::crdt::WorkspaceDocument),
//!   independent of the transport
//! - `SyncClient` (feature `native-sync`): WebSocket client built on
//!   tokio-tungstenite

mod awareness;
#[cfg(feature = "native-sync")]
mod client;
mod peer;
mod protocol;

pub use awareness::{Awareness, AwarenessChanges, AwarenessEntry, AwarenessUpdate};
#[cfg(feature = "native-sync")]
pub use client::{SyncClient, SyncStatus, sync_url};
pub use peer::{SyncPeer, SyncReply};
pub use protocol::{
    MSG_AWARENESS, MSG_QUERY_AWARENESS, MSG_SYNC_STEP1, MSG_SYNC_STEP2, MSG_SYNC_UPDATE,
    ProtocolError, SyncMessage,
};
