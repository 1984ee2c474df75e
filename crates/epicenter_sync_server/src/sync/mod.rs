mod connection;
mod room;

pub use connection::{ClientConnection, ConnectionId, ConnectionState, InboundEvent};
pub use room::{Broadcast, DEFAULT_BROADCAST_CAPACITY, SyncRoom, SyncState, SyncStats};
