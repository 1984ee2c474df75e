use super::connection::{ClientConnection, ConnectionId, ConnectionState, InboundEvent};
use epicenter_core::crdt::{PersistenceHandle, PersistenceProvider, WorkspaceDocument};
use epicenter_core::sync::{Awareness, AwarenessUpdate, SyncMessage, SyncPeer, SyncReply};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

/// Frames a room buffers per receiver before a slow connection lags.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// A frame fanned out to every connection of a room except its sender.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub from: ConnectionId,
    pub frame: Vec<u8>,
}

/// Statistics about the sync state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Global sync state managing all rooms
pub struct SyncState {
    /// Map of document name to SyncRoom
    rooms: RwLock<HashMap<String, Arc<SyncRoom>>>,
    /// Per-connection state, keyed by the physical connection
    connections: Mutex<HashMap<ConnectionId, ConnectionState>>,
    provider: Arc<dyn PersistenceProvider>,
    save_debounce: Duration,
    broadcast_capacity: usize,
}

impl SyncState {
    /// Create a new SyncState persisting rooms through `provider`
    pub fn new(provider: Arc<dyn PersistenceProvider>, save_debounce: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            provider,
            save_debounce,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    /// Register a new connection to the room of `document_name`, creating
    /// and loading the room on first join.
    pub async fn connect(&self, document_name: &str) -> epicenter_core::Result<ClientConnection> {
        let id = ConnectionId::next();
        let (room, broadcast_rx) = self.join_room(document_name).await?;
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, ConnectionState::new(document_name));

        info!(
            "Connection {} joined '{}', connections={}",
            id,
            document_name,
            room.connection_count()
        );
        Ok(ClientConnection::new(id, room, broadcast_rx))
    }

    /// Subscribe to a room, creating it if needed. The subscription is taken
    /// under the rooms lock so an idle room cannot be removed in between.
    async fn join_room(
        &self,
        document_name: &str,
    ) -> epicenter_core::Result<(Arc<SyncRoom>, broadcast::Receiver<Broadcast>)> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_name) {
                return Ok((room.clone(), room.subscribe()));
            }
        }

        let mut rooms = self.rooms.write().await;

        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(document_name) {
            return Ok((room.clone(), room.subscribe()));
        }

        let room = Arc::new(SyncRoom::open(
            document_name,
            Arc::clone(&self.provider),
            self.save_debounce,
            self.broadcast_capacity,
        )?);
        let rx = room.subscribe();
        rooms.insert(document_name.to_string(), room.clone());
        info!("Created sync room for document: {}", document_name);

        Ok((room, rx))
    }

    pub async fn get_room(&self, document_name: &str) -> Option<Arc<SyncRoom>> {
        self.rooms.read().await.get(document_name).cloned()
    }

    /// Snapshot of one connection's state.
    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Handle one inbound message and return the frames to send back to its
    /// sender. Anything for the other peers goes out through the room's
    /// broadcast channel.
    ///
    /// Malformed messages are logged and dropped; they never end the
    /// connection.
    pub async fn handle_inbound(&self, event: &InboundEvent) -> Vec<Vec<u8>> {
        let room_name = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            let Some(state) = connections.get_mut(&event.connection) else {
                warn!("Dropping message from unknown connection {}", event.connection);
                return Vec::new();
            };
            state.frames_received += 1;
            state.room.clone()
        };
        let Some(room) = self.get_room(&room_name).await else {
            warn!("Dropping message for closed room '{}'", room_name);
            return Vec::new();
        };

        let messages = match SyncMessage::decode_all(&event.payload) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(
                    "Dropping malformed message from {} ({} bytes): {}",
                    event.connection,
                    event.payload.len(),
                    e
                );
                return Vec::new();
            }
        };

        let mut replies = Vec::new();
        for message in messages {
            match message {
                SyncMessage::Awareness(payload) => {
                    let update = match AwarenessUpdate::decode(&payload) {
                        Ok(update) => update,
                        Err(e) => {
                            warn!("Ignoring awareness from {}: {}", event.connection, e);
                            continue;
                        }
                    };
                    self.record_awareness_ids(event.connection, &update);
                    if room.apply_awareness(&update) {
                        room.broadcast(event.connection, SyncMessage::Awareness(payload).encode());
                    }
                }
                SyncMessage::QueryAwareness => {
                    replies.push(room.awareness_frame());
                }
                message => match room.peer().handle(&message) {
                    Ok(SyncReply::Reply(reply)) => replies.push(reply.encode()),
                    Ok(SyncReply::Applied(update)) => {
                        room.broadcast(event.connection, SyncMessage::Update(update).encode());
                    }
                    Ok(SyncReply::Noop) | Ok(SyncReply::Unhandled) => {}
                    Err(e) => warn!(
                        "Failed to apply message from {} to '{}': {}",
                        event.connection,
                        room.name(),
                        e
                    ),
                },
            }
        }
        replies
    }

    fn record_awareness_ids(&self, id: ConnectionId, update: &AwarenessUpdate) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = connections.get_mut(&id) {
            state.awareness_ids.extend(update.client_ids());
        }
    }

    /// Tear down a connection: withdraw the presence it announced from the
    /// remaining peers and drop the room once nobody is left.
    pub async fn disconnect(&self, connection: ClientConnection) {
        let id = connection.id;
        let room = Arc::clone(connection.room());
        let state = self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);

        if let Some(state) = state {
            let client_ids: Vec<u64> = state.awareness_ids.into_iter().collect();
            let removal = room.remove_awareness(&client_ids);
            if !removal.entries.is_empty() {
                debug!(
                    "Removing {} awareness states of {} from '{}'",
                    removal.entries.len(),
                    id,
                    room.name()
                );
                room.broadcast(id, SyncMessage::Awareness(removal.encode()).encode());
            }
        }

        drop(connection);
        self.maybe_remove_room(room.name()).await;
    }

    /// Remove a room if it has no active connections
    pub async fn maybe_remove_room(&self, document_name: &str) {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(document_name) {
            if room.connection_count() == 0 {
                // Save the room state before removing
                if let Err(e) = room.close().await {
                    error!("Failed to save room {} before removal: {}", document_name, e);
                }
                rooms.remove(document_name);
                info!("Removed idle sync room: {}", document_name);
            }
        }
    }

    /// Get statistics about the sync state
    pub async fn stats(&self) -> SyncStats {
        let rooms = self.rooms.read().await;
        let active_connections: usize = rooms.values().map(|r| r.connection_count()).sum();

        SyncStats {
            active_connections,
            active_rooms: rooms.len(),
        }
    }

    /// Save and drop every room. Called once the server stopped accepting.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<SyncRoom>> = self.rooms.write().await.drain().map(|(_, r)| r).collect();
        for room in rooms {
            if let Err(e) = room.close().await {
                error!("Failed to save room {} on shutdown: {}", room.name(), e);
            }
        }
        info!("All sync rooms saved");
    }
}

/// The server replica of one document and everyone connected to it.
pub struct SyncRoom {
    name: String,
    peer: SyncPeer,
    awareness: Mutex<Awareness>,
    broadcast_tx: broadcast::Sender<Broadcast>,
    persistence: tokio::sync::Mutex<Option<PersistenceHandle>>,
    connection_count: AtomicUsize,
}

impl SyncRoom {
    /// Load the document from storage (empty if missing or unreadable) and
    /// start saving it as updates arrive.
    pub fn open(
        name: &str,
        provider: Arc<dyn PersistenceProvider>,
        save_debounce: Duration,
        broadcast_capacity: usize,
    ) -> epicenter_core::Result<Self> {
        let document = WorkspaceDocument::load_named(provider.as_ref(), name);
        let persistence = PersistenceHandle::attach(document.clone(), provider, save_debounce, false)?;
        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity);

        Ok(Self {
            name: name.to_string(),
            peer: SyncPeer::new(document),
            awareness: Mutex::new(Awareness::relay()),
            broadcast_tx,
            persistence: tokio::sync::Mutex::new(Some(persistence)),
            connection_count: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> &SyncPeer {
        &self.peer
    }

    pub fn document(&self) -> &WorkspaceDocument {
        self.peer.document()
    }

    /// Subscribe to room updates
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        self.broadcast_tx.subscribe()
    }

    /// Unsubscribe from room updates
    pub fn unsubscribe(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Fan a frame out to every other connection. Nobody listening is fine.
    pub fn broadcast(&self, from: ConnectionId, frame: Vec<u8>) {
        let _ = self.broadcast_tx.send(Broadcast { from, frame });
    }

    pub(crate) fn opening_frames(&self) -> Vec<Vec<u8>> {
        let mut frames = vec![self.peer.step1().encode()];
        let awareness = self.awareness.lock().unwrap_or_else(|e| e.into_inner());
        let present = awareness.full_update();
        if !present.entries.is_empty() {
            frames.push(SyncMessage::Awareness(present.encode()).encode());
        }
        frames
    }

    /// The whole document as a step2 frame.
    pub fn full_state(&self) -> Vec<u8> {
        self.peer.full_state().encode()
    }

    /// Every live presence state as an awareness frame.
    pub fn awareness_frame(&self) -> Vec<u8> {
        let awareness = self.awareness.lock().unwrap_or_else(|e| e.into_inner());
        SyncMessage::Awareness(awareness.full_update().encode()).encode()
    }

    /// Live presence states held by the room, by client id.
    pub fn awareness_states(&self) -> std::collections::BTreeMap<u64, serde_json::Value> {
        self.awareness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .states()
    }

    /// Merge a client's awareness update. Returns whether anything changed.
    fn apply_awareness(&self, update: &AwarenessUpdate) -> bool {
        let changes = self
            .awareness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .apply(update);
        !changes.is_empty()
    }

    fn remove_awareness(&self, client_ids: &[u64]) -> AwarenessUpdate {
        self.awareness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove_clients(client_ids)
    }

    /// Stop persisting and write the final snapshot. Later calls are no-ops.
    pub async fn close(&self) -> epicenter_core::Result<()> {
        match self.persistence.lock().await.take() {
            Some(persistence) => persistence.shutdown().await,
            None => Ok(()),
        }
    }
}
