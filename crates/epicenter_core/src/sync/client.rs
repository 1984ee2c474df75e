//! WebSocket sync client for native apps.
//!
//! Connects a [`WorkspaceDocument`] to a relay server at
//! `{server}/sync/{documentName}`, runs the handshake, streams local updates
//! out and applies remote ones as they arrive.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use yrs::Subscription;

use super::awareness::{Awareness, AwarenessUpdate};
use super::peer::{SyncPeer, SyncReply};
use super::protocol::SyncMessage;
use crate::crdt::WorkspaceDocument;
use crate::error::{EpicenterError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection state reported by [`SyncClient::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Connected, initial state not received yet.
    Connecting,
    /// The server's step2 has been applied.
    Synced,
    Disconnected,
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

/// A live connection between one document and a relay server.
pub struct SyncClient {
    url: String,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    status: watch::Receiver<SyncStatus>,
    awareness: Arc<Mutex<Awareness>>,
    awareness_id: u64,
    task: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

/// Build the WebSocket URL of a document on a relay server.
pub fn sync_url(server_url: &str, document_name: &str) -> Result<String> {
    let url = format!("{}/sync/{}", server_url.trim_end_matches('/'), document_name);
    let parsed = url::Url::parse(&url)
        .map_err(|e| EpicenterError::Sync(format!("Invalid server URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(EpicenterError::Sync(format!(
            "Unsupported scheme '{}', expected ws or wss",
            other
        ))),
    }
}

/// Awareness ids stay below 2^53 so JavaScript peers can hold them.
fn new_awareness_id() -> u64 {
    uuid::Uuid::new_v4().as_u64_pair().0 >> 11
}

impl SyncClient {
    /// Connect and start syncing. Must be called inside a tokio runtime.
    pub async fn connect(server_url: &str, document: WorkspaceDocument) -> Result<Self> {
        let url = sync_url(server_url, document.name())?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| EpicenterError::Sync(format!("WebSocket connection to {} failed: {}", url, e)))?;
        log::info!("[SyncClient] Connected to {}", url);

        let (outgoing, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SyncStatus::Connecting);
        let awareness_id = new_awareness_id();
        let awareness = Arc::new(Mutex::new(Awareness::new(awareness_id)));
        let peer = SyncPeer::new(document.clone());

        // Local edits go out as updates; remote ones came from the server.
        let subscription = {
            let outgoing = outgoing.clone();
            document.observe_updates(move |update, is_remote| {
                if !is_remote {
                    let frame = SyncMessage::Update(update.to_vec()).encode();
                    let _ = outgoing.send(Outgoing::Frame(frame));
                }
            })?
        };

        let _ = outgoing.send(Outgoing::Frame(peer.step1().encode()));

        let task = tokio::spawn(connection_task(
            ws_stream,
            peer,
            Arc::clone(&awareness),
            outgoing.clone(),
            rx,
            status_tx,
        ));

        Ok(Self {
            url,
            outgoing,
            status,
            awareness,
            awareness_id,
            task: Some(task),
            subscription: Some(subscription),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn is_synced(&self) -> bool {
        self.status() == SyncStatus::Synced
    }

    /// Wait until the initial state from the server has been applied.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<()> {
        let mut status = self.status.clone();
        let reached = tokio::time::timeout(
            timeout,
            status.wait_for(|s| *s != SyncStatus::Connecting),
        )
        .await
        .map_err(|_| EpicenterError::Sync(format!("Timed out waiting for sync with {}", self.url)))?
        .map(|s| *s)
        .unwrap_or(SyncStatus::Disconnected);

        match reached {
            SyncStatus::Synced => Ok(()),
            _ => Err(EpicenterError::Sync(format!(
                "Connection to {} closed before sync",
                self.url
            ))),
        }
    }

    /// Publish this client's presence.
    pub fn set_awareness(&self, state: Value) {
        let update = self
            .awareness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_local_state(state);
        self.send(SyncMessage::Awareness(update.encode()));
    }

    /// Live presence of every known client, including this one.
    pub fn awareness_states(&self) -> BTreeMap<u64, Value> {
        self.awareness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .states()
    }

    pub fn awareness_client_id(&self) -> u64 {
        self.awareness_id
    }

    /// Ask the server for every presence state it knows.
    pub fn query_awareness(&self) {
        self.send(SyncMessage::QueryAwareness);
    }

    fn send(&self, message: SyncMessage) {
        if self.outgoing.send(Outgoing::Frame(message.encode())).is_err() {
            log::debug!("[SyncClient] Dropping message, connection is closed");
        }
    }

    /// Withdraw presence, close the socket and wait for the connection task.
    pub async fn close(mut self) {
        self.subscription.take();

        let removal = self
            .awareness
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear_local_state();
        self.send(SyncMessage::Awareness(removal.encode()));
        let _ = self.outgoing.send(Outgoing::Close);

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(Duration::from_secs(5), &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("[SyncClient] Connection task failed: {}", e),
                Err(_) => {
                    log::warn!("[SyncClient] Timed out closing {}", self.url);
                    task.abort();
                }
            }
        }
        log::info!("[SyncClient] Disconnected from {}", self.url);
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn connection_task(
    ws_stream: WsStream,
    peer: SyncPeer,
    awareness: Arc<Mutex<Awareness>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    status: watch::Sender<SyncStatus>,
) {
    let (mut write, mut read) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let result = match item {
                Outgoing::Frame(frame) => write.send(Message::Binary(frame.into())).await,
                Outgoing::Close => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = result {
                log::error!("[SyncClient] Send error: {}", e);
                break;
            }
        }
    });

    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => {
                handle_frames(&data, &peer, &awareness, &outgoing, &status);
            }
            Ok(Message::Close(_)) => {
                log::info!("[SyncClient] Connection closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("[SyncClient] Read error: {}", e);
                break;
            }
        }
    }

    status.send_replace(SyncStatus::Disconnected);
    send_task.abort();
    let _ = send_task.await;
}

fn handle_frames(
    data: &[u8],
    peer: &SyncPeer,
    awareness: &Mutex<Awareness>,
    outgoing: &mpsc::UnboundedSender<Outgoing>,
    status: &watch::Sender<SyncStatus>,
) {
    let messages = match SyncMessage::decode_all(data) {
        Ok(messages) => messages,
        Err(e) => {
            log::warn!("[SyncClient] Dropping malformed message ({} bytes): {}", data.len(), e);
            return;
        }
    };

    for message in messages {
        match &message {
            SyncMessage::Awareness(payload) => {
                let mut awareness = awareness.lock().unwrap_or_else(|e| e.into_inner());
                match AwarenessUpdate::decode(payload) {
                    Ok(update) => {
                        let changes = awareness.apply(&update);
                        if !changes.is_empty() {
                            log::debug!("[SyncClient] Awareness changed: {:?}", changes);
                        }
                    }
                    Err(e) => log::warn!("[SyncClient] Ignoring awareness update: {}", e),
                }
                continue;
            }
            SyncMessage::QueryAwareness => {
                let full = awareness
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .full_update();
                let frame = SyncMessage::Awareness(full.encode()).encode();
                let _ = outgoing.send(Outgoing::Frame(frame));
                continue;
            }
            _ => {}
        }

        match peer.handle(&message) {
            Ok(SyncReply::Reply(reply)) => {
                let _ = outgoing.send(Outgoing::Frame(reply.encode()));
            }
            Ok(_) => {}
            Err(e) => log::warn!("[SyncClient] Failed to apply server message: {}", e),
        }
        if matches!(message, SyncMessage::SyncStep2(_)) {
            status.send_if_modified(|s| {
                let changed = *s == SyncStatus::Connecting;
                if changed {
                    *s = SyncStatus::Synced;
                }
                changed
            });
        }
    }
}
