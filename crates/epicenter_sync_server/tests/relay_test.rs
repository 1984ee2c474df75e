//! Relay behaviour over real sockets.

use std::sync::Arc;
use std::time::Duration;

use epicenter_core::crdt::{
    MemoryStorage, PersistenceProvider, Row, TableDefinition, WorkspaceDocument, cells,
};
use epicenter_core::config::WorkspaceConfig;
use epicenter_core::sync::{AwarenessEntry, AwarenessUpdate, SyncClient, SyncMessage};
use epicenter_core::{EpicenterError, Field, Value, WorkspaceRegistry};
use epicenter_sync_server::handlers::router;
use epicenter_sync_server::sync::SyncState;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    url: String,
    addr: std::net::SocketAddr,
    state: Arc<SyncState>,
    storage: Arc<MemoryStorage>,
}

async fn spawn_server() -> TestServer {
    let storage = Arc::new(MemoryStorage::new());
    let provider: Arc<dyn PersistenceProvider> = storage.clone();
    let state = Arc::new(SyncState::new(provider, Duration::from_millis(10)));
    let app = router(state.clone(), &[]);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        url: format!("ws://{}", addr),
        addr,
        state,
        storage,
    }
}

fn posts(document: &WorkspaceDocument) -> epicenter_core::crdt::TableHelper {
    document
        .tables()
        .define("posts", &TableDefinition::new("Posts").field("title", Field::text()))
        .unwrap()
}

/// Poll `check` every 20ms until it holds or the timeout passes.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

async fn raw_connect(server: &TestServer, doc: &str) -> RawSocket {
    let (socket, _) = connect_async(format!("{}/sync/{}", server.url, doc))
        .await
        .unwrap();
    socket
}

/// Next binary frame from the server, decoded.
async fn next_message(socket: &mut RawSocket) -> SyncMessage {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Binary(data) = msg {
            return SyncMessage::decode(&data).unwrap().0;
        }
    }
}

async fn send(socket: &mut RawSocket, frame: Vec<u8>) {
    socket.send(Message::Binary(frame.into())).await.unwrap();
}

fn presence(client_id: u64, state: serde_json::Value) -> Vec<u8> {
    let update = AwarenessUpdate {
        entries: vec![AwarenessEntry {
            client_id,
            clock: 1,
            state: Some(state),
        }],
    };
    SyncMessage::Awareness(update.encode()).encode()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn update_is_relayed_between_clients() {
    let server = spawn_server().await;
    let a = WorkspaceDocument::new("blog", 0);
    let b = WorkspaceDocument::new("blog", 0);

    let client_a = SyncClient::connect(&server.url, a.clone()).await.unwrap();
    let client_b = SyncClient::connect(&server.url, b.clone()).await.unwrap();
    client_a.wait_synced(TIMEOUT).await.unwrap();
    client_b.wait_synced(TIMEOUT).await.unwrap();

    posts(&a)
        .upsert(Row::with_id("p1", cells([("title", Value::text("From A"))])))
        .unwrap();

    assert!(
        eventually(|| b.tables().get("posts").is_ok_and(|t| t.has("p1"))).await,
        "update never reached B"
    );
    assert_eq!(a.encode_state_vector(), b.encode_state_vector());

    client_a.close().await;
    client_b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_receives_existing_state() {
    let server = spawn_server().await;
    let a = WorkspaceDocument::new("blog", 0);
    posts(&a)
        .upsert(Row::with_id("p1", cells([("title", Value::text("Before"))])))
        .unwrap();

    let client_a = SyncClient::connect(&server.url, a.clone()).await.unwrap();
    client_a.wait_synced(TIMEOUT).await.unwrap();
    let room = server.state.get_room("blog-0").await.unwrap();
    assert!(eventually(|| room.document().encode_state_vector() == a.encode_state_vector()).await);
    drop(room);

    let b = WorkspaceDocument::new("blog", 0);
    let client_b = SyncClient::connect(&server.url, b.clone()).await.unwrap();
    client_b.wait_synced(TIMEOUT).await.unwrap();
    let row = b.tables().get("posts").unwrap().get("p1").unwrap();
    assert_eq!(row.get("title"), Some(&Value::text("Before")));

    client_a.close().await;
    client_b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_opens_with_step1_and_answers_step1() {
    let server = spawn_server().await;
    let mut socket = raw_connect(&server, "blog-0").await;

    assert!(matches!(next_message(&mut socket).await, SyncMessage::SyncStep1(_)));

    let empty = WorkspaceDocument::new("blog", 0);
    send(&mut socket, SyncMessage::SyncStep1(empty.encode_state_vector()).encode()).await;
    assert!(matches!(next_message(&mut socket).await, SyncMessage::SyncStep2(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frame_keeps_connection_open() {
    let server = spawn_server().await;
    let mut socket = raw_connect(&server, "blog-0").await;
    next_message(&mut socket).await;

    // Unknown tag, then a length running past the end.
    send(&mut socket, vec![0x09, 0x01, 0x00]).await;
    send(&mut socket, vec![0x02, 0x7f, 0x01]).await;

    send(&mut socket, SyncMessage::QueryAwareness.encode()).await;
    assert!(matches!(next_message(&mut socket).await, SyncMessage::Awareness(_)));
    assert_eq!(server.state.stats().await.active_connections, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transport_close_withdraws_presence() {
    let server = spawn_server().await;
    let mut leaving = raw_connect(&server, "blog-0").await;
    next_message(&mut leaving).await;
    send(&mut leaving, presence(42, json!({"user": "ana"}))).await;
    // The reply proves the presence was processed.
    send(&mut leaving, SyncMessage::QueryAwareness.encode()).await;
    assert!(matches!(next_message(&mut leaving).await, SyncMessage::Awareness(_)));

    let mut staying = raw_connect(&server, "blog-0").await;
    assert!(matches!(next_message(&mut staying).await, SyncMessage::SyncStep1(_)));

    // Drop the socket without a close handshake.
    drop(leaving);

    loop {
        if let SyncMessage::Awareness(payload) = next_message(&mut staying).await {
            let update = AwarenessUpdate::decode(&payload).unwrap();
            if update
                .entries
                .iter()
                .any(|e| e.client_id == 42 && e.state.is_none())
            {
                break;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn presence_is_shared_and_withdrawn_on_close() {
    let server = spawn_server().await;
    let client_a = SyncClient::connect(&server.url, WorkspaceDocument::new("blog", 0))
        .await
        .unwrap();
    let client_b = SyncClient::connect(&server.url, WorkspaceDocument::new("blog", 0))
        .await
        .unwrap();
    client_a.wait_synced(TIMEOUT).await.unwrap();
    client_b.wait_synced(TIMEOUT).await.unwrap();

    let a_id = client_a.awareness_client_id();
    client_a.set_awareness(json!({"user": "ana", "cursor": 3}));
    assert!(eventually(|| client_b.awareness_states().contains_key(&a_id)).await);

    client_a.close().await;
    assert!(eventually(|| !client_b.awareness_states().contains_key(&a_id)).await);
    client_b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_room_is_persisted_and_released() {
    let server = spawn_server().await;
    let a = WorkspaceDocument::new("blog", 0);
    let client = SyncClient::connect(&server.url, a.clone()).await.unwrap();
    client.wait_synced(TIMEOUT).await.unwrap();
    posts(&a)
        .upsert(Row::with_id("p1", cells([("title", Value::text("Saved"))])))
        .unwrap();
    client.close().await;

    let mut released = false;
    for _ in 0..250 {
        if server.state.stats().await.active_rooms == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "room was never released");

    let saved = server.storage.load("blog-0").unwrap().unwrap();
    let replica = WorkspaceDocument::new("blog", 0);
    replica.apply_update(&saved).unwrap();
    assert!(replica.tables().get("posts").unwrap().has("p1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_document_name_is_rejected() {
    let server = spawn_server().await;
    let result = connect_async(format!("{}/sync/.hidden", server.url)).await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_endpoint_responds() {
    let server = spawn_server().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("OK"));
}

fn workspace_config(dir: &TempDir, server: &TestServer, peer: &str) -> WorkspaceConfig {
    let mut config = WorkspaceConfig::new(dir.path(), "blog");
    config.peer_id = Some(peer.into());
    config.persistence.debounce_ms = 10;
    config.sqlite.enabled = false;
    config.markdown.enabled = false;
    config.sync.server_url = Some(server.url.clone());
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn migration_moves_every_peer_to_the_new_epoch() {
    let server = spawn_server().await;
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let mut laptop = WorkspaceRegistry::new();
    let mut desktop = WorkspaceRegistry::new();

    let open = laptop
        .open(workspace_config(&dir_a, &server, "laptop"))
        .await
        .unwrap();
    open.head_sync().unwrap().wait_synced(TIMEOUT).await.unwrap();
    open.sync().unwrap().wait_synced(TIMEOUT).await.unwrap();
    posts(open.workspace().document())
        .upsert(Row::with_id("p1", cells([("title", Value::text("Hello"))])))
        .unwrap();

    let open = desktop
        .open(workspace_config(&dir_b, &server, "desktop"))
        .await
        .unwrap();
    open.head_sync().unwrap().wait_synced(TIMEOUT).await.unwrap();
    open.sync().unwrap().wait_synced(TIMEOUT).await.unwrap();
    assert!(
        eventually(|| open.workspace().tables().get("posts").is_ok_and(|t| t.has("p1"))).await,
        "epoch 0 never reached the desktop"
    );
    let mut epochs = open.epoch_changes().unwrap();

    let epoch = laptop
        .migrate("blog", |mut snapshot| {
            let posts = snapshot
                .tables
                .get_mut("posts")
                .ok_or_else(|| EpicenterError::TableNotFound("posts".into()))?;
            posts
                .definition
                .fields
                .insert("views".into(), Field::number().with_default(Value::Number(7.0)));
            Ok(snapshot)
        })
        .await
        .unwrap();
    assert_eq!(epoch, 1);

    tokio::time::timeout(TIMEOUT, epochs.wait_for(|epoch| *epoch == 1))
        .await
        .expect("the new epoch never reached the desktop")
        .unwrap();
    assert!(desktop.get("blog").unwrap().is_stale());
    assert_eq!(desktop.follow_epoch("blog").await.unwrap(), Some(1));

    let open = desktop.get("blog").unwrap();
    assert_eq!(open.workspace().epoch(), 1);
    assert_eq!(open.workspace().head().current(), 1);
    open.sync().unwrap().wait_synced(TIMEOUT).await.unwrap();
    assert!(
        eventually(|| {
            open.workspace()
                .tables()
                .get("posts")
                .and_then(|t| t.get("p1"))
                .is_ok_and(|row| row.get("views") == Some(&Value::Number(7.0)))
        })
        .await,
        "epoch 1 never reached the desktop"
    );

    laptop.close_all().await.unwrap();
    desktop.close_all().await.unwrap();
}
