use crate::sync::SyncState;
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Document names are storage keys: `{workspaceId}-{epoch}` or a bare
/// workspace id for epoch heads.
pub fn is_valid_document_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// WebSocket upgrade handler for `/sync/{doc}`
pub async fn ws_handler(
    State(state): State<Arc<SyncState>>,
    Path(doc): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !is_valid_document_name(&doc) {
        warn!("WebSocket connection rejected: invalid document name {:?}", doc);
        return StatusCode::BAD_REQUEST.into_response();
    }

    debug!("WebSocket upgrade: doc={}", doc);
    ws.on_upgrade(move |socket| handle_socket(socket, state, doc))
        .into_response()
}

/// Handle an established WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<SyncState>, doc: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut connection = match state.connect(&doc).await {
        Ok(connection) => connection,
        Err(e) => {
            error!("Failed to open room '{}': {}", doc, e);
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    for frame in connection.opening_frames() {
        if let Err(e) = ws_tx.send(Message::Binary(frame.into())).await {
            error!("Failed to send opening frames: {}", e);
            state.disconnect(connection).await;
            return;
        }
    }

    // Handle bidirectional communication
    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let event = connection.inbound(data.to_vec());
                        let mut failed = false;
                        for reply in state.handle_inbound(&event).await {
                            if let Err(e) = ws_tx.send(Message::Binary(reply.into())).await {
                                error!("Failed to send response: {}", e);
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            // Handle broadcast messages from other clients
            Some(broadcast_msg) = connection.recv_broadcast() => {
                if let Err(e) = ws_tx.send(Message::Binary(broadcast_msg.into())).await {
                    error!("Failed to send broadcast: {}", e);
                    break;
                }
            }

            else => break,
        }
    }

    info!("WebSocket disconnected: connection={}, doc={}", connection.id, doc);
    state.disconnect(connection).await;
}
