//! Live stream WebSocket endpoint
//!
//! Pushes `StatusUpdate` JSON to connected clients. Inbound messages
//! are ignored; the read pump exists only to detect the close. There is
//! no authentication on this endpoint in the current design — a known
//! hazard, kept to match the deployed surface.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use super::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let client = state.hub.register();
    let client_id = client.id();

    info!(client = client_id, "live stream connected");

    loop {
        tokio::select! {
            // Push queued updates
            update = client.recv() => {
                let payload = match serde_json::to_string(&update) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(client = client_id, "failed to encode update: {}", e);
                        continue;
                    }
                };

                if sender.send(Message::Text(payload)).await.is_err() {
                    // Write error means the peer is gone
                    break;
                }
            }

            // Read pump: close detection only, inbound data is ignored
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {
                        debug!(client = client_id, "ignoring inbound message");
                    }
                    Some(Err(e)) => {
                        debug!(client = client_id, "socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    client.disconnect();
    info!(client = client_id, "live stream disconnected");
}
