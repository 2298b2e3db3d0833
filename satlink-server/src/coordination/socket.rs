use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};

use super::CoordinationHub;
use crate::http::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, peer, hub))
}

/// One task writes queued events out, the other reads frames in arrival
/// order. Whichever finishes first takes the other down.
async fn handle_socket(socket: WebSocket, peer: SocketAddr, hub: Arc<CoordinationHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut outbound) = hub.connect().await;
    tracing::info!("WebSocket {} from {}", conn_id, peer);

    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode {}: {}", event.wire_name(), e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(text.into())).await {
                tracing::warn!("Error sending to {}: {}", peer, e);
                break;
            }
        }
    });

    let reader_hub = hub.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => reader_hub.handle_text(conn_id, peer.ip(), text.as_str()).await,
                Ok(Message::Close(_)) => {
                    tracing::debug!("{} closed the socket", peer);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Error receiving from {}: {}", peer, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    hub.disconnect(conn_id).await;
}
