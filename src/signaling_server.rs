//! WebSocket endpoint for browser clients.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::protocol::ServerEvent;
use crate::server::AppState;

/// GET /ws
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    debug!("websocket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let conn = Arc::new(ClientConnection::new(tx));
    let _ = state.open_sockets.fetch_add(1, Ordering::Relaxed);
    info!(conn_id = %conn.id, "client connected");

    let conn_id = conn.id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(conn_id = %conn_id, event = event.name(), error = %err, "could not encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                debug!(conn_id = %conn_id, "socket write failed");
                break;
            }
        }
        let _ = sender.close().await;
    });

    let _ = conn.send(ServerEvent::Connected {
        connection_id: conn.id.clone(),
    });

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => state.relay.handle_frame(&conn, &text).await,
                Some(Ok(Message::Binary(_))) => {
                    warn!(conn_id = %conn.id, "binary frame ignored");
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong are answered by the protocol layer.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(conn_id = %conn.id, error = %err, "socket read failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    state.relay.disconnect(&conn).await;
    writer.abort();
    let _ = state.open_sockets.fetch_sub(1, Ordering::Relaxed);
}
