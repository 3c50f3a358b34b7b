//! WebSocket handler for signaling

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use coachcall_core::signaling::{ClientEvent, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::AppState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending frames to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let connection_id = state.relay.connect(tx.clone());

    // Task to forward frames from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    tracing::debug!("{} from {}", event.name(), connection_id);
                    state.relay.handle(connection_id, event);
                }
                Err(e) => {
                    tracing::warn!("Unparseable frame from {}: {}", connection_id, e);
                    let _ = tx.send(ServerEvent::Error {
                        code: "INVALID_MESSAGE".to_string(),
                        message: format!("Failed to parse message: {}", e),
                    });
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    state.relay.disconnect(connection_id);
    send_task.abort();
}
