//! WebSocket handler for live task updates.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::events::{DomainEvent, OwnerId, TaskEvent};
use crate::live_sync::ViewerStream;

/// Client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}

/// Server messages. Task events are sent as their bus envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { owner_id: String },
    Pong,
    Error { message: String },
}

/// Handle WebSocket upgrade.
pub async fn live_handler(
    ws: WebSocketUpgrade,
    Path(owner_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // Subscribe before the upgrade so nothing published during the handshake is missed.
    let viewer = state.live_sync.subscribe(OwnerId::new(owner_id));
    ws.on_upgrade(move |socket| handle_socket(socket, viewer))
}

fn to_text<T: Serialize>(message: &T) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize WebSocket message");
            None
        }
    }
}

fn event_message(event: &TaskEvent) -> Option<Message> {
    match event.to_envelope() {
        Ok(envelope) => to_text(&envelope),
        Err(e) => {
            tracing::error!(event_id = %event.event_id, error = %e, "Failed to encode live update");
            None
        }
    }
}

/// Handle individual WebSocket connection.
async fn handle_socket(socket: WebSocket, mut viewer: ViewerStream) {
    let owner_id = viewer.owner_id().to_string();
    let (mut sender, mut receiver) = socket.split();

    let Some(ack) = to_text(&ServerMessage::Connected { owner_id: owner_id.clone() }) else {
        return;
    };
    if sender.send(ack).await.is_err() {
        return;
    }
    tracing::debug!(owner = %owner_id, "Live viewer connected");

    loop {
        tokio::select! {
            update = viewer.next() => {
                let Some(event) = update else { break };
                let Some(message) = event_message(&event) else { continue };
                if sender.send(message).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                let reply = match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Ping) => to_text(&ServerMessage::Pong),
                        Err(e) => to_text(&ServerMessage::Error {
                            message: format!("Invalid message format: {}", e),
                        }),
                    },
                    Some(Ok(Message::Ping(data))) => Some(Message::Pong(data)),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        tracing::debug!(owner = %owner_id, error = %e, "WebSocket error");
                        break;
                    }
                };
                if let Some(reply) = reply {
                    if sender.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(owner = %owner_id, "Live viewer disconnected");
}
