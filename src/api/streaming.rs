use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};

use crate::api::handler::AppState;
use crate::notifications::{Notification, NotificationHub};

/// GET /ws/:topic
///
/// Topics: `task-pool`, `intent:<id>`, `wallet:<address>`.
pub async fn stream_notifications(
    ws: WebSocketUpgrade,
    Path(topic): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, state.hub.clone(), topic))
}

async fn handle_stream(socket: WebSocket, hub: Arc<NotificationHub>, topic: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates = BroadcastStream::new(hub.subscribe());
    info!("🔌 Websocket subscribed to {}", topic);

    // Drain the client side so close frames are seen
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    let send_topic = topic.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(update) = updates.next().await {
            let notification: Notification = match update {
                Ok(notification) => notification,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("⚠️ Subscriber to {} lagged, {} events dropped", send_topic, skipped);
                    continue;
                }
            };
            if notification.topic != send_topic {
                continue;
            }

            let json = match serde_json::to_string(&notification.event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode notification: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    }
    debug!("Websocket on {} closed", topic);
}
