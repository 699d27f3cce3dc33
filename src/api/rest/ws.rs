use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::notification::{acknowledge, spawn_notification_task};
use crate::models::principal::ChairPrincipal;
use crate::state::AppState;

pub async fn notification_handler(
    ws: WebSocketUpgrade,
    chair: ChairPrincipal,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, chair))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, chair: ChairPrincipal) {
    let (mut sender, mut receiver) = socket.split();
    let cancel = CancellationToken::new();
    let (poller, mut rx) = spawn_notification_task(
        state.store.clone(),
        chair.chair_id,
        state.notification_interval,
        cancel.clone(),
    );

    info!(chair_id = %chair.chair_id, "chair notification stream opened");

    let store = state.store.clone();
    let send_task = tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            let json = match serde_json::to_string(&notification) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize chair notification");
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
            acknowledge(&store, &notification);
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    cancel.cancel();
    if let Err(err) = poller.await {
        warn!(error = %err, "notification task ended abnormally");
    }

    info!(chair_id = %chair.chair_id, "chair notification stream closed");
}
