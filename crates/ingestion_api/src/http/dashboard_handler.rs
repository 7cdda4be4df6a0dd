use crate::http::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use common::domain::BroadcastMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::{debug, warn};

/// `GET /ws/telemetry`: live feed of telemetry and status updates
pub async fn dashboard_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let updates = state.broadcaster.subscribe();
    ws.on_upgrade(move |socket| forward_updates(socket, updates))
}

/// Push every broadcast to one observer until either side goes away
async fn forward_updates(socket: WebSocket, mut updates: Receiver<BroadcastMessage>) {
    let (mut sender, mut receiver) = socket.split();
    debug!("dashboard observer connected");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(message) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "failed to encode dashboard update");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "dashboard observer lagging; dropped updates");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("dashboard observer disconnected");
}
