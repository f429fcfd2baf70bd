use crate::extract::UserId;
use crate::{error::AppError, AppState};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
};
use engine::Credentials;
use events::{Channel, ChannelSubscription, FanoutEvent};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// Browsers cannot set headers on a WebSocket handshake, so agents pass their
/// credentials as query parameters instead.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsAgentAuth {
    api_key: Option<String>,
    api_secret: Option<String>,
}

/// # GET /ws/user
pub async fn user_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> impl IntoResponse {
    let subscription = state.publisher.subscribe(Channel::User(user_id));
    ws.on_upgrade(move |socket| forward(socket, subscription))
}

/// # GET /ws/executor/:id?apiKey=&apiSecret=
pub async fn executor_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(executor_id): Path<Uuid>,
    Query(auth): Query<WsAgentAuth>,
) -> Result<impl IntoResponse, AppError> {
    let credentials = match (auth.api_key, auth.api_secret) {
        (Some(api_key), Some(api_secret)) => Credentials { api_key, api_secret },
        _ => {
            tracing::warn!(%executor_id, "WebSocket connection rejected: missing credentials");
            return Err(AppError::Engine(engine::EngineError::AuthenticationFailed));
        }
    };
    state.control.agents.authorize(executor_id, &credentials).await?;

    let subscription = state.publisher.subscribe(Channel::Executor(executor_id));
    Ok(ws.on_upgrade(move |socket| forward(socket, subscription)))
}

/// Forwards every event on one channel to the socket until either side goes away.
async fn forward(socket: WebSocket, mut subscription: ChannelSubscription) {
    let channel = subscription.channel();
    tracing::info!(%channel, "[WS] Subscriber connected.");
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        let mut next = Ok(FanoutEvent::Connected);
        loop {
            let event = match next {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(%channel, skipped = n, "[WS] Subscriber lagged.");
                    next = subscription.recv().await;
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize WebSocket message.");
                    next = subscription.recv().await;
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
            next = subscription.recv().await;
        }
        // Dropping the subscription here marks the channel as unwatched.
    });

    // Inbound traffic is only pings and the close frame.
    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    send_task.abort();
    tracing::info!(%channel, "[WS] Connection closed.");
}
