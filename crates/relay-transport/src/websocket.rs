//! WebSocket transport for browser clients.

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use relay_core::Outbound;
use relay_session::{ClientConnection, RelayHandle, RelayStatus};

/// Handler state.
#[derive(Clone)]
pub struct WsState {
    /// The relay every socket attaches to.
    pub relay: RelayHandle,
}

impl WsState {
    /// Create new handler state.
    #[must_use]
    pub const fn new(relay: RelayHandle) -> Self {
        Self { relay }
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state.relay))
}

/// Relay status snapshot.
pub async fn health_handler(State(state): State<WsState>) -> Json<RelayStatus> {
    Json(state.relay.status())
}

async fn handle_socket(socket: WebSocket, relay: RelayHandle) {
    let ClientConnection { id, mut outbound } = match relay.connect() {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!("Rejecting WebSocket: {e}");
            return;
        }
    };
    let (mut sender, mut receiver) = socket.split();

    // Forward relay output to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message {
                Outbound::Text(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        let msg = tokio::select! {
            _ = &mut send_task => break,
            msg = receiver.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(client = %id, "WebSocket error: {e}");
                break;
            }
        };

        if relay.message(id, text).is_err() {
            break;
        }
    }

    send_task.abort();
    if let Err(e) = relay.disconnect(id) {
        tracing::debug!(client = %id, "Relay gone before disconnect: {e}");
    }
}

/// Create the relay router: `/ws` for clients, `/health` for probes.
#[must_use]
pub fn create_router(relay: RelayHandle) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(WsState::new(relay))
}
