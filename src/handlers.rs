//! WebSocket connection handlers and related traits.
//!
//! This module contains the `Sender` trait every transport implements, the
//! axum WebSocket front-end, and the open/close steps shared by all front-ends.

use crate::error::ChatError;
use crate::listener::LineSender;
use crate::models::Notice;
use crate::receive::TransportMode;
use crate::router::route_message;
use crate::state::{AppState, ConnectionId};
use async_trait::async_trait;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::routing::get;
use axum::{extract::State, response::IntoResponse, Router};
use axum_extra::TypedHeader;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

/// Trait for writing text payloads to a connection.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Sends one complete text payload.
    ///
    /// # Errors
    ///
    /// Returns a `ChatError` if the transport rejects the write.
    async fn send(&mut self, payload: String) -> Result<(), ChatError>;
}

/// Trait for receiving WebSocket messages.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Receives the next WebSocket message.
    ///
    /// # Returns
    ///
    /// Returns `Some(Result<AxumMessage, axum::Error>)` if a message is received,
    /// or `None` if the connection is closed.
    async fn next(&mut self) -> Option<Result<AxumMessage, axum::Error>>;
}

/// Implements the `Sender` trait for the WebSocket sink.
pub struct WebSocketSender(futures::stream::SplitSink<WebSocket, AxumMessage>);

/// Implements the `Receiver` trait for the WebSocket stream.
pub struct WebSocketReceiver(futures::stream::SplitStream<WebSocket>);

#[async_trait]
impl Sender for WebSocketSender {
    async fn send(&mut self, payload: String) -> Result<(), ChatError> {
        debug!("Sending message: {}", payload);
        Ok(self.0.send(AxumMessage::Text(payload)).await?)
    }
}

#[async_trait]
impl Receiver for WebSocketReceiver {
    async fn next(&mut self) -> Option<Result<AxumMessage, axum::Error>> {
        let result = self.0.next().await;
        debug!("Received message: {:?}", result);
        result
    }
}

/// Sender used by the server: either front-end can land in the same registry.
pub enum ClientSender {
    WebSocket(WebSocketSender),
    Line(LineSender),
}

#[async_trait]
impl Sender for ClientSender {
    async fn send(&mut self, payload: String) -> Result<(), ChatError> {
        match self {
            ClientSender::WebSocket(sender) => sender.send(payload).await,
            ClientSender::Line(sender) => sender.send(payload).await,
        }
    }
}

/// Builds the axum router serving the chat WebSocket at `/ws`.
pub fn chat_routes(state: AppState<ClientSender>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Handles incoming WebSocket connection requests.
///
/// # Arguments
///
/// * `ws` - WebSocket upgrade.
/// * `user_agent` - Optional user agent header.
/// * `addr` - Client's socket address.
/// * `state` - Application state.
///
/// # Returns
///
/// Returns an `impl IntoResponse` which upgrades the connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState<ClientSender>>,
) -> impl IntoResponse {
    let user_agent = if let Some(TypedHeader(user_agent)) = user_agent {
        user_agent.to_string()
    } else {
        String::from("Unknown browser")
    };
    info!("New WebSocket connection: `{user_agent}` at {addr}");
    ws.on_upgrade(move |socket| handle_websocket_socket(socket, state))
}

async fn handle_websocket_socket(socket: WebSocket, state: AppState<ClientSender>) {
    let id = state.registry.next_id();
    let (sender, receiver) = socket.split();

    let sender = ClientSender::WebSocket(WebSocketSender(sender));
    if let Err(e) = open_connection(&state, id, TransportMode::Plaintext, sender).await {
        error!("Failed to open connection {}: {}", id, e);
        return;
    }
    handle_socket(id, WebSocketReceiver(receiver), state).await;
}

/// Registers a connection and greets it. Must run before any of its messages are routed.
pub async fn open_connection<S: Sender>(
    state: &AppState<S>,
    id: ConnectionId,
    mode: TransportMode,
    sender: S,
) -> Result<(), ChatError> {
    let connection = state.registry.register(id, mode, sender).await?;
    info!("Client connected (id={})", id);
    if let Err(e) = connection.send(Notice::welcome().to_text()).await {
        warn!("Failed to send welcome to {}: {}", id, e);
    }
    Ok(())
}

/// Stops selecting the connection for broadcasts and releases its state.
pub async fn close_connection<S: Sender>(state: &AppState<S>, id: &ConnectionId) {
    state.registry.begin_close(id).await;
    if state.registry.unregister(id).await {
        info!("Client disconnected (id={})", id);
    }
}

/// Message loop of one WebSocket connection, from registration to unregistration.
pub async fn handle_socket<S: Sender + 'static, R: Receiver>(
    id: ConnectionId,
    mut receiver: R,
    state: AppState<S>,
) {
    debug!("Entering main message loop for {}", id);
    let shutdown = state.shutdown_token();
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Closing {} for shutdown", id);
                break;
            }
            msg = receiver.next() => msg,
        };
        match msg {
            Some(Ok(AxumMessage::Text(text))) => {
                debug!("Received text message from {}: {}", id, text);
                route_message(&state, &id, &text).await;
            }
            Some(Ok(AxumMessage::Close(frame))) => {
                info!("Received close frame from {}: {:?}", id, frame);
                break;
            }
            Some(Ok(other)) => {
                debug!("Ignoring non-text message from {}: {:?}", id, other);
            }
            Some(Err(e)) => {
                error!("Error receiving message from {}: {:?}", id, e);
                break;
            }
            None => {
                info!("Connection closed by peer ({})", id);
                break;
            }
        }
    }

    debug!("Exited main message loop for {}", id);
    close_connection(&state, &id).await;
}
