//! Shared test doubles.

use crate::error::ChatError;
use crate::receive::TransportMode;
use crate::state::{AppState, ConnectionId};
use crate::Sender;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Sender that forwards every payload into an unbounded channel.
#[derive(Clone)]
pub(crate) enum ChannelSender {
    Forward(mpsc::UnboundedSender<String>),
    Broken,
    Stalled,
}

impl ChannelSender {
    pub(crate) fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSender::Forward(tx), rx)
    }

    /// A sender whose every write fails.
    pub(crate) fn broken() -> Self {
        ChannelSender::Broken
    }

    /// A sender whose writes never complete, like a peer that stopped reading.
    pub(crate) fn stalled() -> Self {
        ChannelSender::Stalled
    }
}

#[async_trait]
impl Sender for ChannelSender {
    async fn send(&mut self, payload: String) -> Result<(), ChatError> {
        match self {
            ChannelSender::Forward(tx) => tx.send(payload).map_err(|_| broken_pipe()),
            ChannelSender::Broken => Err(broken_pipe()),
            ChannelSender::Stalled => std::future::pending().await,
        }
    }
}

fn broken_pipe() -> ChatError {
    ChatError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
}

/// Registers a connection in `channel` and returns its id and outbox.
pub(crate) async fn open(
    state: &AppState<ChannelSender>,
    channel: &str,
) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
    let (sender, rx) = ChannelSender::pair();
    let id = open_with(state, channel, sender).await;
    (id, rx)
}

pub(crate) async fn open_with(
    state: &AppState<ChannelSender>,
    channel: &str,
    sender: ChannelSender,
) -> ConnectionId {
    let id = state.registry.next_id();
    let connection = state
        .registry
        .register(id, TransportMode::Plaintext, sender)
        .await
        .unwrap();
    connection.update_profile(|p| p.channel = channel.to_string());
    id
}
