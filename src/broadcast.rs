//! Selective broadcast over the connection registry.

use crate::state::{AppState, ConnectionId, UserProfile};
use crate::Sender;
use futures::future::join_all;
use tracing::{debug, warn};

/// Delivery counts for one broadcast. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

impl<S: Sender> AppState<S> {
    /// Sends `payload` to every open connection whose profile satisfies `predicate`.
    ///
    /// Recipients are captured under the registry lock; the writes happen after
    /// it is released, concurrently. A failed or timed-out write is logged and
    /// counted, and never aborts delivery to the other recipients.
    pub async fn broadcast<F>(
        &self,
        payload: &str,
        predicate: F,
        sender: &ConnectionId,
        exclude_sender: bool,
    ) -> BroadcastReport
    where
        F: Fn(&ConnectionId, &UserProfile) -> bool,
    {
        let recipients = self
            .registry
            .select(|id, profile| !(exclude_sender && id == sender) && predicate(id, profile))
            .await;
        debug!(
            "Broadcasting from {} to {} recipient(s)",
            sender,
            recipients.len()
        );

        let results = join_all(recipients.iter().map(|connection| async move {
            match connection.send(payload.to_string()).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to deliver broadcast to {}: {}", connection.id, e);
                    false
                }
            }
        }))
        .await;

        let delivered = results.iter().filter(|ok| **ok).count();
        BroadcastReport {
            delivered,
            failed: results.len() - delivered,
        }
    }

    /// Writes `payload` to a single connection. Returns `false` if it is gone or the write failed.
    pub async fn send_to(&self, id: &ConnectionId, payload: String) -> bool {
        let Some(connection) = self.registry.get(id).await else {
            warn!("Connection {} not found for direct send", id);
            return false;
        };
        match connection.send(payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send to {}: {}", id, e);
                false
            }
        }
    }
}
