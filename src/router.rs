//! Chat command protocol.
//!
//! A decoded text message is either a command (`/nick <name>`, `/join <channel>`)
//! that changes the sender's own profile, or chat content relayed to the
//! sender's current channel.

use crate::models::{ChatEvent, Notice, JOINED_TEXT, NICK_CHANGED_TEXT, UNKNOWN_COMMAND_TEXT};
use crate::state::{AppState, Connection, ConnectionId, UserProfile};
use crate::utils::{strip_line_terminator, truncate_chars};
use crate::Sender;
use tracing::{debug, warn};

/// One parsed inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound<'a> {
    Nick(&'a str),
    Join(&'a str),
    /// Unknown command, or a known one missing its argument.
    Invalid(&'a str),
    Chat(&'a str),
}

/// Splits a message into command name and argument after stripping one line terminator.
pub fn parse_message(text: &str) -> Inbound<'_> {
    let text = strip_line_terminator(text);
    if !text.starts_with('/') {
        return Inbound::Chat(text);
    }

    let (name, argument) = match text.split_once(' ') {
        Some((name, argument)) => (name, argument),
        None => (text, ""),
    };
    match name {
        "/nick" if !argument.is_empty() => Inbound::Nick(argument),
        "/join" if !argument.is_empty() => Inbound::Join(argument),
        _ => Inbound::Invalid(name),
    }
}

/// Routes one decoded text message from connection `id`.
///
/// A connection that is not registered (or already released) is skipped.
pub async fn route_message<S: Sender>(state: &AppState<S>, id: &ConnectionId, text: &str) {
    let Some(connection) = state.registry.get(id).await else {
        warn!("Dropping message from unregistered connection {}", id);
        return;
    };
    let limit = state.registry.name_limit();

    match parse_message(text) {
        Inbound::Nick(name) => {
            let name = truncate_chars(name, limit);
            if !connection.update_profile(|profile| profile.name = name.clone()) {
                warn!("Connection {} has no profile, ignoring /nick", id);
                return;
            }
            debug!("Connection {} is now known as {}", id, name);
            reply(&connection, Notice::system(NICK_CHANGED_TEXT)).await;
        }
        Inbound::Join(channel) => {
            let channel = truncate_chars(channel, limit);
            if !connection.update_profile(|profile| profile.channel = channel.clone()) {
                warn!("Connection {} has no profile, ignoring /join", id);
                return;
            }
            debug!("Connection {} joined {}", id, channel);
            reply(&connection, Notice::system(JOINED_TEXT)).await;
        }
        Inbound::Invalid(name) => {
            debug!("Connection {} sent invalid command {}", id, name);
            reply(&connection, Notice::error(UNKNOWN_COMMAND_TEXT)).await;
        }
        Inbound::Chat(message) => {
            // Channel is read now, not when the message arrived.
            let Some(profile) = connection.profile() else {
                warn!("Connection {} has no profile, dropping chat message", id);
                return;
            };
            let payload = ChatEvent {
                user: profile.name,
                channel: profile.channel.clone(),
                message: message.to_string(),
            }
            .to_text();
            let report = state
                .broadcast(
                    &payload,
                    |_: &ConnectionId, member: &UserProfile| member.channel == profile.channel,
                    id,
                    true,
                )
                .await;
            debug!(
                "Chat from {} in {}: delivered {}, failed {}",
                id, profile.channel, report.delivered, report.failed
            );
        }
    }
}

async fn reply<S: Sender>(connection: &Connection<S>, notice: Notice) {
    if let Err(e) = connection.send(notice.to_text()).await {
        warn!("Failed to acknowledge {}: {}", connection.id, e);
    }
}
