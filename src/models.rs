//! Data models for the chat wire format.
//!
//! Chat content travels as `{"user", "channel", "message"}`; protocol
//! acknowledgments travel as `{"type", "message"}`.

use serde::{Deserialize, Serialize};
use tracing::error;

pub const WELCOME_TEXT: &str = "Welcome! Commands: /nick <name>, /join <channel>";
pub const NICK_CHANGED_TEXT: &str = "Nickname changed";
pub const JOINED_TEXT: &str = "Joined channel";
pub const UNKNOWN_COMMAND_TEXT: &str = "Unknown command";

/// A chat line relayed to the members of a channel.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatEvent {
    pub user: String,
    pub channel: String,
    pub message: String,
}

/// Kind of a protocol acknowledgment.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    /// Greeting sent once when a connection opens.
    Welcome,
    /// A command succeeded.
    System,
    /// A command was malformed or unknown.
    Error,
}

/// A protocol acknowledgment addressed to a single connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notice {
    #[serde(rename = "type")]
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn welcome() -> Self {
        Self::new(NoticeKind::Welcome, WELCOME_TEXT)
    }

    pub fn system(message: &str) -> Self {
        Self::new(NoticeKind::System, message)
    }

    pub fn error(message: &str) -> Self {
        Self::new(NoticeKind::Error, message)
    }

    fn new(kind: NoticeKind, message: &str) -> Self {
        Notice {
            kind,
            message: message.to_string(),
        }
    }

    pub fn to_text(&self) -> String {
        encode(self)
    }
}

impl ChatEvent {
    pub fn to_text(&self) -> String {
        encode(self)
    }
}

fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        error!("Failed to encode outgoing payload: {:?}", e);
        String::from("{}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_event_has_exact_field_set() {
        let event = ChatEvent {
            user: "Alice".into(),
            channel: "general".into(),
            message: "say \"hi\"".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_text()).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 3);
        assert_eq!(object["message"], "say \"hi\"");
    }

    #[test]
    fn notices_use_lowercase_type() {
        assert_eq!(
            Notice::system(NICK_CHANGED_TEXT).to_text(),
            r#"{"type":"system","message":"Nickname changed"}"#
        );
        assert_eq!(
            Notice::error(UNKNOWN_COMMAND_TEXT).to_text(),
            r#"{"type":"error","message":"Unknown command"}"#
        );
        let welcome: Notice = serde_json::from_str(&Notice::welcome().to_text()).unwrap();
        assert_eq!(welcome.kind, NoticeKind::Welcome);
    }
}
