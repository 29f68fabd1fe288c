use serde::{Deserialize, Serialize};

use crate::room::{self, PUBLIC};

/// A chat line as stored in history and carried over the fan-out bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub author: String,
    /// Empty for the public room.
    #[serde(default)]
    pub recipient: String,
    pub body: String,
    /// Unix seconds, stamped by the server that accepted the message.
    pub sent_at: i64,
}

impl ChatMessage {
    pub fn is_public(&self) -> bool {
        self.recipient.is_empty()
    }

    /// History key this message is filed under.
    pub fn room(&self) -> String {
        if self.is_public() {
            PUBLIC.to_string()
        } else {
            room::room(&self.author, &self.recipient)
        }
    }

    /// Whether a session bound to `user` should see this message.
    pub fn is_visible_to(&self, user: &str) -> bool {
        self.is_public() || self.author == user || self.recipient == user
    }
}

/// Fields a client supplies when sending a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageDraft {
    #[serde(default)]
    pub recipient: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ClientRequest {
    Login(String),
    /// Peer username, or `None` for the public room.
    History(Option<String>),
    Message(MessageDraft),
    Logout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginResponse {
    pub username: String,
    pub users: Vec<String>,
    pub rooms: Vec<String>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryResponse {
    pub peer: Option<String>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presence {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ServerEvent {
    Login(LoginResponse),
    History(HistoryResponse),
    Message(ChatMessage),
    Join(Presence),
    Leave(Presence),
    Error(ErrorResponse),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorResponse {
            message: message.into(),
        })
    }
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> serde_json::Result<T> {
    serde_json::from_slice(bytes)
}

pub fn encode<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_requests_use_kind_and_body() {
        let login: ClientRequest = decode(br#"{"kind":"login","body":"alice"}"#).unwrap();
        assert_eq!(login, ClientRequest::Login("alice".into()));

        let public: ClientRequest = decode(br#"{"kind":"history","body":null}"#).unwrap();
        assert_eq!(public, ClientRequest::History(None));

        let direct: ClientRequest =
            decode(br#"{"kind":"message","body":{"recipient":"bob","body":"hi"}}"#).unwrap();
        assert_eq!(
            direct,
            ClientRequest::Message(MessageDraft {
                recipient: "bob".into(),
                body: "hi".into(),
            })
        );

        let logout: ClientRequest = decode(br#"{"kind":"logout"}"#).unwrap();
        assert_eq!(logout, ClientRequest::Logout);
    }

    #[test]
    fn missing_recipient_means_public() {
        let request: ClientRequest =
            decode(br#"{"kind":"message","body":{"body":"hello all"}}"#).unwrap();
        let ClientRequest::Message(draft) = request else {
            panic!("expected message request");
        };
        assert!(draft.recipient.is_empty());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(decode::<ClientRequest>(br#"{"kind":"shout","body":"x"}"#).is_err());
        assert!(decode::<ClientRequest>(b"not json").is_err());
    }

    #[test]
    fn server_events_serialize_with_kind_tag() {
        let event = ServerEvent::Join(Presence {
            name: "bob".into(),
        });
        assert_eq!(
            encode(&event).unwrap(),
            r#"{"kind":"join","body":{"name":"bob"}}"#
        );
    }

    #[test]
    fn message_room_and_visibility() {
        let direct = ChatMessage {
            author: "bob".into(),
            recipient: "alice".into(),
            body: "hey".into(),
            sent_at: 0,
        };
        assert_eq!(direct.room(), "alice:bob");
        assert!(direct.is_visible_to("alice"));
        assert!(direct.is_visible_to("bob"));
        assert!(!direct.is_visible_to("carol"));

        let public = ChatMessage {
            recipient: String::new(),
            ..direct
        };
        assert_eq!(public.room(), "");
        assert!(public.is_visible_to("carol"));
    }
}
