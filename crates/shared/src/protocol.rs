use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{ChatId, MessageId, MessageStatus, UserId, UserSummary};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSender {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat: ChatId,
    pub content: String,
    #[serde(alias = "sentAt")]
    pub sent_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub sender: MessageSender,
    #[serde(skip)]
    pub is_from_current_user: bool,
}

impl Message {
    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Vec<UserSummary>,
    #[serde(default, alias = "is_group")]
    pub is_group: bool,
    #[serde(default, alias = "last_message", skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    #[serde(default, alias = "unread_count", skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    #[serde(default, alias = "created_at", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Kinds of frames the client sends.
pub mod outbound_kind {
    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const TYPING: &str = "typing";
    pub const READ_MESSAGES: &str = "read_messages";
    pub const DELIVERED_MESSAGES: &str = "delivered_messages";
}

/// Payload fields are written next to `type`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub kind: String,
    pub payload: Option<Map<String, Value>>,
}

#[derive(Serialize)]
struct OutboundWire<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(flatten)]
    payload: Option<&'a Map<String, Value>>,
}

impl OutboundFrame {
    pub fn new(kind: impl Into<String>, payload: Option<Map<String, Value>>) -> Self {
        let payload = payload.map(|mut fields| {
            fields.remove("type");
            fields
        });
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn chat_message(content: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("message".to_string(), Value::String(content.into()));
        Self::new(outbound_kind::CHAT_MESSAGE, Some(payload))
    }

    pub fn typing() -> Self {
        Self::new(outbound_kind::TYPING, None)
    }

    pub fn read_messages() -> Self {
        Self::new(outbound_kind::READ_MESSAGES, None)
    }

    pub fn delivered_messages() -> Self {
        Self::new(outbound_kind::DELIVERED_MESSAGES, None)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&OutboundWire {
            kind: &self.kind,
            payload: self.payload.as_ref(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    MessageStatus,
    NewChat,
    ParticipantsUpdated,
    Typing,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Message,
        EventKind::MessageStatus,
        EventKind::NewChat,
        EventKind::ParticipantsUpdated,
        EventKind::Typing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::MessageStatus => "message_status",
            Self::NewChat => "new_chat",
            Self::ParticipantsUpdated => "participants_updated",
            Self::Typing => "typing",
        }
    }

    pub fn from_wire(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(Message),
    MessageStatus {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        status: MessageStatus,
    },
    NewChat {
        chat: Chat,
    },
    ParticipantsUpdated {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        participants: Vec<UserSummary>,
    },
    Typing {
        #[serde(rename = "chatId")]
        chat_id: ChatId,
        #[serde(rename = "userId")]
        user_id: UserId,
    },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown frame type `{0}`")]
    UnknownKind(String),
    #[error("invalid `{kind}` frame: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message(_) => EventKind::Message,
            Self::MessageStatus { .. } => EventKind::MessageStatus,
            Self::NewChat { .. } => EventKind::NewChat,
            Self::ParticipantsUpdated { .. } => EventKind::ParticipantsUpdated,
            Self::Typing { .. } => EventKind::Typing,
        }
    }

    /// Decodes one text frame, classifying why a frame is rejected.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        let kind = EventKind::from_wire(kind)
            .ok_or_else(|| DecodeError::UnknownKind(kind.to_string()))?;
        serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload {
            kind: kind.as_str(),
            source,
        })
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
