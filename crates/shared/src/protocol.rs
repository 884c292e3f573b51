use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Message, MessageExtras, MessageId, MessageStatus, ThreadId, ThreadKind, UserId},
    error::ProtocolError,
};

/// Body of `GET /messages/{id}/{kind}?limit=&skip=`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Explicit end-of-history signal; absent means "infer from page size".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Realtime message/read-receipt payload pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: MessageId,
    pub message: String,
    pub sender: UserId,
    pub sender_meta: SenderMeta,
    pub thread_or_channel_id: ThreadId,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn into_message(self) -> Message {
        let status = if self.read {
            MessageStatus::Seen
        } else {
            MessageStatus::Delivered
        };
        Message {
            id: self.id,
            text: self.message,
            created_at: self.created_at,
            sender_id: self.sender,
            sender_name: self.sender_meta.name,
            avatar: self.sender_meta.avatar,
            status,
            seen_by: None,
            reply_to: None,
            media_uri: None,
            mime_type: None,
            duration_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    SendMessage {
        client_id: MessageId,
        thread_id: ThreadId,
        kind: ThreadKind,
        text: String,
        #[serde(flatten)]
        extras: MessageExtras,
    },
    MarkSeen {
        thread_id: ThreadId,
        message_ids: Vec<MessageId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerFrame {
    Message(InboundMessage),
    MessageAck {
        client_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
    },
    MessageFailed {
        client_id: MessageId,
        #[serde(default)]
        reason: Option<String>,
    },
    Delivered {
        message_id: MessageId,
    },
    Seen {
        message_id: MessageId,
        #[serde(default)]
        seen_by: Vec<UserId>,
    },
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
