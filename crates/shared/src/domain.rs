use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ThreadId);
id_newtype!(MessageId);

const LOCAL_ID_PREFIX: &str = "local-";

impl MessageId {
    /// Allocates a client-side id for an optimistic send.
    pub fn new_local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Direct,
    Community,
}

impl ThreadKind {
    /// Path segment used by the history endpoint.
    pub fn as_path_segment(&self) -> &'static str {
        match self {
            ThreadKind::Direct => "direct",
            ThreadKind::Community => "community",
        }
    }
}

/// Delivery lifecycle of a single message.
///
/// `Sending -> Sent -> Delivered -> Seen` only ever moves forward. `Failed` is
/// reachable from `Sending` alone and leaves it only through an explicit resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    #[default]
    Sent,
    Delivered,
    Seen,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Seen => Some(3),
            MessageStatus::Failed => None,
        }
    }

    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Sending, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) | (MessageStatus::Failed, _) => false,
            (current, next) => match (current.rank(), next.rank()) {
                (Some(current), Some(next)) => next > current,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_by: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Optional attachment and reply metadata for an outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub kind: ThreadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<UserId>>,
    /// Message ids in arrival order, without duplicates.
    #[serde(default)]
    pub messages: Vec<MessageId>,
}

impl Thread {
    pub fn new(id: ThreadId, kind: ThreadKind) -> Self {
        Self {
            id,
            kind,
            title: None,
            members: None,
            messages: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        use MessageStatus::*;
        assert!(Sending.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Delivered));
        assert!(Sent.can_advance_to(Seen));
        assert!(Delivered.can_advance_to(Seen));
        assert!(!Seen.can_advance_to(Delivered));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Sent.can_advance_to(Sent));
    }

    #[test]
    fn failed_is_only_reachable_from_sending() {
        use MessageStatus::*;
        assert!(Sending.can_advance_to(Failed));
        assert!(!Sent.can_advance_to(Failed));
        assert!(!Seen.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Sent));
    }

    #[test]
    fn local_ids_are_unique_and_tagged() {
        let a = MessageId::new_local();
        let b = MessageId::new_local();
        assert_ne!(a, b);
        assert!(a.is_local());
        assert!(!MessageId::from("srv-1").is_local());
    }

    #[test]
    fn message_decodes_with_missing_optional_fields() {
        let raw = r#"{
            "id": "m1",
            "text": "hi",
            "createdAt": "2024-01-01T00:00:00Z",
            "senderId": "u1",
            "senderName": "alice"
        }"#;
        let message: Message = serde_json::from_str(raw).expect("decode");
        assert_eq!(message.status, MessageStatus::Sent);
        assert!(message.seen_by.is_none());
    }
}
