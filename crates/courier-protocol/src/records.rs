//! Persisted record shapes shared between the wire and the store seam.
//!
//! Messages and notifications are owned by the external document store; the
//! core only triggers their creation and relays the results. Drafts are the
//! creation inputs, records the persisted results (id and timestamp assigned
//! by the store).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A user identifier.
pub type UserId = String;

/// A conversation identifier.
pub type ConversationId = String;

/// A persisted message identifier.
pub type MessageId = String;

/// A persisted notification identifier.
pub type NotificationId = String;

/// Atomic counter for id uniqueness within the same timestamp.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current unix time in milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a process-unique identifier with the given prefix.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{:x}{:04x}", nanos, counter & 0xffff)
}

/// Kind of message content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

/// File metadata attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Where the uploaded file lives.
    pub url: String,
    /// Original file name, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Size in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Unix milliseconds.
    pub created_at: u64,
}

/// Input for creating a message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
}

impl MessageDraft {
    /// Materialize this draft into a record with a fresh id and timestamp.
    #[must_use]
    pub fn into_record(self) -> MessageRecord {
        MessageRecord {
            id: generate_id("msg"),
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            kind: self.kind,
            attachment: self.attachment,
            created_at: unix_millis(),
        }
    }
}

/// Kind of notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    Mention,
    GroupInvite,
}

/// Structured payload of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sender_id: UserId,
}

/// A persisted notification for an asynchronous event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: NotificationData,
    pub read: bool,
    /// Unix milliseconds.
    pub created_at: u64,
}

/// Input for creating a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: NotificationData,
}

impl NotificationDraft {
    /// The standard new-message notification for a recipient.
    #[must_use]
    pub fn new_message(
        recipient: impl Into<UserId>,
        sender_name: &str,
        data: NotificationData,
    ) -> Self {
        Self {
            user_id: recipient.into(),
            kind: NotificationKind::Message,
            title: "New Message".to_string(),
            body: format!("{sender_name} sent you a message"),
            data,
        }
    }

    /// Materialize this draft into an unread record with a fresh id.
    #[must_use]
    pub fn into_record(self) -> NotificationRecord {
        NotificationRecord {
            id: generate_id("ntf"),
            user_id: self.user_id,
            kind: self.kind,
            title: self.title,
            body: self.body,
            data: self.data,
            read: false,
            created_at: unix_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_unique() {
        let a = generate_id("msg");
        let b = generate_id("msg");
        assert_ne!(a, b);
        assert!(a.starts_with("msg_"));
    }

    #[test]
    fn test_message_draft_into_record() {
        let draft = MessageDraft {
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            content: "hi".into(),
            kind: MessageKind::Text,
            attachment: None,
        };

        let record = draft.into_record();
        assert_eq!(record.conversation_id, "c1");
        assert_eq!(record.sender_id, "u1");
        assert!(record.created_at > 0);
    }

    #[test]
    fn test_new_message_notification() {
        let data = NotificationData {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            sender_id: "u1".into(),
        };
        let record = NotificationDraft::new_message("u2", "alice", data).into_record();

        assert_eq!(record.user_id, "u2");
        assert_eq!(record.kind, NotificationKind::Message);
        assert_eq!(record.body, "alice sent you a message");
        assert!(!record.read);
    }

    #[test]
    fn test_record_wire_field_names() {
        let record = MessageDraft {
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            content: "hi".into(),
            kind: MessageKind::Text,
            attachment: None,
        }
        .into_record();

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("conversationId").is_some());
        assert!(json.get("senderId").is_some());
        assert_eq!(json["kind"], "text");
    }
}
