//! Store seam for Courier.
//!
//! Message and notification records are owned by an external document store;
//! the core only needs the four collaborator operations behind [`ChatStore`].
//! [`MemoryStore`] is the in-process implementation used by tests and the
//! default server binary.

use async_trait::async_trait;
use courier_protocol::{
    ConversationId, MessageDraft, MessageId, MessageRecord, NotificationDraft, NotificationId,
    NotificationRecord, UserId,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Write rejected or lost by the backing store.
    #[error("Store write failed: {0}")]
    WriteFailed(String),

    /// The referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store is unreachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Collaborator interface to the persistence layer.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a message, assigning its id and timestamp.
    async fn create_message(&self, draft: MessageDraft) -> Result<MessageRecord, StoreError>;

    /// Point the conversation's last-message reference at the given message.
    async fn update_last_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError>;

    /// Persist a notification for later retrieval through the fetch path.
    async fn create_notification(
        &self,
        draft: NotificationDraft,
    ) -> Result<NotificationRecord, StoreError>;

    /// Every participant of a conversation, whether or not they have the
    /// room open.
    async fn participants(&self, conversation_id: &str) -> Result<Vec<UserId>, StoreError>;
}

/// In-memory [`ChatStore`] with write-failure injection.
#[derive(Default)]
pub struct MemoryStore {
    messages: DashMap<MessageId, MessageRecord>,
    notifications: DashMap<NotificationId, NotificationRecord>,
    last_message: DashMap<ConversationId, MessageId>,
    participants: DashMap<ConversationId, Vec<UserId>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a conversation's participant list.
    pub fn set_participants(&self, conversation_id: impl Into<ConversationId>, users: Vec<UserId>) {
        self.participants.insert(conversation_id.into(), users);
    }

    /// Make subsequent writes fail, for exercising persistence-error paths.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::WriteFailed("injected failure".to_string()));
        }
        Ok(())
    }

    /// Number of persisted messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Persisted notifications for a user, oldest first.
    #[must_use]
    pub fn notifications_for(&self, user_id: &str) -> Vec<NotificationRecord> {
        let mut records: Vec<_> = self
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .map(|n| n.value().clone())
            .collect();
        records.sort_by_key(|n| n.created_at);
        records
    }

    /// The conversation's last-message pointer.
    #[must_use]
    pub fn last_message_of(&self, conversation_id: &str) -> Option<MessageId> {
        self.last_message
            .get(conversation_id)
            .map(|m| m.value().clone())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_message(&self, draft: MessageDraft) -> Result<MessageRecord, StoreError> {
        self.check_writable()?;
        let record = draft.into_record();
        self.messages.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_last_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        if !self.messages.contains_key(message_id) {
            return Err(StoreError::NotFound(message_id.to_string()));
        }
        self.last_message
            .insert(conversation_id.to_string(), message_id.to_string());
        Ok(())
    }

    async fn create_notification(
        &self,
        draft: NotificationDraft,
    ) -> Result<NotificationRecord, StoreError> {
        self.check_writable()?;
        let record = draft.into_record();
        self.notifications.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn participants(&self, conversation_id: &str) -> Result<Vec<UserId>, StoreError> {
        Ok(self
            .participants
            .get(conversation_id)
            .map(|p| p.value().clone())
            .unwrap_or_default())
    }
}
