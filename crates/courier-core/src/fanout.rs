//! Message fan-out for Courier.
//!
//! The engine drives the persist-then-broadcast pipeline: nothing is relayed
//! until the store has committed the message, and participants without a live
//! connection fall back to persisted notifications. The caller (a
//! per-connection handler) awaits `send` to completion, which serializes each
//! sender's messages in program order without blocking other connections.

use crate::rooms::RoomTracker;
use crate::session::SessionRegistry;
use crate::store::{ChatStore, StoreError};
use courier_protocol::{
    Attachment, ConversationId, MessageDraft, MessageKind, MessageRecord, NotificationData,
    NotificationDraft, ServerEvent,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Fan-out errors. Both variants are local to the sender; no other
/// participant observes anything.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// The sender's connection does not have the conversation open.
    #[error("Sender is not a member of conversation {0}")]
    Unauthorized(ConversationId),

    /// The store rejected the message; nothing was broadcast.
    #[error("Message persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

/// A message as submitted by a client.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
}

/// Persists and relays messages, with notification fallback for offline
/// participants.
pub struct FanoutEngine {
    store: Arc<dyn ChatStore>,
    rooms: Arc<RoomTracker>,
    registry: Arc<SessionRegistry>,
}

impl FanoutEngine {
    /// Create an engine over the given store and registries.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChatStore>,
        rooms: Arc<RoomTracker>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            store,
            rooms,
            registry,
        }
    }

    /// Send a message into a conversation.
    ///
    /// Persists the message, echoes it to every joined connection (sender
    /// included), and leaves a persisted notification for each participant
    /// with zero live connections. Reachable participants get a live
    /// `notification:new` instead.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError::Unauthorized`] if the sender's connection is
    /// not a room member, or [`FanoutError::Persistence`] if the message
    /// write fails. Either way nothing has been broadcast.
    pub async fn send(
        &self,
        sender_connection: &str,
        sender_id: &str,
        sender_name: Option<&str>,
        outgoing: OutgoingMessage,
    ) -> Result<MessageRecord, FanoutError> {
        let conversation_id = outgoing.conversation_id.clone();

        // Authorization re-checked here as the last line of defense.
        if !self.rooms.is_member(&conversation_id, sender_connection) {
            return Err(FanoutError::Unauthorized(conversation_id));
        }

        let record = self
            .store
            .create_message(MessageDraft {
                conversation_id: conversation_id.clone(),
                sender_id: sender_id.to_string(),
                content: outgoing.content,
                kind: outgoing.kind,
                attachment: outgoing.attachment,
            })
            .await?;

        // Best-effort pointer update; the message itself is already durable.
        if let Err(e) = self
            .store
            .update_last_message(&conversation_id, &record.id)
            .await
        {
            warn!(room = %conversation_id, message = %record.id, error = %e, "Last-message update failed");
        }

        let reached = self.rooms.broadcast(
            &conversation_id,
            &ServerEvent::MessageNew(record.clone()),
            None,
        );
        debug!(room = %conversation_id, message = %record.id, reached, "Message fanned out");

        self.notify_participants(sender_id, sender_name, &record).await;

        Ok(record)
    }

    /// Notify every conversation participant other than the sender: live if
    /// they hold a connection, persisted otherwise. Failures here are logged
    /// and swallowed; the message is already committed and broadcast.
    async fn notify_participants(
        &self,
        sender_id: &str,
        sender_name: Option<&str>,
        record: &MessageRecord,
    ) {
        let participants = match self.store.participants(&record.conversation_id).await {
            Ok(participants) => participants,
            Err(e) => {
                error!(room = %record.conversation_id, error = %e, "Participant lookup failed; skipping notifications");
                return;
            }
        };

        let sender_name = sender_name.unwrap_or(sender_id);

        for recipient in participants.iter().filter(|p| p.as_str() != sender_id) {
            let draft = NotificationDraft::new_message(
                recipient.clone(),
                sender_name,
                NotificationData {
                    conversation_id: record.conversation_id.clone(),
                    message_id: record.id.clone(),
                    sender_id: sender_id.to_string(),
                },
            );

            if self.registry.is_online(recipient) {
                // Reachable now: deliver live, no persisted record.
                self.registry
                    .send_to_user(recipient, &ServerEvent::NotificationNew(draft.into_record()));
            } else if let Err(e) = self.store.create_notification(draft).await {
                error!(user = %recipient, message = %record.id, error = %e, "Notification persistence failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use courier_protocol::UserId;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        rooms: Arc<RoomTracker>,
        store: Arc<MemoryStore>,
        engine: FanoutEngine,
    }

    fn setup() -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let rooms = Arc::new(RoomTracker::new(Arc::clone(&registry)));
        let store = Arc::new(MemoryStore::new());
        let engine = FanoutEngine::new(
            Arc::clone(&store) as Arc<dyn ChatStore>,
            Arc::clone(&rooms),
            Arc::clone(&registry),
        );
        Fixture {
            registry,
            rooms,
            store,
            engine,
        }
    }

    fn connect_user(fx: &Fixture, conn: &str, user: &str) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        fx.registry.connect(conn.to_string(), tx);
        fx.registry.register(user, conn).unwrap();
        rx
    }

    fn outgoing(content: &str) -> OutgoingMessage {
        OutgoingMessage {
            conversation_id: "c1".into(),
            content: content.into(),
            kind: MessageKind::Text,
            attachment: None,
        }
    }

    fn messages(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<MessageRecord> {
        let mut records = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::MessageNew(record) = event {
                records.push(record);
            }
        }
        records
    }

    #[tokio::test]
    async fn test_send_echoes_to_room_including_sender() {
        let fx = setup();
        let mut rx_a = connect_user(&fx, "conn-a", "alice");
        let mut rx_b = connect_user(&fx, "conn-b", "bob");
        fx.rooms.join("c1", "conn-a").unwrap();
        fx.rooms.join("c1", "conn-b").unwrap();
        fx.store
            .set_participants("c1", vec!["alice".into(), "bob".into()]);

        let record = fx
            .engine
            .send("conn-a", "alice", Some("Alice"), outgoing("hi"))
            .await
            .unwrap();

        assert_eq!(record.content, "hi");
        assert_eq!(record.sender_id, "alice");
        assert_eq!(fx.store.message_count(), 1);
        assert_eq!(fx.store.last_message_of("c1"), Some(record.id.clone()));

        // B receives exactly one message:new; so does the sender (UI echo).
        let got_b = messages(&mut rx_b);
        assert_eq!(got_b.len(), 1);
        assert_eq!(got_b[0], record);
        assert_eq!(messages(&mut rx_a).len(), 1);
    }

    #[tokio::test]
    async fn test_offline_participant_gets_persisted_notification() {
        let fx = setup();
        let _rx_a = connect_user(&fx, "conn-a", "alice");
        fx.rooms.join("c1", "conn-a").unwrap();
        fx.store
            .set_participants("c1", vec!["alice".into(), "bob".into()]);

        let record = fx
            .engine
            .send("conn-a", "alice", Some("Alice"), outgoing("hi"))
            .await
            .unwrap();

        let pending = fx.store.notifications_for("bob");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data.conversation_id, "c1");
        assert_eq!(pending[0].data.message_id, record.id);
        assert_eq!(pending[0].body, "Alice sent you a message");
    }

    #[tokio::test]
    async fn test_online_participant_without_room_gets_live_notification() {
        let fx = setup();
        let _rx_a = connect_user(&fx, "conn-a", "alice");
        // Bob is online but has not joined the room.
        let mut rx_b = connect_user(&fx, "conn-b", "bob");
        fx.rooms.join("c1", "conn-a").unwrap();
        fx.store
            .set_participants("c1", vec!["alice".into(), "bob".into()]);

        fx.engine
            .send("conn-a", "alice", None, outgoing("hi"))
            .await
            .unwrap();

        // No message:new (not in the room), one live notification, nothing
        // persisted.
        let mut live_notifications = 0;
        while let Ok(event) = rx_b.try_recv() {
            match event {
                ServerEvent::NotificationNew(n) => {
                    assert_eq!(n.user_id, "bob");
                    live_notifications += 1;
                }
                ServerEvent::MessageNew(_) => panic!("bob is not in the room"),
                _ => {}
            }
        }
        assert_eq!(live_notifications, 1);
        assert!(fx.store.notifications_for("bob").is_empty());
    }

    #[tokio::test]
    async fn test_non_member_is_rejected_without_side_effects() {
        let fx = setup();
        let _rx_a = connect_user(&fx, "conn-a", "alice");
        let mut rx_b = connect_user(&fx, "conn-b", "bob");
        fx.rooms.join("c1", "conn-b").unwrap();
        fx.store
            .set_participants("c1", vec!["alice".into(), "bob".into()]);

        let result = fx.engine.send("conn-a", "alice", None, outgoing("hi")).await;

        assert!(matches!(result, Err(FanoutError::Unauthorized(_))));
        assert_eq!(fx.store.message_count(), 0);
        assert!(messages(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_aborts_before_broadcast() {
        let fx = setup();
        let _rx_a = connect_user(&fx, "conn-a", "alice");
        let mut rx_b = connect_user(&fx, "conn-b", "bob");
        fx.rooms.join("c1", "conn-a").unwrap();
        fx.rooms.join("c1", "conn-b").unwrap();
        fx.store
            .set_participants("c1", vec!["alice".into(), "bob".into()]);
        fx.store.fail_writes(true);

        let result = fx.engine.send("conn-a", "alice", None, outgoing("hi")).await;

        assert!(matches!(result, Err(FanoutError::Persistence(_))));
        assert!(messages(&mut rx_b).is_empty());
        assert!(fx.store.notifications_for("bob").is_empty());
    }

    #[tokio::test]
    async fn test_sender_never_notified_about_own_message() {
        let fx = setup();
        let _rx_a = connect_user(&fx, "conn-a", "alice");
        fx.rooms.join("c1", "conn-a").unwrap();
        fx.store.set_participants("c1", vec![UserId::from("alice")]);

        fx.engine
            .send("conn-a", "alice", None, outgoing("hi"))
            .await
            .unwrap();

        assert!(fx.store.notifications_for("alice").is_empty());
    }
}
