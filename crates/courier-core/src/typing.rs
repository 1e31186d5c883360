//! Typing indicator tracking for Courier.
//!
//! State reflects exactly the last client-reported signal: there are no
//! server-side expiry timers. A disconnecting user is force-removed from
//! every typing set they were in with a synthetic stop broadcast, so clients
//! never have to guess when an indicator went stale.

use crate::rooms::RoomTracker;
use courier_protocol::{ConversationId, ServerEvent, UserId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Per-conversation typing state with a per-user reverse index.
pub struct TypingTracker {
    rooms: Arc<RoomTracker>,
    /// Users currently typing in each conversation.
    typing: DashMap<ConversationId, HashSet<UserId>>,
    /// Reverse index: conversations each user is typing in.
    by_user: DashMap<UserId, HashSet<ConversationId>>,
}

impl TypingTracker {
    /// Create a tracker broadcasting through the given room tracker.
    #[must_use]
    pub fn new(rooms: Arc<RoomTracker>) -> Self {
        Self {
            rooms,
            typing: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Record a typing signal and broadcast the change to the other members
    /// of the room (sender excluded).
    ///
    /// Repeating the current state is a no-op with no broadcast. Returns
    /// whether the state changed.
    pub fn set_typing(
        &self,
        conversation_id: &str,
        user_id: &str,
        username: Option<String>,
        is_typing: bool,
        sender_connection: &str,
    ) -> bool {
        let changed = if is_typing {
            self.add(conversation_id, user_id)
        } else {
            self.remove(conversation_id, user_id)
        };

        if !changed {
            return false;
        }

        debug!(room = %conversation_id, user = %user_id, is_typing, "Typing state changed");
        self.rooms.broadcast(
            conversation_id,
            &ServerEvent::TypingUpdate {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                username,
                is_typing,
            },
            Some(sender_connection),
        );
        true
    }

    /// Force-remove a user from every typing set they were in, broadcasting
    /// a synthetic stop per conversation. Invoked on disconnect.
    ///
    /// Returns the number of conversations cleared.
    pub fn clear_user(&self, user_id: &str, sender_connection: Option<&str>) -> usize {
        let Some((_, conversations)) = self.by_user.remove(user_id) else {
            return 0;
        };

        for conversation_id in &conversations {
            self.remove_from_set(conversation_id, user_id);
            self.rooms.broadcast(
                conversation_id,
                &ServerEvent::TypingUpdate {
                    conversation_id: conversation_id.clone(),
                    user_id: user_id.to_string(),
                    username: None,
                    is_typing: false,
                },
                sender_connection,
            );
        }

        debug!(user = %user_id, conversations = conversations.len(), "Typing state cleared");
        conversations.len()
    }

    /// Check whether a user is marked typing in a conversation.
    #[must_use]
    pub fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        self.typing
            .get(conversation_id)
            .is_some_and(|set| set.contains(user_id))
    }

    /// Users currently typing in a conversation.
    #[must_use]
    pub fn typists(&self, conversation_id: &str) -> Vec<UserId> {
        self.typing
            .get(conversation_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn add(&self, conversation_id: &str, user_id: &str) -> bool {
        let inserted = self
            .typing
            .entry(conversation_id.to_string())
            .or_default()
            .insert(user_id.to_string());

        if inserted {
            self.by_user
                .entry(user_id.to_string())
                .or_default()
                .insert(conversation_id.to_string());
        }
        inserted
    }

    fn remove(&self, conversation_id: &str, user_id: &str) -> bool {
        let removed = self.remove_from_set(conversation_id, user_id);

        if removed {
            let emptied = self
                .by_user
                .get_mut(user_id)
                .map(|mut set| {
                    set.remove(conversation_id);
                    set.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                self.by_user.remove(user_id);
            }
        }
        removed
    }

    /// Remove from the forward map only, deleting empty sets.
    fn remove_from_set(&self, conversation_id: &str, user_id: &str) -> bool {
        let (removed, emptied) = self
            .typing
            .get_mut(conversation_id)
            .map(|mut set| {
                let removed = set.remove(user_id);
                (removed, set.is_empty())
            })
            .unwrap_or((false, false));

        if emptied {
            self.typing.remove(conversation_id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn setup() -> (Arc<SessionRegistry>, Arc<RoomTracker>, TypingTracker) {
        let registry = Arc::new(SessionRegistry::new());
        let rooms = Arc::new(RoomTracker::new(Arc::clone(&registry)));
        let typing = TypingTracker::new(Arc::clone(&rooms));
        (registry, rooms, typing)
    }

    fn connect(registry: &SessionRegistry, id: &str) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.connect(id.to_string(), tx);
        rx
    }

    fn typing_updates(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<(String, bool)> {
        let mut updates = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::TypingUpdate {
                user_id, is_typing, ..
            } = event
            {
                updates.push((user_id, is_typing));
            }
        }
        updates
    }

    #[test]
    fn test_double_start_broadcasts_once() {
        let (registry, rooms, typing) = setup();
        let _rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");
        rooms.join("c1", "conn-a").unwrap();
        rooms.join("c1", "conn-b").unwrap();

        assert!(typing.set_typing("c1", "u1", Some("alice".into()), true, "conn-a"));
        assert!(!typing.set_typing("c1", "u1", Some("alice".into()), true, "conn-a"));

        assert_eq!(typing_updates(&mut rx_b), vec![("u1".to_string(), true)]);
        assert!(typing.is_typing("c1", "u1"));
    }

    #[test]
    fn test_stop_broadcasts_once_and_is_idempotent() {
        let (registry, rooms, typing) = setup();
        let _rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");
        rooms.join("c1", "conn-a").unwrap();
        rooms.join("c1", "conn-b").unwrap();

        typing.set_typing("c1", "u1", None, true, "conn-a");
        assert!(typing.set_typing("c1", "u1", None, false, "conn-a"));
        assert!(!typing.set_typing("c1", "u1", None, false, "conn-a"));

        assert_eq!(
            typing_updates(&mut rx_b),
            vec![("u1".to_string(), true), ("u1".to_string(), false)]
        );
        assert!(!typing.is_typing("c1", "u1"));
    }

    #[test]
    fn test_sender_excluded_from_broadcast() {
        let (registry, rooms, typing) = setup();
        let mut rx_a = connect(&registry, "conn-a");
        rooms.join("c1", "conn-a").unwrap();

        typing.set_typing("c1", "u1", None, true, "conn-a");
        assert!(typing_updates(&mut rx_a).is_empty());
    }

    #[test]
    fn test_clear_user_emits_synthetic_stop() {
        let (registry, rooms, typing) = setup();
        let _rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");
        rooms.join("c1", "conn-a").unwrap();
        rooms.join("c2", "conn-a").unwrap();
        rooms.join("c1", "conn-b").unwrap();
        rooms.join("c2", "conn-b").unwrap();

        typing.set_typing("c1", "u1", None, true, "conn-a");
        typing.set_typing("c2", "u1", None, true, "conn-a");

        assert_eq!(typing.clear_user("u1", Some("conn-a")), 2);
        assert!(!typing.is_typing("c1", "u1"));
        assert!(!typing.is_typing("c2", "u1"));

        let updates = typing_updates(&mut rx_b);
        let stops = updates.iter().filter(|(_, t)| !t).count();
        assert_eq!(stops, 2);

        // Clearing again is a no-op.
        assert_eq!(typing.clear_user("u1", None), 0);
    }
}
