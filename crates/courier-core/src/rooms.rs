//! Room membership tracking for Courier.
//!
//! A room is the set of connections currently subscribed to a conversation's
//! live events. The tracker keeps a per-connection reverse index so a
//! disconnect cleans up in O(rooms joined) instead of scanning every room.

use crate::session::{ConnectionId, SessionRegistry};
use courier_protocol::{ConversationId, ServerEvent};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// Room tracker errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The connection is not registered; membership must stay a subset of
    /// live connections.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Per-connection room limit reached.
    #[error("Maximum rooms per connection reached")]
    RoomLimit,
}

/// Room tracker configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 100,
        }
    }
}

/// Tracks which connections have each conversation open.
pub struct RoomTracker {
    registry: Arc<SessionRegistry>,
    /// Room members by conversation.
    rooms: DashMap<ConversationId, HashSet<ConnectionId>>,
    /// Reverse index: rooms joined by each connection.
    joined: DashMap<ConnectionId, HashSet<ConversationId>>,
    config: RoomConfig,
}

impl RoomTracker {
    /// Create a tracker with default configuration.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self::with_config(registry, RoomConfig::default())
    }

    /// Create a tracker with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<SessionRegistry>, config: RoomConfig) -> Self {
        Self {
            registry,
            rooms: DashMap::new(),
            joined: DashMap::new(),
            config,
        }
    }

    /// Subscribe a connection to a conversation's room.
    ///
    /// Re-joining is a no-op; returns whether the membership is new.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered or has hit the
    /// room limit.
    pub fn join(&self, conversation_id: &str, connection_id: &str) -> Result<bool, RoomError> {
        if !self.registry.connection_exists(connection_id) {
            return Err(RoomError::UnknownConnection(connection_id.to_string()));
        }

        {
            let mut joined = self.joined.entry(connection_id.to_string()).or_default();
            if joined.contains(conversation_id) {
                return Ok(false);
            }
            if joined.len() >= self.config.max_rooms_per_connection {
                return Err(RoomError::RoomLimit);
            }
            joined.insert(conversation_id.to_string());
        }

        self.rooms
            .entry(conversation_id.to_string())
            .or_default()
            .insert(connection_id.to_string());

        debug!(room = %conversation_id, connection = %connection_id, "Joined room");
        Ok(true)
    }

    /// Unsubscribe a connection from a conversation's room.
    ///
    /// Returns whether the connection was a member.
    pub fn leave(&self, conversation_id: &str, connection_id: &str) -> bool {
        let was_member = self
            .joined
            .get_mut(connection_id)
            .is_some_and(|mut joined| joined.remove(conversation_id));

        if was_member {
            self.remove_member(conversation_id, connection_id);
            debug!(room = %conversation_id, connection = %connection_id, "Left room");
        }
        was_member
    }

    /// Remove a connection from every room it joined.
    ///
    /// Driven by the reverse index, so the cost is proportional to the rooms
    /// the connection actually had open.
    pub fn leave_all(&self, connection_id: &str) {
        if let Some((_, joined)) = self.joined.remove(connection_id) {
            for conversation_id in &joined {
                self.remove_member(conversation_id, connection_id);
            }
            debug!(connection = %connection_id, rooms = joined.len(), "Left all rooms");
        }
    }

    /// Drop a member from a room's forward map, deleting the room when it
    /// empties.
    fn remove_member(&self, conversation_id: &str, connection_id: &str) {
        let emptied = if let Some(mut members) = self.rooms.get_mut(conversation_id) {
            members.remove(connection_id);
            members.is_empty()
        } else {
            false
        };

        if emptied {
            self.rooms.remove(conversation_id);
            trace!(room = %conversation_id, "Deleted empty room");
        }
    }

    /// Check whether a connection has the conversation open.
    #[must_use]
    pub fn is_member(&self, conversation_id: &str, connection_id: &str) -> bool {
        self.rooms
            .get(conversation_id)
            .is_some_and(|m| m.contains(connection_id))
    }

    /// Snapshot of a room's member connections.
    #[must_use]
    pub fn members(&self, conversation_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(conversation_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a connection currently has open.
    #[must_use]
    pub fn rooms_of(&self, connection_id: &str) -> Vec<ConversationId> {
        self.joined
            .get(connection_id)
            .map(|j| j.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Fan an event out to a room's members, optionally excluding one
    /// connection (typically the sender).
    ///
    /// Returns the number of connections reached.
    pub fn broadcast(
        &self,
        conversation_id: &str,
        event: &ServerEvent,
        exclude: Option<&str>,
    ) -> usize {
        let members = self.members(conversation_id);
        let count = members
            .iter()
            .filter(|conn| exclude != Some(conn.as_str()))
            .filter(|conn| self.registry.send_to_connection(conn, event.clone()))
            .count();

        trace!(room = %conversation_id, recipients = count, "Broadcast");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::{PresenceStatus, ServerEvent};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn setup() -> (Arc<SessionRegistry>, RoomTracker) {
        let registry = Arc::new(SessionRegistry::new());
        let rooms = RoomTracker::new(Arc::clone(&registry));
        (registry, rooms)
    }

    fn connect(registry: &SessionRegistry, id: &str) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.connect(id.to_string(), tx);
        rx
    }

    #[test]
    fn test_join_requires_registered_connection() {
        let (_registry, rooms) = setup();
        assert!(matches!(
            rooms.join("c1", "ghost"),
            Err(RoomError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_join_leave() {
        let (registry, rooms) = setup();
        let _rx = connect(&registry, "conn-a");

        assert!(rooms.join("c1", "conn-a").unwrap());
        assert!(rooms.is_member("c1", "conn-a"));

        // Re-join is a no-op.
        assert!(!rooms.join("c1", "conn-a").unwrap());

        assert!(rooms.leave("c1", "conn-a"));
        assert!(!rooms.is_member("c1", "conn-a"));
        assert_eq!(rooms.room_count(), 0);

        // Leaving again is a no-op.
        assert!(!rooms.leave("c1", "conn-a"));
    }

    #[test]
    fn test_room_limit() {
        let registry = Arc::new(SessionRegistry::new());
        let rooms = RoomTracker::with_config(
            Arc::clone(&registry),
            RoomConfig {
                max_rooms_per_connection: 2,
            },
        );
        let _rx = connect(&registry, "conn-a");

        rooms.join("c1", "conn-a").unwrap();
        rooms.join("c2", "conn-a").unwrap();
        assert!(matches!(rooms.join("c3", "conn-a"), Err(RoomError::RoomLimit)));
    }

    #[test]
    fn test_leave_all_cleans_every_room() {
        let (registry, rooms) = setup();
        let _rx_a = connect(&registry, "conn-a");
        let _rx_b = connect(&registry, "conn-b");

        rooms.join("c1", "conn-a").unwrap();
        rooms.join("c2", "conn-a").unwrap();
        rooms.join("c1", "conn-b").unwrap();

        rooms.leave_all("conn-a");

        assert!(!rooms.is_member("c1", "conn-a"));
        assert!(rooms.rooms_of("conn-a").is_empty());
        // c2 had only conn-a, so it is gone; c1 keeps conn-b.
        assert_eq!(rooms.room_count(), 1);
        assert!(rooms.is_member("c1", "conn-b"));
    }

    #[test]
    fn test_broadcast_with_exclusion() {
        let (registry, rooms) = setup();
        let mut rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");

        rooms.join("c1", "conn-a").unwrap();
        rooms.join("c1", "conn-b").unwrap();

        let event = ServerEvent::user_status("u1", PresenceStatus::Online);
        let count = rooms.broadcast("c1", &event, Some("conn-a"));

        assert_eq!(count, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_unknown_room() {
        let (_registry, rooms) = setup();
        let event = ServerEvent::user_status("u1", PresenceStatus::Online);
        assert_eq!(rooms.broadcast("nowhere", &event, None), 0);
    }
}
