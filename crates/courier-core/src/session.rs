//! Session registry for Courier.
//!
//! The registry owns every live connection: its outbound mailbox and, once
//! the client has identified itself, the user it belongs to. A user may hold
//! several connections at once (multi-device), so presence transitions are
//! reported only on the 0→1 and 1→0 edges of the connection count.

use courier_protocol::{ServerEvent, UserId};
use dashmap::DashMap;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A connection identifier.
pub type ConnectionId = String;

/// Outbound mailbox of a connection. Sends never block; the connection task
/// drains the receiver into the transport.
pub type Mailbox = mpsc::UnboundedSender<ServerEvent>;

/// Registry errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection id is not in the registry.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Outcome of binding a connection to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// This was the user's 0→1 connection transition.
    pub came_online: bool,
    /// A rebind detached the connection's previous user and that user now
    /// has zero connections.
    pub displaced_offline: Option<UserId>,
}

/// Outcome of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    /// The user the connection belonged to, if it was identified.
    pub user_id: Option<UserId>,
    /// This was the user's 1→0 connection transition.
    pub went_offline: bool,
}

/// A live connection.
struct ConnectionHandle {
    user_id: Option<UserId>,
    mailbox: Mailbox,
}

/// The session registry.
///
/// Maps connection ids to handles and user ids to their connection sets.
/// Entries in the session map are removed the moment their set empties, so
/// `is_online` is exactly "connection count > 0".
#[derive(Default)]
pub struct SessionRegistry {
    /// All live connections.
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Identified users and their connections.
    sessions: DashMap<UserId, HashSet<ConnectionId>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection that has not identified itself yet.
    pub fn connect(&self, connection_id: impl Into<ConnectionId>, mailbox: Mailbox) {
        let conn_id = connection_id.into();
        debug!(connection = %conn_id, "Connection admitted");
        self.connections.insert(
            conn_id,
            ConnectionHandle {
                user_id: None,
                mailbox,
            },
        );
    }

    /// Check whether a connection is live.
    #[must_use]
    pub fn connection_exists(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// The user a connection is bound to, if identified.
    #[must_use]
    pub fn user_of(&self, connection_id: &str) -> Option<UserId> {
        self.connections
            .get(connection_id)
            .and_then(|h| h.user_id.clone())
    }

    /// Bind a connection to a user.
    ///
    /// Callable multiple times per user for multi-device logins. Rebinding an
    /// already-identified connection detaches it from its previous user first
    /// (last write wins).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection id is not in the registry.
    pub fn register(
        &self,
        user_id: impl Into<UserId>,
        connection_id: &str,
    ) -> Result<Registration, SessionError> {
        let user_id = user_id.into();

        let previous = {
            let mut handle = self
                .connections
                .get_mut(connection_id)
                .ok_or_else(|| SessionError::UnknownConnection(connection_id.to_string()))?;
            handle.user_id.replace(user_id.clone())
        };

        let mut displaced_offline = None;
        if let Some(prev) = previous.filter(|p| *p != user_id) {
            warn!(connection = %connection_id, from = %prev, to = %user_id, "Connection rebound to another user");
            if self.detach(&prev, connection_id) {
                displaced_offline = Some(prev);
            }
        }

        let mut entry = self.sessions.entry(user_id.clone()).or_default();
        let came_online = entry.is_empty();
        entry.insert(connection_id.to_string());

        debug!(
            user = %user_id,
            connection = %connection_id,
            devices = entry.len(),
            "User registered"
        );

        Ok(Registration {
            came_online,
            displaced_offline,
        })
    }

    /// Remove a connection entirely.
    ///
    /// Returns `None` if the connection was not in the registry.
    pub fn disconnect(&self, connection_id: &str) -> Option<Disconnected> {
        let (_, handle) = self.connections.remove(connection_id)?;

        let went_offline = handle
            .user_id
            .as_ref()
            .is_some_and(|user| self.detach(user, connection_id));

        debug!(connection = %connection_id, user = ?handle.user_id, "Connection removed");

        Some(Disconnected {
            user_id: handle.user_id,
            went_offline,
        })
    }

    /// Remove a connection from a user's set, deleting the entry when it
    /// empties. Returns whether this was the 1→0 transition.
    fn detach(&self, user_id: &str, connection_id: &str) -> bool {
        let emptied = if let Some(mut entry) = self.sessions.get_mut(user_id) {
            entry.remove(connection_id);
            entry.is_empty()
        } else {
            false
        };

        if emptied {
            self.sessions.remove(user_id);
        }
        emptied
    }

    /// Check whether a user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.sessions.contains_key(user_id)
    }

    /// Number of live connections a user holds.
    #[must_use]
    pub fn connection_count(&self, user_id: &str) -> usize {
        self.sessions.get(user_id).map_or(0, |s| s.len())
    }

    /// Connection ids to use for unicasting to a user.
    #[must_use]
    pub fn route_to(&self, user_id: &str) -> Vec<ConnectionId> {
        self.sessions
            .get(user_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver an event to one connection.
    ///
    /// Returns `false` if the connection is gone or its mailbox is closed.
    pub fn send_to_connection(&self, connection_id: &str, event: ServerEvent) -> bool {
        match self.connections.get(connection_id) {
            Some(handle) => handle.mailbox.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver an event to every connection of a user.
    ///
    /// Returns the number of connections reached.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        self.route_to(user_id)
            .iter()
            .filter(|conn| self.send_to_connection(conn, event.clone()))
            .count()
    }

    /// Deliver an event to every live connection, identified or not.
    ///
    /// Returns the number of connections reached.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        self.connections
            .iter()
            .filter(|h| h.mailbox.send(event.clone()).is_ok())
            .count()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            connection_count: self.connections.len(),
            online_users: self.sessions.len(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Live connections, identified or not.
    pub connection_count: usize,
    /// Users with at least one connection.
    pub online_users: usize,
}
