//! Presence publishing for Courier.
//!
//! Presence is a user's online/offline status independent of any open
//! conversation, so transitions go out as a global broadcast to every live
//! connection. The publisher is idempotent: repeating a user's current
//! status emits nothing, which together with the registry's 0↔1/1↔0
//! transition reports keeps multi-device logins from spamming status events.

use crate::session::SessionRegistry;
use courier_protocol::{PresenceStatus, ServerEvent, UserId};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Broadcasts online/offline transitions.
pub struct PresencePublisher {
    registry: Arc<SessionRegistry>,
    /// Users currently published as online. Offline users are absent rather
    /// than tombstoned so the map tracks liveness, not history.
    online: DashMap<UserId, ()>,
}

impl PresencePublisher {
    /// Create a publisher over the given registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            online: DashMap::new(),
        }
    }

    /// Publish a user's status to every connection.
    ///
    /// Returns whether an event actually went out; repeating the current
    /// status is a no-op.
    pub fn publish(&self, user_id: &str, status: PresenceStatus) -> bool {
        let changed = match status {
            PresenceStatus::Online => self.online.insert(user_id.to_string(), ()).is_none(),
            PresenceStatus::Offline => self.online.remove(user_id).is_some(),
        };

        if !changed {
            return false;
        }

        let reached = self
            .registry
            .broadcast_all(&ServerEvent::user_status(user_id, status));

        debug!(user = %user_id, ?status, reached, "Presence published");
        true
    }

    /// Whether the user's last published status is online.
    #[must_use]
    pub fn is_published_online(&self, user_id: &str) -> bool {
        self.online.contains_key(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn setup() -> (Arc<SessionRegistry>, PresencePublisher) {
        let registry = Arc::new(SessionRegistry::new());
        let presence = PresencePublisher::new(Arc::clone(&registry));
        (registry, presence)
    }

    fn connect(registry: &SessionRegistry, id: &str) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.connect(id.to_string(), tx);
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_publish_is_idempotent() {
        let (registry, presence) = setup();
        let mut rx = connect(&registry, "watcher");

        assert!(presence.publish("u1", PresenceStatus::Online));
        assert!(!presence.publish("u1", PresenceStatus::Online));
        assert!(presence.publish("u1", PresenceStatus::Offline));
        assert!(!presence.publish("u1", PresenceStatus::Offline));

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                ServerEvent::user_status("u1", PresenceStatus::Online),
                ServerEvent::user_status("u1", PresenceStatus::Offline),
            ]
        );
    }

    #[test]
    fn test_offline_before_online_is_noop() {
        let (registry, presence) = setup();
        let mut rx = connect(&registry, "watcher");

        assert!(!presence.publish("u1", PresenceStatus::Offline));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_multi_device_fires_once_per_transition() {
        let (registry, presence) = setup();
        let mut rx = connect(&registry, "watcher");
        let _rx_a = connect(&registry, "conn-a");
        let _rx_b = connect(&registry, "conn-b");

        // Device A: 0 -> 1 fires.
        let reg = registry.register("u1", "conn-a").unwrap();
        if reg.came_online {
            presence.publish("u1", PresenceStatus::Online);
        }
        // Device B: 1 -> 2 fires nothing.
        let reg = registry.register("u1", "conn-b").unwrap();
        if reg.came_online {
            presence.publish("u1", PresenceStatus::Online);
        }
        // Device A leaves: 2 -> 1 fires nothing.
        let gone = registry.disconnect("conn-a").unwrap();
        if gone.went_offline {
            presence.publish("u1", PresenceStatus::Offline);
        }
        // Device B leaves: 1 -> 0 fires.
        let gone = registry.disconnect("conn-b").unwrap();
        if gone.went_offline {
            presence.publish("u1", PresenceStatus::Offline);
        }

        let statuses: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::UserStatus { user_id, .. } if user_id == "u1"))
            .collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(
            statuses[0],
            ServerEvent::user_status("u1", PresenceStatus::Online)
        );
        assert_eq!(
            statuses[1],
            ServerEvent::user_status("u1", PresenceStatus::Offline)
        );
    }
}
