//! Call signaling relay for Courier.
//!
//! The relay carries WebRTC offer/answer/ICE traffic between two users and
//! tracks one transient session per unordered user pair. It never inspects
//! or buffers SDP/ICE payloads; early candidates are the receiving peer's
//! problem. Sessions die on reject, cancel, hangup, or when a party's last
//! connection goes away.

use crate::session::SessionRegistry;
use courier_protocol::{ServerEvent, UserId};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Relay errors. These signal client-side races (an answer for a call that
/// was just cancelled, a start while already in a call); callers log them
/// and move on, nothing propagates to other participants.
#[derive(Debug, Error)]
pub enum CallError {
    /// The target user has no live connection.
    #[error("No live connection for {0}")]
    Unreachable(UserId),

    /// A session between the pair is already tracked.
    #[error("A call between {0} and {1} is already tracked")]
    AlreadyInCall(UserId, UserId),

    /// No session exists between the pair.
    #[error("No call session between {0} and {1}")]
    NoSession(UserId, UserId),

    /// The session exists but does not allow the operation.
    #[error("Call between {0} and {1} does not allow {2}")]
    InvalidState(UserId, UserId, &'static str),
}

/// State of a tracked call session. Terminal states are not represented:
/// the session is removed instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Offer relayed, waiting for the callee.
    Ringing,
    /// Answer relayed, media presumed flowing.
    Connected,
}

/// Unordered user pair identifying a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CallKey(UserId, UserId);

impl CallKey {
    fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }

    fn involves(&self, user: &str) -> bool {
        self.0 == user || self.1 == user
    }
}

/// A tracked call.
struct CallSession {
    caller: UserId,
    callee: UserId,
    state: CallState,
    has_video: bool,
    offer: Value,
    answer: Option<Value>,
}

impl CallSession {
    fn peer_of(&self, user: &str) -> UserId {
        if self.caller == user {
            self.callee.clone()
        } else {
            self.caller.clone()
        }
    }
}

/// Owned copy of a tracked session, for diagnostics.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub caller: UserId,
    pub callee: UserId,
    pub state: CallState,
    pub has_video: bool,
    pub offer: Value,
    pub answer: Option<Value>,
}

/// Relays call signaling between users.
pub struct CallRelay {
    registry: Arc<SessionRegistry>,
    calls: DashMap<CallKey, CallSession>,
}

impl CallRelay {
    /// Create a relay over the given registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            calls: DashMap::new(),
        }
    }

    /// Offer a call.
    ///
    /// Relays `call:incoming` to the callee and tracks the session as
    /// ringing. An unreachable callee, or an existing session for the pair,
    /// answers the caller with `call:user-unavailable` instead and tracks
    /// nothing new.
    ///
    /// # Errors
    ///
    /// Returns the reason the offer was refused.
    pub fn start(
        &self,
        caller: &str,
        callee: &str,
        offer: Value,
        has_video: bool,
    ) -> Result<(), CallError> {
        if !self.registry.is_online(callee) {
            self.registry
                .send_to_user(caller, &ServerEvent::CallUserUnavailable);
            return Err(CallError::Unreachable(callee.to_string()));
        }

        let key = CallKey::new(caller, callee);
        match self.calls.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // A second start while a session is live is refused; the
                // existing session stays untouched.
                self.registry
                    .send_to_user(caller, &ServerEvent::CallUserUnavailable);
                Err(CallError::AlreadyInCall(
                    caller.to_string(),
                    callee.to_string(),
                ))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(CallSession {
                    caller: caller.to_string(),
                    callee: callee.to_string(),
                    state: CallState::Ringing,
                    has_video,
                    offer: offer.clone(),
                    answer: None,
                });

                let reached = self.registry.send_to_user(
                    callee,
                    &ServerEvent::CallIncoming {
                        from: caller.to_string(),
                        offer,
                        has_video,
                    },
                );

                // The callee's cleanup may have run between the reachability
                // check and the insert. Nobody heard the offer, so the
                // session must not linger until the caller gives up.
                if reached == 0 {
                    self.calls.remove(&CallKey::new(caller, callee));
                    self.registry
                        .send_to_user(caller, &ServerEvent::CallUserUnavailable);
                    return Err(CallError::Unreachable(callee.to_string()));
                }

                debug!(caller, callee, has_video, "Call ringing");
                Ok(())
            }
        }
    }

    /// Answer a ringing call, transitioning it to connected and relaying
    /// `call:answered` to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists for the pair, the session is
    /// not ringing, or the answering user is not the callee.
    pub fn answer(&self, callee: &str, caller: &str, answer: Value) -> Result<(), CallError> {
        let key = CallKey::new(callee, caller);
        {
            let mut session = self
                .calls
                .get_mut(&key)
                .ok_or_else(|| CallError::NoSession(callee.to_string(), caller.to_string()))?;

            if session.state != CallState::Ringing || session.callee != callee {
                return Err(CallError::InvalidState(
                    callee.to_string(),
                    caller.to_string(),
                    "answer",
                ));
            }

            session.state = CallState::Connected;
            session.answer = Some(answer.clone());
        }

        debug!(caller, callee, "Call connected");
        self.registry
            .send_to_user(caller, &ServerEvent::CallAnswered { answer });
        Ok(())
    }

    /// Forward an ICE candidate to the peer.
    ///
    /// Valid while ringing or connected; the relay never buffers, so a
    /// candidate arriving before the peer is ready is the peer's concern.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists between the pair.
    pub fn ice_candidate(&self, from: &str, to: &str, candidate: Value) -> Result<(), CallError> {
        let key = CallKey::new(from, to);
        if !self.calls.contains_key(&key) {
            return Err(CallError::NoSession(from.to_string(), to.to_string()));
        }

        self.registry
            .send_to_user(to, &ServerEvent::CallIceCandidate { candidate });
        Ok(())
    }

    /// Decline a ringing call, destroying the session and relaying
    /// `call:rejected` to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists, the session is past ringing,
    /// or the rejecting user is not the callee.
    pub fn reject(&self, callee: &str, caller: &str) -> Result<(), CallError> {
        let key = CallKey::new(callee, caller);
        let allowed = match self.calls.get(&key) {
            None => return Err(CallError::NoSession(callee.to_string(), caller.to_string())),
            Some(session) => session.state == CallState::Ringing && session.callee == callee,
        };

        if !allowed {
            return Err(CallError::InvalidState(
                callee.to_string(),
                caller.to_string(),
                "reject",
            ));
        }

        self.calls.remove(&key);
        debug!(caller, callee, "Call rejected");
        self.registry.send_to_user(caller, &ServerEvent::CallRejected);
        Ok(())
    }

    /// Cancel a ringing call or hang up a connected one, from either party.
    /// The other party is informed best-effort.
    ///
    /// # Errors
    ///
    /// Returns an error if no session exists between the pair.
    pub fn end(&self, from: &str, to: &str) -> Result<(), CallError> {
        let key = CallKey::new(from, to);
        if self.calls.remove(&key).is_none() {
            return Err(CallError::NoSession(from.to_string(), to.to_string()));
        }

        debug!(from, to, "Call ended");
        self.registry.send_to_user(to, &ServerEvent::CallEnded);
        Ok(())
    }

    /// Tear down every session involving a user whose last connection went
    /// away, informing each peer best-effort.
    ///
    /// Returns the number of sessions destroyed.
    pub fn drop_user(&self, user_id: &str) -> usize {
        let keys: Vec<CallKey> = self
            .calls
            .iter()
            .filter(|entry| entry.key().involves(user_id))
            .map(|entry| entry.key().clone())
            .collect();

        let mut dropped = 0;
        for key in keys {
            if let Some((_, session)) = self.calls.remove(&key) {
                let peer = session.peer_of(user_id);
                warn!(user = %user_id, peer = %peer, "Call torn down by disconnect");
                self.registry.send_to_user(&peer, &ServerEvent::CallEnded);
                dropped += 1;
            }
        }
        dropped
    }

    /// Current state of the session between two users, if tracked.
    #[must_use]
    pub fn session_state(&self, a: &str, b: &str) -> Option<CallState> {
        self.calls.get(&CallKey::new(a, b)).map(|s| s.state)
    }

    /// Snapshot of the session between two users, if tracked.
    #[must_use]
    pub fn snapshot(&self, a: &str, b: &str) -> Option<CallSnapshot> {
        self.calls.get(&CallKey::new(a, b)).map(|s| CallSnapshot {
            caller: s.caller.clone(),
            callee: s.callee.clone(),
            state: s.state,
            has_video: s.has_video,
            offer: s.offer.clone(),
            answer: s.answer.clone(),
        })
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }
}
