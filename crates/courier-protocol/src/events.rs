//! Event types for the Courier protocol.
//!
//! Inbound and outbound traffic is a closed, enumerated set of variants;
//! each variant has a fixed schema validated when the frame is decoded.
//! SDP offers/answers and ICE candidates are opaque JSON blobs relayed
//! verbatim between peers.

use crate::records::{Attachment, ConversationId, MessageKind, MessageRecord, NotificationRecord, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes carried by [`ServerEvent::Error`].
pub mod error_code {
    /// Malformed or out-of-order event.
    pub const BAD_EVENT: u16 = 4000;
    /// Sender is not a member of the target room.
    pub const UNAUTHORIZED: u16 = 4001;
    /// External store write failed.
    pub const PERSISTENCE: u16 = 4002;
    /// Per-connection room limit reached.
    pub const ROOM_LIMIT: u16 = 4003;
}

/// A user's presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Events a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Identify the connection as a user (multi-device safe).
    #[serde(rename = "user:join", rename_all = "camelCase")]
    UserJoin { user_id: UserId },

    /// Subscribe to a conversation's live events.
    #[serde(rename = "conversation:join", rename_all = "camelCase")]
    ConversationJoin { conversation_id: ConversationId },

    /// Unsubscribe from a conversation's live events.
    #[serde(rename = "conversation:leave", rename_all = "camelCase")]
    ConversationLeave { conversation_id: ConversationId },

    /// Send a message into a conversation.
    #[serde(rename = "message:send", rename_all = "camelCase")]
    MessageSend {
        conversation_id: ConversationId,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachment: Option<Attachment>,
    },

    /// The user began typing in a conversation.
    #[serde(rename = "typing:start", rename_all = "camelCase")]
    TypingStart {
        conversation_id: ConversationId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },

    /// The user stopped typing in a conversation.
    #[serde(rename = "typing:stop", rename_all = "camelCase")]
    TypingStop {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    /// Offer a call to another user.
    #[serde(rename = "call:start", rename_all = "camelCase")]
    CallStart {
        to: UserId,
        offer: Value,
        #[serde(default)]
        has_video: bool,
    },

    /// Answer a ringing call.
    #[serde(rename = "call:answer", rename_all = "camelCase")]
    CallAnswer { to: UserId, answer: Value },

    /// Trickle an ICE candidate to the peer.
    #[serde(rename = "call:ice-candidate", rename_all = "camelCase")]
    CallIceCandidate { to: UserId, candidate: Value },

    /// Decline a ringing call.
    #[serde(rename = "call:reject", rename_all = "camelCase")]
    CallReject { to: UserId },

    /// Cancel a ringing call or hang up a connected one.
    #[serde(rename = "call:end", rename_all = "camelCase")]
    CallEnd { to: UserId },
}

/// Events the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Presence transition, broadcast to every connection.
    #[serde(rename = "user:status", rename_all = "camelCase")]
    UserStatus {
        user_id: UserId,
        status: PresenceStatus,
    },

    /// A persisted message, fanned out to the room (sender included).
    #[serde(rename = "message:new")]
    MessageNew(MessageRecord),

    /// Typing indicator change, fanned out to the room (sender excluded).
    #[serde(rename = "typing:update", rename_all = "camelCase")]
    TypingUpdate {
        conversation_id: ConversationId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        is_typing: bool,
    },

    /// A notification delivered live because the recipient was reachable.
    #[serde(rename = "notification:new")]
    NotificationNew(NotificationRecord),

    /// Incoming call offer.
    #[serde(rename = "call:incoming", rename_all = "camelCase")]
    CallIncoming {
        from: UserId,
        offer: Value,
        has_video: bool,
    },

    /// The callee answered.
    #[serde(rename = "call:answered", rename_all = "camelCase")]
    CallAnswered { answer: Value },

    /// Relayed ICE candidate.
    #[serde(rename = "call:ice-candidate", rename_all = "camelCase")]
    CallIceCandidate { candidate: Value },

    /// The callee declined.
    #[serde(rename = "call:rejected")]
    CallRejected,

    /// The other party ended the call.
    #[serde(rename = "call:ended")]
    CallEnded,

    /// The callee has no live connection (or is already in a call).
    #[serde(rename = "call:user-unavailable")]
    CallUserUnavailable,

    /// Direct error to the failing connection; other participants see nothing.
    #[serde(rename = "error")]
    Error { code: u16, message: String },
}

impl ServerEvent {
    /// Create a presence status event.
    #[must_use]
    pub fn user_status(user_id: impl Into<UserId>, status: PresenceStatus) -> Self {
        ServerEvent::UserStatus {
            user_id: user_id.into(),
            status,
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_wire_shape() {
        let event = ClientEvent::MessageSend {
            conversation_id: "c1".into(),
            content: "hi".into(),
            kind: MessageKind::Text,
            attachment: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message:send");
        assert_eq!(json["conversationId"], "c1");
    }

    #[test]
    fn test_client_event_defaults() {
        // hasVideo and kind may be omitted by older clients.
        let event: ClientEvent = serde_json::from_value(json!({
            "type": "call:start",
            "to": "u2",
            "offer": {"sdp": "v=0"},
        }))
        .unwrap();

        assert_eq!(
            event,
            ClientEvent::CallStart {
                to: "u2".into(),
                offer: json!({"sdp": "v=0"}),
                has_video: false,
            }
        );
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_value(json!({"type": "admin:shutdown"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_server_event_unit_variants() {
        let json = serde_json::to_value(ServerEvent::CallRejected).unwrap();
        assert_eq!(json["type"], "call:rejected");

        let json = serde_json::to_value(ServerEvent::CallUserUnavailable).unwrap();
        assert_eq!(json["type"], "call:user-unavailable");
    }

    #[test]
    fn test_presence_status_wire_values() {
        let event = ServerEvent::user_status("u1", PresenceStatus::Online);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["userId"], "u1");
    }
}
