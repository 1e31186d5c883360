//! # courier-protocol
//!
//! Wire protocol definitions for the Courier realtime chat core.
//!
//! The protocol is a closed set of event variants exchanged between a chat
//! client and the server process:
//!
//! - **ClientEvent** - Inbound events (join, send, typing, call signaling)
//! - **ServerEvent** - Outbound events (status, fan-out, notifications, call relay)
//! - **Records** - Persisted message/notification shapes shared with the store
//! - **Codec** - Length-prefixed MessagePack framing
//!
//! Every event carries a fixed schema that is validated at the boundary when
//! the frame is decoded; unknown event types fail decoding rather than being
//! dispatched by name.

pub mod codec;
pub mod events;
pub mod records;

pub use codec::{decode, decode_from, encode, ProtocolError};
pub use events::{error_code, ClientEvent, PresenceStatus, ServerEvent};
pub use records::{
    Attachment, ConversationId, MessageDraft, MessageId, MessageKind, MessageRecord,
    NotificationData, NotificationDraft, NotificationId, NotificationKind, NotificationRecord,
    UserId,
};
