//! # courier-core
//!
//! Realtime coordination components for the Courier chat core.
//!
//! This crate provides the in-memory liveness layer beneath the chat server:
//!
//! - **SessionRegistry** - user identity to live connection(s), with mailboxes
//! - **RoomTracker** - conversation rooms and per-connection membership
//! - **PresencePublisher** - online/offline transition broadcasts
//! - **TypingTracker** - per-conversation typing indicators
//! - **FanoutEngine** - persist-then-broadcast message delivery
//! - **CallRelay** - per-call offer/answer/ICE signaling state machine
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌─────────────┐    ┌──────────────┐
//! │ Connection │───▶│ RoomTracker │───▶│ FanoutEngine │──▶ ChatStore
//! └────────────┘    └─────────────┘    └──────────────┘
//!        │                 ▲
//!        ▼                 │
//! ┌─────────────────┐  ┌───────────────┐  ┌───────────┐
//! │ SessionRegistry │◀─│ TypingTracker │  │ CallRelay │
//! └─────────────────┘  └───────────────┘  └───────────┘
//!        │
//!        ▼
//! ┌───────────────────┐
//! │ PresencePublisher │
//! └───────────────────┘
//! ```
//!
//! All state lives and dies with the process. Components never suspend while
//! holding registry state; the only await points are the [`store::ChatStore`]
//! calls inside the fan-out engine.

pub mod calls;
pub mod fanout;
pub mod presence;
pub mod rooms;
pub mod session;
pub mod store;
pub mod typing;

pub use calls::{CallError, CallRelay, CallSnapshot, CallState};
pub use fanout::{FanoutEngine, FanoutError, OutgoingMessage};
pub use presence::PresencePublisher;
pub use rooms::{RoomConfig, RoomError, RoomTracker};
pub use session::{ConnectionId, Disconnected, Mailbox, Registration, SessionError, SessionRegistry};
pub use store::{ChatStore, MemoryStore, StoreError};
pub use typing::TypingTracker;
