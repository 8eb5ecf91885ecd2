//! Core contract shared between the chat session runtime and its frontends.
//!
//! This crate defines the command/event protocol, the connection lifecycle,
//! the timeline merge and outbound echo logic, and common error/channel
//! abstractions. It performs no I/O.

/// Async command/event channel primitives.
pub mod channel;
/// Provisional message creation and echo reconciliation.
pub mod composer;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Wire payload validation and timestamp helpers.
pub mod normalization;
/// Backoff policy used by reconnect loops.
pub mod retry;
/// Channel connection state machine.
pub mod state_machine;
/// Ordered, duplicate-free timeline.
pub mod timeline;
/// Frontend-facing protocol types (commands, events, payloads).
pub mod types;

pub use channel::{ChatChannelError, ChatChannels, EventStream};
pub use composer::OutboundComposer;
pub use error::{ChatError, ComposeRejected, ErrorCategory, LoadError, classify_http_status};
pub use normalization::{
    InboundMessage, InboundRejected, OutboundPayload, normalize_inbound, unix_ms_now,
};
pub use retry::RetryPolicy;
pub use state_machine::{ConnectionSignal, ConnectionStateMachine};
pub use timeline::{TimelineMergeError, TimelineMerger};
pub use types::{
    ChatCommand, ChatEvent, ChatNotice, ConnectionState, Message, MessageId, Session,
    SessionTuning, UserId, UserIdentity,
};
