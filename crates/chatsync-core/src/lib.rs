//! Core contract of the message-synchronization layer.
//!
//! This crate defines the command/event protocol, the conversation/message
//! data model, the push-channel lifecycle state machine, the reconciliation
//! merge, the message cache, and common error/channel abstractions. It is
//! free of I/O; the gateway crate drives it against the REST and push-channel
//! transports.

/// Message cache: the authoritative conversation/message store.
pub mod cache;
/// Async command/event channel primitives.
pub mod channel;
/// Push-channel lifecycle state machine.
pub mod connection;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Send-outcome normalization helpers.
pub mod normalization;
/// Reconciliation merge over ordered message lists.
pub mod reconcile;
/// Backoff policy used by reconnect loops.
pub mod retry;
/// Protocol types (commands, events, data model).
pub mod types;

pub use cache::{CacheUpdate, MessageCache};
pub use channel::{EventStream, SyncChannelError, SyncChannels};
pub use connection::ConnectionStateMachine;
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use normalization::{SendOutcome, normalize_fatal_error, normalize_send_outcome};
pub use reconcile::{DEFAULT_PROVISIONAL_MATCH_WINDOW_MS, MergeOutcome, merge_messages};
pub use retry::RetryPolicy;
pub use types::{
    ConnectionState, Conversation, DeliveryState, Message, MessageId, MessageKind, SendAck,
    SyncCommand, SyncEvent,
};
