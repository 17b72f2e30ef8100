use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Push-channel connection state reported to the rendering layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session is open and none is being opened.
    Disconnected,
    /// A session handshake is in progress.
    Connecting,
    /// A session is established and events flow.
    Connected,
    /// The session dropped; a backoff delay runs before the next attempt.
    Reconnecting,
    /// Terminal: credentials were rejected or retries were exhausted.
    ///
    /// Recovery requires a fresh `Connect` command from the caller.
    Unavailable,
}

/// Identifier of a message as tracked by the cache.
///
/// Final ids are server-assigned; provisional ids are generated locally for
/// messages awaiting their durable acknowledgement. The derived ordering
/// (final ids numerically, then provisional ids) breaks timestamp ties
/// deterministically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageId {
    /// Durable id assigned by the REST write path.
    Final(i64),
    /// Local id for a message whose durable write has not resolved yet.
    Provisional(Uuid),
}

impl MessageId {
    /// Whether this id still awaits its durable counterpart.
    pub fn is_provisional(&self) -> bool {
        matches!(self, MessageId::Provisional(_))
    }
}

/// Payload kind carried by a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text body.
    Text,
    /// File reference; the body holds the file name or URL.
    File,
}

/// Delivery progress of a locally originated message.
///
/// Incoming messages are always `Confirmed`; the other states only ever
/// apply to messages this client composed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryState {
    /// Provisional entry inserted, durable write in flight.
    Pending,
    /// Push mirror emitted while the durable write is still in flight.
    Sent,
    /// Durable write succeeded and the final id is assigned.
    Confirmed,
    /// Durable write failed; retry is user-triggered only.
    Failed,
}

/// A single chat message owned by the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Final or provisional identity, unique within the conversation.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: i64,
    /// Author user id.
    pub sender_id: i64,
    /// Display body (text, or file name/URL for `File` messages).
    pub content: String,
    /// Payload kind.
    pub kind: MessageKind,
    /// Milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    /// Delivery progress; `Confirmed` for all incoming data.
    pub delivery: DeliveryState,
}

impl Message {
    /// Total ordering key within a conversation: `(timestamp, id)`.
    pub fn ordering_key(&self) -> (u64, MessageId) {
        (self.timestamp_ms, self.id)
    }
}

/// A peer-to-peer conversation between exactly two users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Server-assigned stable id.
    pub id: i64,
    /// The two participant user ids; the local user is one of them.
    pub participants: [i64; 2],
    /// Id of the newest message, when known.
    pub last_message_id: Option<MessageId>,
    /// Timestamp of the newest message, cached for list sorting.
    pub last_message_time_ms: Option<u64>,
    /// Messages from the peer not yet seen by the local user.
    pub unread_count: u32,
}

impl Conversation {
    /// The participant that is not `local_user_id`, when present.
    pub fn peer_of(&self, local_user_id: i64) -> Option<i64> {
        self.participants
            .iter()
            .copied()
            .find(|id| *id != local_user_id)
    }
}

/// Command channel input accepted by the gateway runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncCommand {
    /// Open the push-channel session with the given credential token.
    ///
    /// Idempotent: connecting while a session is live is a no-op.
    Connect {
        /// Opaque credential presented during the handshake.
        token: String,
    },
    /// Tear down the push-channel session and release its resources.
    Disconnect,
    /// Fetch the conversation list snapshot into the cache.
    RefreshConversations,
    /// Mark a conversation active, reset its unread count, fetch history.
    OpenConversation {
        /// Target conversation id.
        conversation_id: i64,
    },
    /// Clear the active conversation.
    CloseConversation,
    /// Send a message through the delivery pipeline.
    SendMessage {
        /// Target conversation id.
        conversation_id: i64,
        /// Frontend-provided transaction id echoed in `SendAck`.
        client_txn_id: String,
        /// Message body.
        content: String,
        /// Payload kind.
        kind: MessageKind,
    },
    /// Re-attempt the durable write for a failed message.
    ///
    /// Never creates a second provisional entry.
    RetrySend {
        /// Conversation holding the failed message.
        conversation_id: i64,
        /// Provisional id of the failed message.
        message_id: MessageId,
        /// Frontend-provided transaction id echoed in `SendAck`.
        client_txn_id: String,
    },
    /// Create (or return the existing) conversation with a peer.
    CreateConversation {
        /// Peer user id.
        participant_id: i64,
    },
    /// Mirror a typing indicator to the peer's live view.
    SetTyping {
        /// Target conversation id.
        conversation_id: i64,
        /// Whether the local user is currently typing.
        typing: bool,
    },
}

/// Acknowledgement for `SendMessage`/`RetrySend` commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Original frontend transaction id.
    pub client_txn_id: String,
    /// Final message id on success.
    pub message_id: Option<MessageId>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Event channel output emitted by the gateway runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncEvent {
    /// Push-channel connection transition.
    ConnectionChanged {
        /// New connection state.
        state: ConnectionState,
    },
    /// The cache changed; snapshots should be re-read.
    ///
    /// Coalesced: at most one per mutation batch. `None` means the
    /// conversation list itself changed.
    CacheUpdated {
        /// Affected conversation, when the change was scoped to one.
        conversation_id: Option<i64>,
    },
    /// Send acknowledgement for the delivery pipeline.
    SendAck(SendAck),
    /// A conversation was created (or an existing one was returned).
    ConversationCreated {
        /// Id of the conversation.
        conversation_id: i64,
    },
    /// The peer's typing state changed.
    PeerTyping {
        /// Conversation the indicator belongs to.
        conversation_id: i64,
        /// User who is (or stopped) typing.
        user_id: i64,
        /// Current typing state.
        typing: bool,
    },
    /// Unrecoverable or noteworthy runtime error.
    FatalError {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_ids_order_before_provisional_ids() {
        let final_id = MessageId::Final(7);
        let provisional = MessageId::Provisional(Uuid::new_v4());
        assert!(final_id < provisional);
        assert!(provisional.is_provisional());
        assert!(!final_id.is_provisional());
    }

    #[test]
    fn ordering_key_breaks_timestamp_ties_by_id() {
        let a = Message {
            id: MessageId::Final(1),
            conversation_id: 7,
            sender_id: 1,
            content: "a".into(),
            kind: MessageKind::Text,
            timestamp_ms: 100,
            delivery: DeliveryState::Confirmed,
        };
        let b = Message {
            id: MessageId::Final(2),
            timestamp_ms: 100,
            ..a.clone()
        };
        assert!(a.ordering_key() < b.ordering_key());
    }

    #[test]
    fn conversation_peer_lookup_skips_local_user() {
        let conversation = Conversation {
            id: 3,
            participants: [10, 20],
            last_message_id: None,
            last_message_time_ms: None,
            unread_count: 0,
        };
        assert_eq!(conversation.peer_of(10), Some(20));
        assert_eq!(conversation.peer_of(20), Some(10));
    }

    #[test]
    fn message_kind_uses_snake_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&MessageKind::Text).expect("serialize"),
            "\"text\""
        );
        assert_eq!(
            serde_json::from_str::<MessageKind>("\"file\"").expect("deserialize"),
            MessageKind::File
        );
    }
}
