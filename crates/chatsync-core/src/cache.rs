use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tokio::sync::broadcast;

use crate::{
    error::{SyncError, SyncErrorCategory},
    reconcile::{self, MergeOutcome},
    types::{Conversation, DeliveryState, Message, MessageId},
};

const UPDATE_BUFFER: usize = 64;

/// Change notification emitted after a successful mutation batch.
///
/// Coalesced: one notification per batch, never one per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheUpdate {
    /// Affected conversation; `None` when the conversation list changed.
    pub conversation_id: Option<i64>,
}

/// Authoritative in-memory store of conversations and their messages.
///
/// The cache is the only mutable shared state of the sync layer. All
/// mutations run under one write lock, so a subscriber never observes a
/// partially merged batch. The cache itself never issues network calls.
#[derive(Debug)]
pub struct MessageCache {
    local_user_id: i64,
    provisional_window_ms: u64,
    inner: RwLock<CacheInner>,
    update_tx: broadcast::Sender<CacheUpdate>,
}

#[derive(Debug, Default)]
struct CacheInner {
    active_conversation: Option<i64>,
    conversations: HashMap<i64, Conversation>,
    messages: HashMap<i64, Vec<Message>>,
}

impl MessageCache {
    pub fn new(local_user_id: i64, provisional_window_ms: u64) -> Self {
        let (update_tx, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            local_user_id,
            provisional_window_ms,
            inner: RwLock::new(CacheInner::default()),
            update_tx,
        }
    }

    pub fn local_user_id(&self) -> i64 {
        self.local_user_id
    }

    pub fn active_conversation(&self) -> Option<i64> {
        self.read().active_conversation
    }

    /// Subscribe to coalesced change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.update_tx.subscribe()
    }

    /// Merge a conversation-list snapshot.
    ///
    /// Whole-record replace when the incoming `last_message_time` is not
    /// older than the cached one; stale records are dropped. The active
    /// conversation's unread count stays at zero regardless of what the
    /// snapshot carries.
    pub fn upsert_conversations(&self, conversations: Vec<Conversation>) {
        let changed = {
            let mut inner = self.write();
            let active = inner.active_conversation;
            let mut changed = false;

            for mut incoming in conversations {
                if active == Some(incoming.id) {
                    incoming.unread_count = 0;
                }
                let keep_cached = match inner.conversations.get(&incoming.id) {
                    Some(cached) => {
                        incoming.last_message_time_ms < cached.last_message_time_ms
                            || *cached == incoming
                    }
                    None => false,
                };
                if !keep_cached {
                    inner.conversations.insert(incoming.id, incoming);
                    changed = true;
                }
            }
            changed
        };

        if changed {
            self.notify(None);
        }
    }

    /// Merge a message batch (REST page or push event) for one conversation.
    ///
    /// Newly inserted peer messages bump the conversation's unread count
    /// unless the conversation is the active one. Messages tagged with a
    /// different conversation id are dropped.
    pub fn upsert_messages(&self, conversation_id: i64, batch: Vec<Message>) -> MergeOutcome {
        let outcome = {
            let mut inner = self.write();
            let batch: Vec<Message> = batch
                .into_iter()
                .filter(|m| m.conversation_id == conversation_id)
                .collect();

            let list = inner.messages.entry(conversation_id).or_default();
            let outcome = reconcile::merge_messages(list, batch, self.provisional_window_ms);

            if outcome.changed {
                let tail = list.last().map(|m| (m.id, m.timestamp_ms));
                let peer_hint = outcome
                    .inserted
                    .iter()
                    .map(|m| m.sender_id)
                    .find(|sender| *sender != self.local_user_id);
                let new_unread = outcome
                    .inserted
                    .iter()
                    .filter(|m| m.sender_id != self.local_user_id)
                    .count() as u32;

                Self::refresh_conversation_record(
                    &mut inner,
                    conversation_id,
                    self.local_user_id,
                    peer_hint,
                    tail,
                    new_unread,
                );
            }
            outcome
        };

        if outcome.changed {
            self.notify(Some(conversation_id));
        }
        outcome
    }

    pub fn get_conversation(&self, id: i64) -> Option<Conversation> {
        self.read().conversations.get(&id).cloned()
    }

    /// Conversation snapshots sorted for list views: newest activity first,
    /// conversations without messages last, ties by id for determinism.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.read().conversations.values().cloned().collect();
        list.sort_by(|a, b| {
            b.last_message_time_ms
                .cmp(&a.last_message_time_ms)
                .then(a.id.cmp(&b.id))
        });
        list
    }

    /// Immutable message snapshot in `(timestamp, id)` order.
    pub fn messages(&self, conversation_id: i64) -> Vec<Message> {
        self.read()
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Mark a conversation active and reset its unread count.
    ///
    /// This is the only operation that resets an unread count. Returns the
    /// final id of the newest peer message, for read-receipt mirroring.
    pub fn open_conversation(&self, conversation_id: i64) -> Option<i64> {
        let (changed, latest_peer) = {
            let mut inner = self.write();
            inner.active_conversation = Some(conversation_id);

            let mut changed = false;
            if let Some(conversation) = inner.conversations.get_mut(&conversation_id)
                && conversation.unread_count != 0
            {
                conversation.unread_count = 0;
                changed = true;
            }

            let latest_peer = inner
                .messages
                .get(&conversation_id)
                .and_then(|list| {
                    list.iter()
                        .rev()
                        .find(|m| m.sender_id != self.local_user_id)
                })
                .and_then(|m| match m.id {
                    MessageId::Final(id) => Some(id),
                    MessageId::Provisional(_) => None,
                });
            (changed, latest_peer)
        };

        if changed {
            self.notify(Some(conversation_id));
        }
        latest_peer
    }

    /// Clear the active conversation.
    pub fn close_conversation(&self) {
        self.write().active_conversation = None;
    }

    /// Insert a freshly composed provisional message (`Pending`).
    ///
    /// Its position is fixed at insertion time by the local clock and is
    /// never reordered relative to already-confirmed messages while the
    /// durable write runs.
    pub fn insert_provisional(&self, message: Message) -> Result<(), SyncError> {
        if !message.id.is_provisional() {
            return Err(SyncError::new(
                SyncErrorCategory::Internal,
                "provisional_id_required",
                format!("insert_provisional called with final id {:?}", message.id),
            ));
        }

        let conversation_id = message.conversation_id;
        {
            let mut inner = self.write();
            let list = inner.messages.entry(conversation_id).or_default();
            let at = reconcile::insertion_point(list, &message);
            list.insert(at, message);
            let tail = list.last().map(|m| (m.id, m.timestamp_ms));

            Self::refresh_conversation_record(
                &mut inner,
                conversation_id,
                self.local_user_id,
                None,
                tail,
                0,
            );
        }

        self.notify(Some(conversation_id));
        Ok(())
    }

    /// Record that the push mirror for a pending message was emitted.
    pub fn mark_sent(&self, conversation_id: i64, message_id: MessageId) {
        let changed = {
            let mut inner = self.write();
            inner
                .messages
                .get_mut(&conversation_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
                .filter(|m| m.delivery == DeliveryState::Pending)
                .map(|m| m.delivery = DeliveryState::Sent)
                .is_some()
        };

        if changed {
            self.notify(Some(conversation_id));
        }
    }

    /// Replace a provisional entry with its durable counterpart.
    ///
    /// Exactly one entry survives: if the push echo already landed (and was
    /// correlated or merged by final id), the stale provisional is dropped
    /// instead of being resolved a second time.
    pub fn resolve_provisional(
        &self,
        conversation_id: i64,
        provisional_id: MessageId,
        final_message: Message,
    ) -> Result<MessageId, SyncError> {
        let final_id = final_message.id;
        if final_id.is_provisional() {
            return Err(SyncError::new(
                SyncErrorCategory::Internal,
                "final_id_required",
                format!("resolve_provisional called with provisional id {final_id:?}"),
            ));
        }

        {
            let mut inner = self.write();
            let list = inner.messages.entry(conversation_id).or_default();
            let mut confirmed = final_message;
            confirmed.delivery = DeliveryState::Confirmed;

            match list.iter().position(|m| m.id == provisional_id) {
                Some(pos) if list.iter().any(|m| m.id == final_id) => {
                    list.remove(pos);
                }
                Some(pos) => {
                    list[pos] = confirmed;
                    reconcile::reseat(list, pos);
                }
                None => {
                    reconcile::merge_messages(list, vec![confirmed], self.provisional_window_ms);
                }
            }

            let tail = list.last().map(|m| (m.id, m.timestamp_ms));
            Self::refresh_conversation_record(
                &mut inner,
                conversation_id,
                self.local_user_id,
                None,
                tail,
                0,
            );
        }

        self.notify(Some(conversation_id));
        Ok(final_id)
    }

    /// Mark a pending/sent provisional message as failed.
    pub fn mark_failed(&self, conversation_id: i64, message_id: MessageId) {
        let changed = {
            let mut inner = self.write();
            inner
                .messages
                .get_mut(&conversation_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
                .filter(|m| {
                    matches!(m.delivery, DeliveryState::Pending | DeliveryState::Sent)
                })
                .map(|m| m.delivery = DeliveryState::Failed)
                .is_some()
        };

        if changed {
            self.notify(Some(conversation_id));
        }
    }

    /// Flip a failed message back to `Pending` and hand it to the caller
    /// for the retried durable write. The entry itself stays in place, so a
    /// retry never creates a second provisional message.
    pub fn take_for_retry(
        &self,
        conversation_id: i64,
        message_id: MessageId,
    ) -> Result<Message, SyncError> {
        let message = {
            let mut inner = self.write();
            let found = inner
                .messages
                .get_mut(&conversation_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == message_id));

            let Some(message) = found else {
                return Err(SyncError::new(
                    SyncErrorCategory::Delivery,
                    "message_not_found",
                    format!("no message {message_id:?} in conversation {conversation_id}"),
                ));
            };
            if message.delivery != DeliveryState::Failed {
                return Err(SyncError::new(
                    SyncErrorCategory::Delivery,
                    "retry_not_failed",
                    format!("message {message_id:?} is not in the failed state"),
                ));
            }
            message.delivery = DeliveryState::Pending;
            message.clone()
        };

        self.notify(Some(conversation_id));
        Ok(message)
    }

    /// Update (or synthesize) the conversation record after a message
    /// mutation: newest-message fields and unread accounting.
    fn refresh_conversation_record(
        inner: &mut CacheInner,
        conversation_id: i64,
        local_user_id: i64,
        peer_hint: Option<i64>,
        tail: Option<(MessageId, u64)>,
        new_unread: u32,
    ) {
        let active = inner.active_conversation;
        let conversation = inner
            .conversations
            .entry(conversation_id)
            .or_insert_with(|| Conversation {
                id: conversation_id,
                participants: [local_user_id, peer_hint.unwrap_or(local_user_id)],
                last_message_id: None,
                last_message_time_ms: None,
                unread_count: 0,
            });

        if let Some((id, timestamp_ms)) = tail {
            conversation.last_message_id = Some(id);
            conversation.last_message_time_ms = Some(timestamp_ms);
        }
        if active != Some(conversation_id) {
            conversation.unread_count = conversation.unread_count.saturating_add(new_unread);
        }
    }

    fn notify(&self, conversation_id: Option<i64>) {
        let _ = self.update_tx.send(CacheUpdate { conversation_id });
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
