use std::collections::HashSet;

use crate::types::{DeliveryState, Message, MessageId};

/// Default correlation window for matching a durable echo against a local
/// provisional message, in milliseconds.
pub const DEFAULT_PROVISIONAL_MATCH_WINDOW_MS: u64 = 30_000;

/// Result of one merge batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Whether the ordered list differs from its pre-merge state.
    pub changed: bool,
    /// Genuinely new messages, in merge order. Replacements and overwrites
    /// of already-known entries are not listed here.
    pub inserted: Vec<Message>,
    /// Ids whose immutable fields diverged between copies. An entry here is
    /// a programming-error signal, not a recoverable condition; the durable
    /// copy wins regardless.
    pub conflicts: Vec<MessageId>,
}

/// Merge `incoming` into the ordered `existing` list.
///
/// The merge is commutative and idempotent: applying the same batch twice,
/// or two overlapping batches in either order, yields the same final list.
/// `existing` must be (and stays) strictly ordered by `(timestamp, id)`.
///
/// Incoming messages with a final id overwrite same-id entries field by
/// field (durable data wins), replace a correlated provisional entry in
/// place, or are inserted at their ordering position. A trailing dedup pass
/// defends against replayed push events.
pub fn merge_messages(
    existing: &mut Vec<Message>,
    incoming: Vec<Message>,
    provisional_window_ms: u64,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    for message in incoming {
        if let Some(pos) = existing.iter().position(|m| m.id == message.id) {
            if existing[pos].sender_id != message.sender_id
                || existing[pos].conversation_id != message.conversation_id
            {
                outcome.conflicts.push(message.id);
            }
            if existing[pos] != message {
                existing[pos] = message;
                reseat(existing, pos);
                outcome.changed = true;
            }
            continue;
        }

        if !message.id.is_provisional()
            && let Some(pos) = correlate_provisional(existing, &message, provisional_window_ms)
        {
            let mut confirmed = message;
            confirmed.delivery = DeliveryState::Confirmed;
            existing[pos] = confirmed;
            reseat(existing, pos);
            outcome.changed = true;
            continue;
        }

        let at = insertion_point(existing, &message);
        existing.insert(at, message.clone());
        outcome.inserted.push(message);
        outcome.changed = true;
    }

    if dedup_by_id(existing) {
        outcome.changed = true;
    }

    outcome
}

/// Re-sort a single entry whose ordering key may have moved.
pub(crate) fn reseat(messages: &mut Vec<Message>, pos: usize) {
    let key = messages[pos].ordering_key();
    let ordered_left = pos == 0 || messages[pos - 1].ordering_key() < key;
    let ordered_right = pos + 1 >= messages.len() || key < messages[pos + 1].ordering_key();
    if ordered_left && ordered_right {
        return;
    }

    let message = messages.remove(pos);
    let at = insertion_point(messages, &message);
    messages.insert(at, message);
}

/// Position a message belongs at under the `(timestamp, id)` order.
pub(crate) fn insertion_point(messages: &[Message], message: &Message) -> usize {
    match messages.binary_search_by(|m| m.ordering_key().cmp(&message.ordering_key())) {
        Ok(pos) | Err(pos) => pos,
    }
}

/// Find the earliest pending provisional entry matching a durable echo of a
/// message this client sent: same sender and content, timestamps within the
/// window.
fn correlate_provisional(existing: &[Message], incoming: &Message, window_ms: u64) -> Option<usize> {
    existing.iter().position(|m| {
        m.id.is_provisional()
            && matches!(m.delivery, DeliveryState::Pending | DeliveryState::Sent)
            && m.sender_id == incoming.sender_id
            && m.content == incoming.content
            && m.timestamp_ms.abs_diff(incoming.timestamp_ms) <= window_ms
    })
}

fn dedup_by_id(messages: &mut Vec<Message>) -> bool {
    let mut seen = HashSet::new();
    let before = messages.len();
    messages.retain(|m| seen.insert(m.id));
    messages.len() != before
}
