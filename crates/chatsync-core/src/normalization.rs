use crate::{
    error::SyncError,
    types::{MessageId, SendAck, SyncEvent},
};

/// Outcome of a durable send before normalization into an ack event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Durable write succeeded and produced a final id.
    Success { message_id: MessageId },
    /// Durable write failed with error details.
    Failure { error: SyncError },
}

/// Convert a send outcome to a stable `SyncEvent::SendAck`.
pub fn normalize_send_outcome(client_txn_id: impl Into<String>, outcome: SendOutcome) -> SyncEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        SendOutcome::Success { message_id } => SyncEvent::SendAck(SendAck {
            client_txn_id,
            message_id: Some(message_id),
            error_code: None,
        }),
        SendOutcome::Failure { error } => SyncEvent::SendAck(SendAck {
            client_txn_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Convert an error into a `FatalError` sync event.
pub fn normalize_fatal_error(error: SyncError) -> SyncEvent {
    let recoverable = error.is_recoverable();
    SyncEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncErrorCategory;

    #[test]
    fn maps_success_to_send_ack() {
        let event = normalize_send_outcome(
            "txn-1",
            SendOutcome::Success {
                message_id: MessageId::Final(42),
            },
        );

        match event {
            SyncEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-1");
                assert_eq!(ack.message_id, Some(MessageId::Final(42)));
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failure_to_send_ack_with_stable_error_code() {
        let event = normalize_send_outcome(
            "txn-2",
            SendOutcome::Failure {
                error: SyncError::new(SyncErrorCategory::Delivery, "send_failed", "boom"),
            },
        );

        match event {
            SyncEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-2");
                assert_eq!(ack.message_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("send_failed"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn fatal_error_keeps_recoverability_of_the_category() {
        let transient = SyncError::new(SyncErrorCategory::Transport, "drop", "lost");
        match normalize_fatal_error(transient) {
            SyncEvent::FatalError { recoverable, .. } => assert!(recoverable),
            other => panic!("unexpected event: {other:?}"),
        }

        let fatal = SyncError::new(SyncErrorCategory::Auth, "expired", "token expired");
        match normalize_fatal_error(fatal) {
            SyncEvent::FatalError { recoverable, .. } => assert!(!recoverable),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
