use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for surfacing and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Credential rejected; fatal to the push channel, never retried.
    Auth,
    /// Transient transport failure; recovered by reconnect-with-backoff.
    Transport,
    /// Rate-limited by the server.
    RateLimited,
    /// A durable write failed; scoped to the single affected message.
    Delivery,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    /// Construct a new error.
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-connection-transition error.
    pub fn invalid_connection(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_connection_transition",
            format!("cannot run '{action}' while the push channel is {current:?}"),
        )
    }

    /// Whether reconnect/retry may recover from this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::Transport | SyncErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        408 | 429 => SyncErrorCategory::RateLimited,
        400..=499 => SyncErrorCategory::Config,
        500..=599 => SyncErrorCategory::Transport,
        _ => SyncErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), SyncErrorCategory::Auth);
        assert_eq!(classify_http_status(429), SyncErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), SyncErrorCategory::Config);
        assert_eq!(classify_http_status(503), SyncErrorCategory::Transport);
        assert_eq!(classify_http_status(700), SyncErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_connection_error_code_stable() {
        let err = SyncError::invalid_connection(ConnectionState::Disconnected, "established");
        assert_eq!(err.code, "invalid_connection_transition");
        assert_eq!(err.category, SyncErrorCategory::Internal);
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = SyncError::new(SyncErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn only_transport_and_rate_limit_are_recoverable() {
        let transport = SyncError::new(SyncErrorCategory::Transport, "t", "drop");
        let auth = SyncError::new(SyncErrorCategory::Auth, "a", "expired");
        let delivery = SyncError::new(SyncErrorCategory::Delivery, "d", "write failed");

        assert!(transport.is_recoverable());
        assert!(!auth.is_recoverable());
        assert!(!delivery.is_recoverable());
    }
}
