use serde::{Deserialize, Serialize};
use url::Url;

use chatsync_core::{
    DEFAULT_PROVISIONAL_MATCH_WINDOW_MS, RetryPolicy, SyncError, SyncErrorCategory,
};

/// Reconnect backoff tuning for the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 8,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.base_delay_ms, self.max_delay_ms, self.max_attempts)
    }
}

/// Runtime configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the REST API, for example `https://api.example.org/api`.
    pub api_base_url: String,
    /// Push-channel URL, for example `wss://api.example.org/ws/chat/`.
    pub ws_url: String,
    /// Id of the locally authenticated user.
    pub local_user_id: i64,
    /// Per-request timeout for the REST client.
    pub request_timeout_ms: u64,
    /// Command channel buffer size.
    pub command_buffer: usize,
    /// Event channel buffer size.
    pub event_buffer: usize,
    /// Correlation window for matching durable echoes against provisional
    /// messages.
    pub provisional_match_window_ms: u64,
    /// Push-channel reconnect backoff.
    pub retry: RetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".to_owned(),
            ws_url: "ws://localhost:8000/ws/chat/".to_owned(),
            local_user_id: 0,
            request_timeout_ms: 10_000,
            command_buffer: 128,
            event_buffer: 512,
            provisional_match_window_ms: DEFAULT_PROVISIONAL_MATCH_WINDOW_MS,
            retry: RetryConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden from process environment variables.
    ///
    /// Recognized: `CHATSYNC_API_URL`, `CHATSYNC_WS_URL`, `CHATSYNC_USER_ID`,
    /// `CHATSYNC_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from a key/value lookup (environment in production).
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(value) = get("CHATSYNC_API_URL").filter(|v| !v.trim().is_empty()) {
            self.api_base_url = value;
        }
        if let Some(value) = get("CHATSYNC_WS_URL").filter(|v| !v.trim().is_empty()) {
            self.ws_url = value;
        }
        if let Some(value) = get("CHATSYNC_USER_ID").and_then(|v| v.parse().ok()) {
            self.local_user_id = value;
        }
        if let Some(value) = get("CHATSYNC_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.request_timeout_ms = value;
        }
    }

    /// Reject configurations the runtime cannot start with.
    pub fn validate(&self) -> Result<(), SyncError> {
        Url::parse(&self.api_base_url).map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Config,
                "invalid_api_url",
                format!("invalid REST base url '{}': {err}", self.api_base_url),
            )
        })?;

        let ws = Url::parse(&self.ws_url).map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Config,
                "invalid_ws_url",
                format!("invalid push-channel url '{}': {err}", self.ws_url),
            )
        })?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "invalid_ws_url",
                format!("push-channel url must use ws:// or wss://, got '{ws}'"),
            ));
        }

        if self.local_user_id <= 0 {
            return Err(SyncError::new(
                SyncErrorCategory::Config,
                "local_user_id_unset",
                "local_user_id must be a positive user id",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> GatewayConfig {
        GatewayConfig {
            local_user_id: 1,
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn default_config_validates_once_a_user_is_set() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_missing_local_user() {
        let err = GatewayConfig::default()
            .validate()
            .expect_err("unset user must fail");
        assert_eq!(err.code, "local_user_id_unset");
    }

    #[test]
    fn rejects_non_websocket_push_url() {
        let mut config = valid();
        config.ws_url = "http://localhost:8000/ws/chat/".to_owned();
        let err = config.validate().expect_err("http scheme must fail");
        assert_eq!(err.code, "invalid_ws_url");
    }

    #[test]
    fn rejects_unparseable_api_url() {
        let mut config = valid();
        config.api_base_url = "not a url".to_owned();
        let err = config.validate().expect_err("garbage url must fail");
        assert_eq!(err.code, "invalid_api_url");
    }

    #[test]
    fn overrides_are_applied_from_the_lookup() {
        let mut config = GatewayConfig::default();
        config.apply_overrides(|key| match key {
            "CHATSYNC_API_URL" => Some("https://api.example.org/api".to_owned()),
            "CHATSYNC_WS_URL" => Some("wss://api.example.org/ws/chat/".to_owned()),
            "CHATSYNC_USER_ID" => Some("42".to_owned()),
            _ => None,
        });

        assert_eq!(config.api_base_url, "https://api.example.org/api");
        assert_eq!(config.ws_url, "wss://api.example.org/ws/chat/");
        assert_eq!(config.local_user_id, 42);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_overrides_keep_defaults() {
        let mut config = GatewayConfig::default();
        config.apply_overrides(|key| match key {
            "CHATSYNC_USER_ID" => Some("not-a-number".to_owned()),
            "CHATSYNC_API_URL" => Some("   ".to_owned()),
            _ => None,
        });

        assert_eq!(config.local_user_id, 0);
        assert_eq!(config.api_base_url, GatewayConfig::default().api_base_url);
    }
}
