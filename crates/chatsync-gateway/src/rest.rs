use std::{
    sync::{PoisonError, RwLock},
    time::Duration,
};

use serde::de::DeserializeOwned;
use url::Url;

use chatsync_core::{
    Conversation, Message, MessageKind, SyncError, SyncErrorCategory, classify_http_status,
};

use crate::{
    config::GatewayConfig,
    wire::{ConversationDto, CreateConversationBody, MessageDto, SendMessageBody},
};

/// Client for the durable REST path of the marketplace API.
///
/// The credential token is supplied with the `Connect` command and attached
/// as a bearer header to every request from then on.
#[derive(Debug)]
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    local_user_id: i64,
    token: RwLock<Option<String>>,
}

impl RestClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, SyncError> {
        let base = Url::parse(&config.api_base_url).map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Config,
                "invalid_api_url",
                format!("invalid REST base url '{}': {err}", config.api_base_url),
            )
        })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .map_err(|err| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "http_client_build_error",
                    err.to_string(),
                )
            })?;

        Ok(Self {
            http,
            base,
            local_user_id: config.local_user_id,
            token: RwLock::new(None),
        })
    }

    /// Install the credential used for subsequent requests.
    pub fn set_token(&self, token: impl Into<String>) {
        *self
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    /// `GET /conversations`
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        let url = self.endpoint(&["conversations"])?;
        let dtos: Vec<ConversationDto> = self.get_json(url).await?;
        Ok(dtos
            .into_iter()
            .map(|dto| dto.into_conversation(self.local_user_id))
            .collect())
    }

    /// `GET /conversations/{id}/messages` — full history fetch.
    pub async fn list_messages(&self, conversation_id: i64) -> Result<Vec<Message>, SyncError> {
        let url = self.endpoint(&[
            "conversations",
            &conversation_id.to_string(),
            "messages",
        ])?;
        let dtos: Vec<MessageDto> = self.get_json(url).await?;
        Ok(dtos.into_iter().map(MessageDto::into_message).collect())
    }

    /// `POST /conversations/{id}/messages` — the durable write.
    pub async fn send_message(
        &self,
        conversation_id: i64,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message, SyncError> {
        let url = self.endpoint(&[
            "conversations",
            &conversation_id.to_string(),
            "messages",
        ])?;
        let dto: MessageDto = self
            .post_json(
                url,
                &SendMessageBody {
                    content,
                    message_type: kind,
                },
            )
            .await?;
        Ok(dto.into_message())
    }

    /// `POST /conversations` — returns the existing conversation when one
    /// with the peer already exists.
    pub async fn create_conversation(&self, participant_id: i64) -> Result<Conversation, SyncError> {
        let url = self.endpoint(&["conversations"])?;
        let dto: ConversationDto = self
            .post_json(url, &CreateConversationBody { participant_id })
            .await?;
        Ok(dto.into_conversation(self.local_user_id))
    }

    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                SyncError::new(
                    SyncErrorCategory::Config,
                    "invalid_api_url",
                    format!("REST base url '{}' cannot hold paths", self.base),
                )
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SyncError> {
        let mut request = self.http.get(url);
        if let Some(token) = self.token_snapshot() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_request_error)?;
        decode(response).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: Url,
        body: &impl serde::Serialize,
    ) -> Result<T, SyncError> {
        let mut request = self.http.post(url).json(body);
        if let Some(token) = self.token_snapshot() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_request_error)?;
        decode(response).await
    }

    fn token_snapshot(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SyncError> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        let mut err = SyncError::new(
            classify_http_status(status.as_u16()),
            "http_error",
            format!("{status}: {}", truncate(&body, 200)),
        );
        if let Some(seconds) = retry_after {
            err = err.with_retry_after(Duration::from_secs(seconds));
        }
        return Err(err);
    }

    response.json().await.map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Serialization,
            "decode_error",
            err.to_string(),
        )
    })
}

fn map_request_error(err: reqwest::Error) -> SyncError {
    let code = if err.is_timeout() {
        "request_timeout"
    } else if err.is_connect() {
        "connect_failed"
    } else {
        "request_failed"
    };
    SyncError::new(SyncErrorCategory::Transport, code, err.to_string())
}

fn truncate(body: &str, limit: usize) -> &str {
    match body.char_indices().nth(limit) {
        Some((at, _)) => &body[..at],
        None => body,
    }
}
