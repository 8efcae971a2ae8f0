use std::time::Duration as StdDuration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const API_BASE_ENV: &str = "MAILFEED_API_BASE_URL";
const TOKEN_URL_ENV: &str = "MAILFEED_TOKEN_URL";
const CLIENT_ID_ENV: &str = "MAILFEED_CLIENT_ID";
const CLIENT_SECRET_ENV: &str = "MAILFEED_CLIENT_SECRET";
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const HISTORY_PAGE_SIZE: usize = 100;
const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("history cursor no longer valid")]
    CursorExpired,

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("api request failed: status={status} body={body}")]
    Api { status: u16, body: String },

    #[error("http request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

// --- Wire types ---

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: Option<String>,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailboxProfile {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "historyId")]
    pub history_id: String,
}

/// A `(provider message id, provider thread id)` pair from a sync call.
/// Ephemeral: consumed by the fetch step, never persisted.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageList {
    pub messages: Option<Vec<MessageRef>>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    pub result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryList {
    pub history: Option<Vec<HistoryRecord>>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "historyId")]
    pub history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    #[serde(rename = "messagesAdded")]
    pub messages_added: Option<Vec<HistoryMessageAdded>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryMessageAdded {
    pub message: MessageRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: Option<String>,
    #[serde(rename = "labelIds")]
    pub label_ids: Option<Vec<String>>,
    pub snippet: Option<String>,
    pub payload: MessagePart,
    #[serde(rename = "internalDate")]
    pub internal_date: Option<String>,
}

/// One node of the MIME tree: a leaf with inline body data, an attachment
/// with an out-of-line content reference, or a container with child parts.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub headers: Option<Vec<MessageHeader>>,
    pub body: Option<PartBody>,
    pub parts: Option<Vec<MessagePart>>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartBody {
    pub size: Option<u64>,
    pub data: Option<String>,
    #[serde(rename = "attachmentId")]
    pub attachment_id: Option<String>,
}

// --- Provider trait ---

#[async_trait(?Send)]
pub trait MailProvider {
    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, ProviderError>;

    async fn get_profile(&self, access_token: &str) -> Result<MailboxProfile, ProviderError>;

    async fn list_history(
        &self,
        access_token: &str,
        start_cursor: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryList, ProviderError>;

    async fn list_recent_messages(
        &self,
        access_token: &str,
        max_results: usize,
    ) -> Result<MessageList, ProviderError>;

    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<RawMessage, ProviderError>;
}

// --- HTTP implementation ---

#[derive(Debug, Clone)]
pub struct HttpMailProvider {
    client: Client,
    api_base: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpMailProvider {
    /// Build a provider from `MAILFEED_CLIENT_ID` / `MAILFEED_CLIENT_SECRET`,
    /// with endpoint overrides from `MAILFEED_API_BASE_URL` and
    /// `MAILFEED_TOKEN_URL`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let client_id = require_env(CLIENT_ID_ENV)?;
        let client_secret = require_env(CLIENT_SECRET_ENV)?;
        Ok(Self::new(
            optional_env(API_BASE_ENV).unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            optional_env(TOKEN_URL_ENV).unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            client_id,
            client_secret,
        ))
    }

    pub fn new(
        api_base: String,
        token_url: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token_url,
            client_id,
            client_secret,
        }
    }

    async fn fetch_with_retry(&self, token: &str, url: &str) -> Result<String, ProviderError> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .client
                .get(url)
                .bearer_auth(token)
                .header("accept", "application/json")
                .send()
                .await?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ProviderError::RateLimited(redact_response_body(&body)));
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(ProviderError::Api {
                    status: status.as_u16(),
                    body: redact_response_body(&body),
                });
            }

            return Ok(body);
        }

        Err(ProviderError::RateLimited(
            "request failed without response".to_string(),
        ))
    }
}

#[async_trait(?Send)]
impl MailProvider for HttpMailProvider {
    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, ProviderError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::TokenRefresh(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::TokenRefresh(e.to_string()))?;
        if !status.is_success() {
            return Err(ProviderError::TokenRefresh(format!(
                "status={} body={}",
                status,
                redact_response_body(&body)
            )));
        }

        serde_json::from_str(&body).map_err(|e| ProviderError::TokenRefresh(e.to_string()))
    }

    async fn get_profile(&self, access_token: &str) -> Result<MailboxProfile, ProviderError> {
        let url = format!("{}/users/me/profile", self.api_base);
        let body = self.fetch_with_retry(access_token, &url).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn list_history(
        &self,
        access_token: &str,
        start_cursor: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryList, ProviderError> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={start_cursor}&historyTypes=messageAdded&maxResults={HISTORY_PAGE_SIZE}",
            self.api_base
        );
        if let Some(pt) = page_token {
            url.push_str(&format!("&pageToken={pt}"));
        }

        // A rejected cursor comes back as 404; callers fall back to full sync.
        match self.fetch_with_retry(access_token, &url).await {
            Ok(body) => Ok(serde_json::from_str(&body)?),
            Err(ProviderError::Api { status: 404, .. }) => Err(ProviderError::CursorExpired),
            Err(other) => Err(other),
        }
    }

    async fn list_recent_messages(
        &self,
        access_token: &str,
        max_results: usize,
    ) -> Result<MessageList, ProviderError> {
        let url = format!(
            "{}/users/me/messages?maxResults={max_results}",
            self.api_base
        );
        let body = self.fetch_with_retry(access_token, &url).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<RawMessage, ProviderError> {
        let url = format!("{}/users/me/messages/{message_id}?format=full", self.api_base);
        let body = self.fetch_with_retry(access_token, &url).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn require_env(name: &str) -> Result<String, ProviderError> {
    optional_env(name).ok_or_else(|| ProviderError::TokenRefresh(format!("missing {name}")))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        format!(
            "{}…[truncated {} bytes]",
            &trimmed[..REDACTED_BODY_MAX_LEN],
            trimmed.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{redact_response_body, HistoryList, MessageList, RawMessage, TokenResponse};

    #[test]
    fn token_response_deserializes() {
        let payload = r#"{"access_token":"ya29.abc","token_type":"Bearer","expires_in":3600}"#;
        let decoded: TokenResponse =
            serde_json::from_str(payload).expect("decode token response");
        assert_eq!(decoded.access_token, "ya29.abc");
        assert_eq!(decoded.expires_in, 3600);
    }

    #[test]
    fn history_list_collects_message_added_records() {
        let payload = json!({
            "history": [
                {
                    "id": "101",
                    "messagesAdded": [
                        { "message": { "id": "m1", "threadId": "t1" } }
                    ]
                },
                { "id": "102" }
            ],
            "historyId": "105"
        });

        let list: HistoryList =
            serde_json::from_value(payload).expect("decode history list");
        assert_eq!(list.history_id, "105");
        let records = list.history.expect("history records");
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].messages_added.as_ref().expect("added")[0].message.id,
            "m1"
        );
        assert!(records[1].messages_added.is_none());
    }

    #[test]
    fn message_list_tolerates_empty_mailbox() {
        let payload = json!({ "resultSizeEstimate": 0 });
        let list: MessageList =
            serde_json::from_value(payload).expect("decode message list");
        assert!(list.messages.is_none());
    }

    #[test]
    fn raw_message_deserializes_nested_parts() {
        let payload = json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX"],
            "snippet": "hi",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [{ "name": "Subject", "value": "Hi" }],
                "body": { "size": 0 },
                "parts": [
                    {
                        "mimeType": "text/plain",
                        "body": { "size": 2, "data": "aGk" }
                    },
                    {
                        "mimeType": "application/pdf",
                        "filename": "report.pdf",
                        "body": { "size": 100, "attachmentId": "att-1" }
                    }
                ]
            },
            "internalDate": "1735732800000"
        });

        let message: RawMessage =
            serde_json::from_value(payload).expect("decode raw message");
        let parts = message.payload.parts.expect("parts");
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[1].body.as_ref().expect("body").attachment_id.as_deref(),
            Some("att-1")
        );
    }

    #[test]
    fn long_response_bodies_are_truncated() {
        let long = "x".repeat(500);
        let redacted = redact_response_body(&long);
        assert!(redacted.len() < long.len());
        assert!(redacted.contains("truncated 500 bytes"));
    }
}
