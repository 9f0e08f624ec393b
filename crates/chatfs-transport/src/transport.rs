//! The chat-service verbs the engine requires, and an HTTP-backed
//! implementation against a Discord-REST-shaped attachment API.
//!
//! The rest of the workspace only ever talks to a `dyn ChatTransport`. This
//! is the one seam where a different chat backend could be swapped in.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

const API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("rate limited, retry after {retry_after_secs:.1}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("channel {0} is not a text channel")]
    NotATextChannel(u64),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("chat service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("timed out waiting for the transport to become ready")]
    ReadyTimeout,
}

impl TransportError {
    /// The HTTP status backing this error, if any. Used by the throttler
    /// to distinguish a 429 from every other kind of failure.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. }) || self.http_status() == Some(429)
    }
}

/// The durable reference returned by a successful upload: enough to
/// reconstruct a [`chatfs_core::ChunkRef`] once the caller supplies the
/// chunk's index, size, and CRC.
#[derive(Debug, Clone)]
pub struct AttachmentRef {
    pub message_id: u64,
    pub attachment_url: String,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn connect(&self, token: &str) -> Result<(), TransportError>;
    async fn await_ready(&self, timeout: std::time::Duration) -> Result<(), TransportError>;
    async fn resolve_channel(&self, channel_id: u64) -> Result<(), TransportError>;
    async fn send_file_attachment(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<AttachmentRef, TransportError>;
    async fn get_message(&self, message_id: u64) -> Result<(), TransportError>;
    async fn delete_message(&self, message_id: u64) -> Result<(), TransportError>;
}

#[derive(Deserialize)]
struct ChannelInfo {
    #[serde(rename = "type")]
    kind: u8,
}

#[derive(Deserialize)]
struct MessageResponse {
    id: String,
    attachments: Vec<AttachmentInfo>,
}

#[derive(Deserialize)]
struct AttachmentInfo {
    url: String,
}

/// Text-channel type code in the Discord channel-type enumeration.
const CHANNEL_TYPE_GUILD_TEXT: u8 = 0;

/// Attachment-API-backed transport. Holds a bot token and a resolved
/// channel id; every call after `connect`/`resolve_channel` targets that
/// channel.
pub struct HttpChatTransport {
    client: Client,
    token: parking_lot::RwLock<Option<String>>,
    channel_id: AtomicU64,
    ready: AtomicBool,
    base_url: String,
}

impl HttpChatTransport {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            token: parking_lot::RwLock::new(None),
            channel_id: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            base_url: API_BASE.to_string(),
        }
    }

    #[must_use]
    pub fn with_base_url(client: Client, base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), ..Self::new(client) }
    }

    fn auth_header(&self) -> Result<String, TransportError> {
        let token = self.token.read();
        match token.as_ref() {
            Some(t) => Ok(format!("Bot {t}")),
            None => Err(TransportError::NotConnected),
        }
    }

    fn channel_url(&self, path: &str) -> Result<String, TransportError> {
        let channel_id = self.channel_id.load(Ordering::Relaxed);
        if channel_id == 0 {
            return Err(TransportError::NotConnected);
        }
        Ok(format!("{}/channels/{channel_id}{path}", self.base_url))
    }

    async fn map_error_response(resp: reqwest::Response) -> TransportError {
        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(1.0);
            return TransportError::RateLimited { retry_after_secs };
        }
        let body = resp.text().await.unwrap_or_default();
        TransportError::Status { status, body }
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    #[instrument(skip(self, token))]
    async fn connect(&self, token: &str) -> Result<(), TransportError> {
        *self.token.write() = Some(token.to_string());
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn await_ready(&self, timeout: std::time::Duration) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.ready.load(Ordering::Acquire) {
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::ReadyTimeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resolve_channel(&self, channel_id: u64) -> Result<(), TransportError> {
        let auth = self.auth_header()?;
        let url = format!("{}/channels/{channel_id}", self.base_url);
        let resp = self.client.get(&url).header("Authorization", auth).send().await?;
        if !resp.status().is_success() {
            return Err(Self::map_error_response(resp).await);
        }
        let info: ChannelInfo = resp.json().await?;
        if info.kind != CHANNEL_TYPE_GUILD_TEXT {
            return Err(TransportError::NotATextChannel(channel_id));
        }
        self.channel_id.store(channel_id, Ordering::Relaxed);
        Ok(())
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn send_file_attachment(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<AttachmentRef, TransportError> {
        let auth = self.auth_header()?;
        let url = self.channel_url("/messages")?;

        let payload_json = serde_json::json!({ "content": "\u{1F4CE}" }).to_string();
        let form = reqwest::multipart::Form::new()
            .text("payload_json", payload_json)
            .part("files[0]", reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string()));

        let resp = self.client.post(&url).header("Authorization", auth).multipart(form).send().await?;
        if !resp.status().is_success() {
            return Err(Self::map_error_response(resp).await);
        }
        let message: MessageResponse = resp.json().await?;
        let attachment =
            message.attachments.into_iter().next().ok_or_else(|| TransportError::Status {
                status: 200,
                body: "response carried no attachment".to_string(),
            })?;
        let message_id: u64 = message
            .id
            .parse()
            .map_err(|_| TransportError::Status { status: 200, body: "non-numeric message id".to_string() })?;
        Ok(AttachmentRef { message_id, attachment_url: attachment.url })
    }

    #[instrument(skip(self))]
    async fn get_message(&self, message_id: u64) -> Result<(), TransportError> {
        let auth = self.auth_header()?;
        let url = self.channel_url(&format!("/messages/{message_id}"))?;
        let resp = self.client.get(&url).header("Authorization", auth).send().await?;
        if !resp.status().is_success() {
            return Err(Self::map_error_response(resp).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_message(&self, message_id: u64) -> Result<(), TransportError> {
        let auth = self.auth_header()?;
        let url = self.channel_url(&format!("/messages/{message_id}"))?;
        let resp = self.client.delete(&url).header("Authorization", auth).send().await?;
        if !resp.status().is_success() {
            return Err(Self::map_error_response(resp).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_before_connect_fail_with_not_connected() {
        let transport = HttpChatTransport::new(Client::new());
        let err = transport.resolve_channel(1).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn connect_marks_the_transport_ready() {
        let transport = HttpChatTransport::new(Client::new());
        transport.connect("fake-token").await.unwrap();
        transport.await_ready(std::time::Duration::from_millis(100)).await.unwrap();
    }

    #[test]
    fn rate_limited_error_reports_http_status_429() {
        let err = TransportError::RateLimited { retry_after_secs: 1.0 };
        assert_eq!(err.http_status(), Some(429));
        assert!(err.is_rate_limited());
    }

    #[test]
    fn non_rate_limit_status_is_not_flagged_as_rate_limited() {
        let err = TransportError::Status { status: 500, body: String::new() };
        assert!(!err.is_rate_limited());
    }
}
