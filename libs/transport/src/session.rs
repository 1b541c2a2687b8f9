//! Self-hosted WhatsApp session-protocol transport.
//!
//! Talks to a session bridge that keeps a long-lived WhatsApp Web login and
//! exposes a small HTTP surface. The bridge deduplicates on `client_ref`, so
//! the idempotency key rides along on every call.

use async_trait::async_trait;
use obx_core::AttachmentDescriptor;
use serde_json::{json, Value};
use tracing::debug;

use crate::{MessageTransport, TransportError};

#[derive(Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub api_key: String,
}

impl SessionConfig {
    /// Reads `WA_SESSION_BASE` / `WA_SESSION_KEY`; `None` when the bridge is
    /// not configured.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("WA_SESSION_BASE")
            .ok()
            .filter(|v| !v.is_empty())?;
        let api_key = std::env::var("WA_SESSION_KEY").unwrap_or_default();
        Some(Self { base_url, api_key })
    }
}

pub struct SessionTransport {
    http: reqwest::Client,
    config: SessionConfig,
}

impl SessionTransport {
    pub fn new(http: reqwest::Client, config: SessionConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn dispatch(&self, path: &str, payload: Value) -> Result<String, TransportError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .header("x-api-key", &self.config.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response.json().await?;
        body.get("id")
            .or_else(|| body.get("message_id"))
            .and_then(|v| v.as_str())
            .map(|id| id.to_string())
            .ok_or(TransportError::MalformedResponse)
    }
}

#[async_trait]
impl MessageTransport for SessionTransport {
    async fn send_text(
        &self,
        to: &str,
        text: &str,
        idempotency_key: &str,
    ) -> Result<String, TransportError> {
        debug!(to = %to, key = %idempotency_key, "session text send");
        self.dispatch(
            "send/text",
            json!({ "to": to, "text": text, "client_ref": idempotency_key }),
        )
        .await
    }

    async fn send_media(
        &self,
        to: &str,
        attachment: &AttachmentDescriptor,
        caption: Option<&str>,
        idempotency_key: &str,
    ) -> Result<String, TransportError> {
        debug!(to = %to, key = %idempotency_key, "session media send");
        self.dispatch(
            "send/media",
            json!({
                "to": to,
                "url": attachment.remote_url,
                "mime": attachment.mime,
                "kind": attachment.kind.as_str(),
                "caption": caption,
                "client_ref": idempotency_key
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let transport = SessionTransport::new(
            reqwest::Client::new(),
            SessionConfig {
                base_url: "http://bridge:3000/".into(),
                api_key: "k".into(),
            },
        );
        assert_eq!(transport.endpoint("send/text"), "http://bridge:3000/send/text");
    }
}
