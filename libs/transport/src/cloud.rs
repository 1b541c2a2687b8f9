//! WhatsApp Cloud API transport (Meta Graph).

use async_trait::async_trait;
use obx_core::{AttachmentDescriptor, AttachmentKind};
use serde_json::{json, Value};
use tracing::debug;

use crate::{MessageTransport, TransportError};

const DEFAULT_API_BASE: &str = "https://graph.facebook.com";
const API_VERSION: &str = "v19.0";

#[derive(Clone)]
pub struct CloudConfig {
    pub api_base: String,
    pub phone_id: String,
    pub token: String,
}

impl CloudConfig {
    /// Reads `WA_PHONE_ID` / `WA_USER_TOKEN` / `WA_API_BASE`; `None` when the
    /// integration is not configured.
    pub fn from_env() -> Option<Self> {
        let phone_id = std::env::var("WA_PHONE_ID").ok().filter(|v| !v.is_empty())?;
        let token = std::env::var("WA_USER_TOKEN").ok().filter(|v| !v.is_empty())?;
        let api_base =
            std::env::var("WA_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        Some(Self {
            api_base,
            phone_id,
            token,
        })
    }
}

pub struct CloudTransport {
    http: reqwest::Client,
    config: CloudConfig,
}

impl CloudTransport {
    pub fn new(http: reqwest::Client, config: CloudConfig) -> Self {
        Self { http, config }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.config.api_base.trim_end_matches('/'),
            API_VERSION,
            self.config.phone_id
        )
    }

    async fn dispatch(&self, payload: Value) -> Result<String, TransportError> {
        let response = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.config.token)
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
        body.get("messages")
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("id"))
            .and_then(|v| v.as_str())
            .map(|id| id.to_string())
            .ok_or(TransportError::MalformedResponse)
    }

    fn media_key(kind: AttachmentKind) -> &'static str {
        match kind {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::Audio => "audio",
            AttachmentKind::File => "document",
        }
    }
}

#[async_trait]
impl MessageTransport for CloudTransport {
    async fn send_text(
        &self,
        to: &str,
        text: &str,
        idempotency_key: &str,
    ) -> Result<String, TransportError> {
        debug!(to = %to, key = %idempotency_key, "cloud text send");
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": { "preview_url": true, "body": text }
        });
        self.dispatch(payload).await
    }

    async fn send_media(
        &self,
        to: &str,
        attachment: &AttachmentDescriptor,
        caption: Option<&str>,
        idempotency_key: &str,
    ) -> Result<String, TransportError> {
        debug!(to = %to, key = %idempotency_key, kind = %attachment.kind.as_str(), "cloud media send");
        let key = Self::media_key(attachment.kind);
        let mut media = json!({ "link": attachment.remote_url });
        if let Some(caption) = caption {
            media["caption"] = json!(caption);
        }
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": key,
            key: media
        });
        self.dispatch(payload).await
    }
}
