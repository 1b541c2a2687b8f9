//! `content:render` queue: external generation call plus asset writeback.

use std::sync::Arc;

use async_trait::async_trait;
use obx_store::ContentStore;
use obx_transport::is_retryable_status;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::{Job, JobError, JobProcessor};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRenderPayload {
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedAsset {
    pub url: String,
    pub metadata: Value,
}

/// External generation collaborator.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn render(&self, prompt: &str) -> Result<RenderedAsset, JobError>;
}

/// HTTP generation API client (`CONTENT_API_URL` / `CONTENT_API_KEY`).
pub struct RestGenerationProvider {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl RestGenerationProvider {
    pub fn new(http: reqwest::Client, url: String, api_key: String) -> Self {
        Self { http, url, api_key }
    }

    pub fn from_env(http: &reqwest::Client) -> Option<Self> {
        let url = std::env::var("CONTENT_API_URL")
            .ok()
            .filter(|v| !v.is_empty())?;
        let api_key = std::env::var("CONTENT_API_KEY").unwrap_or_default();
        Some(Self::new(http.clone(), url, api_key))
    }
}

#[async_trait]
impl GenerationProvider for RestGenerationProvider {
    async fn render(&self, prompt: &str) -> Result<RenderedAsset, JobError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|err| JobError::transient("E_RENDER", err))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return if is_retryable_status(status.as_u16()) {
                Err(JobError::transient("E_RENDER", format!("{status}: {message}")))
            } else {
                Err(JobError::permanent("E_RENDER", format!("{status}: {message}")))
            };
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| JobError::transient("E_RENDER", err))?;
        let url = body
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JobError::permanent("E_RENDER", "response missing asset url"))?
            .to_string();
        let metadata = body.get("metadata").cloned().unwrap_or(Value::Null);
        Ok(RenderedAsset { url, metadata })
    }
}

pub struct ContentRenderProcessor {
    content: Arc<dyn ContentStore>,
    generator: Arc<dyn GenerationProvider>,
}

impl ContentRenderProcessor {
    pub fn new(content: Arc<dyn ContentStore>, generator: Arc<dyn GenerationProvider>) -> Self {
        Self { content, generator }
    }
}

#[async_trait]
impl JobProcessor for ContentRenderProcessor {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload: ContentRenderPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| JobError::permanent("E_PAYLOAD", err))?;

        let prompt = payload
            .prompt
            .clone()
            .unwrap_or_else(|| format!("render asset {}", payload.asset_id));
        let rendered = self.generator.render(&prompt).await?;
        self.content
            .complete_asset(&payload.asset_id, &rendered.url, &rendered.metadata)
            .await?;
        info!(asset = %payload.asset_id, url = %rendered.url, "asset rendered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obx_store::InMemoryStore;
    use time::OffsetDateTime;

    struct FixedGenerator;

    #[async_trait]
    impl GenerationProvider for FixedGenerator {
        async fn render(&self, prompt: &str) -> Result<RenderedAsset, JobError> {
            Ok(RenderedAsset {
                url: "https://cdn/asset.png".into(),
                metadata: json!({ "prompt": prompt }),
            })
        }
    }

    fn job(payload: Value) -> Job {
        Job {
            id: "j-1".into(),
            queue: crate::QueueName::ContentRender,
            payload,
            enqueued_at: OffsetDateTime::UNIX_EPOCH,
            run_at: None,
        }
    }

    #[tokio::test]
    async fn writes_url_and_metadata_back() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_asset("asset-1").await;
        let processor = ContentRenderProcessor::new(store.clone(), Arc::new(FixedGenerator));

        processor
            .process(&job(json!({ "assetId": "asset-1", "prompt": "sunset" })))
            .await
            .unwrap();

        let (url, metadata) = store.asset("asset-1").await.unwrap();
        assert_eq!(url, "https://cdn/asset.png");
        assert_eq!(metadata["prompt"], "sunset");
    }

    #[tokio::test]
    async fn missing_asset_row_is_permanent() {
        let store = Arc::new(InMemoryStore::new());
        let processor = ContentRenderProcessor::new(store, Arc::new(FixedGenerator));
        let err = processor
            .process(&job(json!({ "assetId": "ghost" })))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
