//! `repurpose` queue: derive channel-specific variants from a source post.

use std::sync::Arc;

use async_trait::async_trait;
use obx_store::{ContentStore, SourcePost};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Job, JobError, JobProcessor};

const DEFAULT_MODES: &[&str] = &["story", "email", "video"];
const STORY_LIMIT: usize = 280;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepurposePayload {
    pub post_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modes: Option<Vec<String>>,
}

pub struct RepurposeProcessor {
    content: Arc<dyn ContentStore>,
}

impl RepurposeProcessor {
    pub fn new(content: Arc<dyn ContentStore>) -> Self {
        Self { content }
    }
}

#[async_trait]
impl JobProcessor for RepurposeProcessor {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload: RepurposePayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| JobError::permanent("E_PAYLOAD", err))?;

        let Some(post) = self.content.source_post(&payload.post_id).await? else {
            warn!(post = %payload.post_id, "source post gone, marking job not-found");
            self.content
                .finish_repurpose_job(&payload.post_id, false)
                .await?;
            return Ok(());
        };

        let modes = payload
            .modes
            .unwrap_or_else(|| DEFAULT_MODES.iter().map(|m| m.to_string()).collect());
        for mode in &modes {
            let body = derive_variant(mode, &post);
            self.content
                .insert_derivative(&post.org_id, &post.post_id, mode, &body)
                .await?;
        }
        self.content
            .finish_repurpose_job(&payload.post_id, true)
            .await?;
        info!(post = %payload.post_id, variants = modes.len(), "post repurposed");
        Ok(())
    }
}

/// Channel-specific rewrite of the source material. Unknown modes fall back
/// to the raw body so a new mode never drops content.
fn derive_variant(mode: &str, post: &SourcePost) -> String {
    match mode {
        "story" => {
            let mut body = post.body.clone();
            if body.len() > STORY_LIMIT {
                let cut = body
                    .char_indices()
                    .take_while(|(i, _)| *i < STORY_LIMIT - 1)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(0);
                body.truncate(cut);
                body.push('…');
            }
            format!("{}\n{}", post.title, body)
        }
        "email" => format!(
            "Hi there,\n\n{}\n\nRead more from us soon.\n— {}",
            post.body, post.title
        ),
        "video" => format!(
            "HOOK: {}\nBODY: {}\nCTA: Follow for more.",
            post.title, post.body
        ),
        _ => post.body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obx_store::InMemoryStore;
    use serde_json::json;
    use time::OffsetDateTime;

    fn job(payload: serde_json::Value) -> Job {
        Job {
            id: "j-1".into(),
            queue: crate::QueueName::Repurpose,
            payload,
            enqueued_at: OffsetDateTime::UNIX_EPOCH,
            run_at: None,
        }
    }

    fn post() -> SourcePost {
        SourcePost {
            post_id: "post-1".into(),
            org_id: "org-1".into(),
            title: "Launch week".into(),
            body: "We shipped the new inbox.".into(),
        }
    }

    #[tokio::test]
    async fn derives_default_variants_and_completes() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_post(post()).await;
        let processor = RepurposeProcessor::new(store.clone());

        processor
            .process(&job(json!({ "postId": "post-1" })))
            .await
            .unwrap();

        let derivatives = store.derivatives().await;
        assert_eq!(derivatives.len(), 3);
        let modes: Vec<&str> = derivatives.iter().map(|d| d.2.as_str()).collect();
        assert_eq!(modes, vec!["story", "email", "video"]);
        assert_eq!(
            store.repurpose_status("post-1").await.as_deref(),
            Some("completed")
        );
    }

    #[tokio::test]
    async fn missing_post_marks_not_found() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_repurpose_job("ghost").await;
        let processor = RepurposeProcessor::new(store.clone());

        processor
            .process(&job(json!({ "postId": "ghost" })))
            .await
            .unwrap();

        assert!(store.derivatives().await.is_empty());
        assert_eq!(
            store.repurpose_status("ghost").await.as_deref(),
            Some("not_found")
        );
    }

    #[test]
    fn story_variant_truncates_long_bodies() {
        let mut long_post = post();
        long_post.body = "x".repeat(600);
        let story = derive_variant("story", &long_post);
        assert!(story.len() < 320);
        assert!(story.ends_with('…'));
    }
}
