//! `email-send` queue: suppression check, provider call, auditable outcome.

use std::sync::Arc;

use async_trait::async_trait;
use obx_store::{AuditStore, MarketingStore};
use obx_transport::is_retryable_status;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{Job, JobError, JobProcessor};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSendPayload {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub org_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// External email delivery collaborator.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), JobError>;
}

/// HTTP email API client (`EMAIL_API_URL` / `EMAIL_API_KEY`).
pub struct RestEmailProvider {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

impl RestEmailProvider {
    pub fn new(http: reqwest::Client, url: String, api_key: String) -> Self {
        Self { http, url, api_key }
    }

    pub fn from_env(http: &reqwest::Client) -> Option<Self> {
        let url = std::env::var("EMAIL_API_URL").ok().filter(|v| !v.is_empty())?;
        let api_key = std::env::var("EMAIL_API_KEY").unwrap_or_default();
        Some(Self::new(http.clone(), url, api_key))
    }
}

#[async_trait]
impl EmailProvider for RestEmailProvider {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), JobError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "to": to, "subject": subject, "html": html }))
            .send()
            .await
            .map_err(|err| JobError::transient("E_EMAIL", err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        if is_retryable_status(status.as_u16()) {
            Err(JobError::transient("E_EMAIL", format!("{status}: {message}")))
        } else {
            Err(JobError::permanent("E_EMAIL", format!("{status}: {message}")))
        }
    }
}

pub struct EmailSendProcessor {
    marketing: Arc<dyn MarketingStore>,
    audit: Arc<dyn AuditStore>,
    provider: Arc<dyn EmailProvider>,
}

impl EmailSendProcessor {
    pub fn new(
        marketing: Arc<dyn MarketingStore>,
        audit: Arc<dyn AuditStore>,
        provider: Arc<dyn EmailProvider>,
    ) -> Self {
        Self {
            marketing,
            audit,
            provider,
        }
    }

    async fn record_outcome(
        &self,
        payload: &EmailSendPayload,
        outcome: &str,
    ) -> Result<(), JobError> {
        self.audit
            .record_event(
                &payload.org_id,
                "email",
                outcome,
                &json!({ "to": payload.to, "subject": payload.subject, "campaignId": payload.campaign_id }),
            )
            .await?;
        if let Some(recipient_id) = &payload.recipient_id {
            self.marketing
                .update_campaign_recipient(&payload.org_id, recipient_id, outcome)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for EmailSendProcessor {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload: EmailSendPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| JobError::permanent("E_PAYLOAD", err))?;

        if self
            .marketing
            .is_suppressed(&payload.org_id, &payload.to)
            .await?
        {
            info!(org = %payload.org_id, to = %payload.to, "recipient suppressed, skipping send");
            self.record_outcome(&payload, "suppressed").await?;
            return Ok(());
        }

        self.provider
            .send(&payload.to, &payload.subject, &payload.html)
            .await?;
        self.record_outcome(&payload, "sent").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obx_store::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::OffsetDateTime;

    struct CountingProvider {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl EmailProvider for CountingProvider {
        async fn send(&self, _to: &str, _subject: &str, _html: &str) -> Result<(), JobError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(payload: serde_json::Value) -> Job {
        Job {
            id: "j-1".into(),
            queue: crate::QueueName::EmailSend,
            payload,
            enqueued_at: OffsetDateTime::UNIX_EPOCH,
            run_at: None,
        }
    }

    fn payload() -> serde_json::Value {
        json!({
            "to": "ana@example.com",
            "subject": "Hi",
            "html": "<p>Hi</p>",
            "orgId": "org-1",
            "recipientId": "rcpt-1"
        })
    }

    #[tokio::test]
    async fn suppressed_recipient_skips_provider_and_records() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_suppression("org-1", "ana@example.com").await;
        store.seed_campaign_recipient("org-1", "rcpt-1").await;
        let provider = Arc::new(CountingProvider {
            sent: AtomicUsize::new(0),
        });
        let processor =
            EmailSendProcessor::new(store.clone(), store.clone(), provider.clone());

        processor.process(&job(payload())).await.unwrap();

        assert_eq!(provider.sent.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.recipient_status("org-1", "rcpt-1").await.as_deref(),
            Some("suppressed")
        );
        let audit = store.audit_events().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].2, "suppressed");
    }

    #[tokio::test]
    async fn clean_recipient_sends_and_updates_row() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_campaign_recipient("org-1", "rcpt-1").await;
        let provider = Arc::new(CountingProvider {
            sent: AtomicUsize::new(0),
        });
        let processor =
            EmailSendProcessor::new(store.clone(), store.clone(), provider.clone());

        processor.process(&job(payload())).await.unwrap();

        assert_eq!(provider.sent.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.recipient_status("org-1", "rcpt-1").await.as_deref(),
            Some("sent")
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_permanent() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(CountingProvider {
            sent: AtomicUsize::new(0),
        });
        let processor = EmailSendProcessor::new(store.clone(), store, provider);
        let err = processor
            .process(&job(json!({ "subject": "missing everything" })))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
