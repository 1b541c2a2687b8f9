//! `alerts` queue: generic fire-and-log notification sink.

use std::sync::Arc;

use async_trait::async_trait;
use obx_store::AuditStore;
use serde::Deserialize;
use tracing::info;

use crate::{Job, JobError, JobProcessor};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertFields {
    #[serde(default)]
    org_id: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

pub struct AlertsProcessor {
    audit: Arc<dyn AuditStore>,
}

impl AlertsProcessor {
    pub fn new(audit: Arc<dyn AuditStore>) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl JobProcessor for AlertsProcessor {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let fields: AlertFields =
            serde_json::from_value(job.payload.clone()).unwrap_or(AlertFields {
                org_id: None,
                kind: None,
            });
        let org = fields.org_id.as_deref().unwrap_or("-");
        let kind = fields.kind.as_deref().unwrap_or("alert");

        info!(org = %org, kind = %kind, payload = %job.payload, "alert");
        self.audit
            .record_event(org, "alerts", kind, &job.payload)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obx_store::InMemoryStore;
    use serde_json::json;
    use time::OffsetDateTime;

    #[tokio::test]
    async fn records_alert_with_defaults() {
        let store = Arc::new(InMemoryStore::new());
        let processor = AlertsProcessor::new(store.clone());

        processor
            .process(&Job {
                id: "j-1".into(),
                queue: crate::QueueName::Alerts,
                payload: json!({ "kind": "quota", "orgId": "org-1", "detail": "80%" }),
                enqueued_at: OffsetDateTime::UNIX_EPOCH,
                run_at: None,
            })
            .await
            .unwrap();

        let audit = store.audit_events().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].0, "org-1");
        assert_eq!(audit[0].2, "quota");
    }
}
