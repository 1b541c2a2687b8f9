//! `calendar:tick` queue: per-organization birthday automation.

use std::sync::Arc;

use async_trait::async_trait;
use obx_store::MarketingStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Job, JobError, JobProcessor};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarTickPayload {
    pub org_id: String,
}

pub struct CalendarTickProcessor {
    marketing: Arc<dyn MarketingStore>,
}

impl CalendarTickProcessor {
    pub fn new(marketing: Arc<dyn MarketingStore>) -> Self {
        Self { marketing }
    }
}

#[async_trait]
impl JobProcessor for CalendarTickProcessor {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload: CalendarTickPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| JobError::permanent("E_PAYLOAD", err))?;

        if !self
            .marketing
            .birthday_automation_enabled(&payload.org_id)
            .await?
        {
            debug!(org = %payload.org_id, "birthday automation disabled, tick skipped");
            return Ok(());
        }

        match self
            .marketing
            .schedule_birthday_campaign(&payload.org_id)
            .await?
        {
            Some(campaign_id) => {
                info!(org = %payload.org_id, campaign = %campaign_id, "birthday campaign scheduled");
            }
            None => {
                debug!(org = %payload.org_id, "no birthdays today");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obx_store::InMemoryStore;
    use serde_json::json;
    use time::OffsetDateTime;

    fn tick(org: &str) -> Job {
        Job {
            id: "j-1".into(),
            queue: crate::QueueName::CalendarTick,
            payload: json!({ "orgId": org }),
            enqueued_at: OffsetDateTime::UNIX_EPOCH,
            run_at: None,
        }
    }

    #[tokio::test]
    async fn schedules_campaign_when_enabled_and_due() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_birthday_automation("org-1", true).await;
        let processor = CalendarTickProcessor::new(store.clone());

        processor.process(&tick("org-1")).await.unwrap();
        assert_eq!(store.campaigns().await.len(), 1);
    }

    #[tokio::test]
    async fn disabled_automation_skips() {
        let store = Arc::new(InMemoryStore::new());
        let processor = CalendarTickProcessor::new(store.clone());

        processor.process(&tick("org-2")).await.unwrap();
        assert!(store.campaigns().await.is_empty());
    }
}
