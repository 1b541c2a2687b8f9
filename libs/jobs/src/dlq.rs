//! Dead-letter publication for jobs that exhausted their retry budget.

use anyhow::{Context, Result};
use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy},
    Context as JsContext,
};
use obx_telemetry::{record_counter, TelemetryLabels};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::info;

use crate::QueueName;

const DLQ_STREAM: &str = "OBX-DLQ";
const DLQ_SUBJECT_PREFIX: &str = "obx.dlq";
const DLQ_KEEP_PER_QUEUE: i64 = 1_000;

/// Payload stored for each dead-lettered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub queue: String,
    pub job_id: String,
    pub attempts: u32,
    pub code: String,
    pub message: String,
    pub ts: String,
    pub payload: Value,
}

#[derive(Clone)]
pub struct DlqPublisher {
    js: JsContext,
    enabled: bool,
}

impl DlqPublisher {
    pub async fn new(js: JsContext) -> Result<Self> {
        let enabled = std::env::var("OBX_DLQ_ENABLED")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        ensure_dlq_stream(&js).await?;
        Ok(Self { js, enabled })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn publish(
        &self,
        queue: QueueName,
        job_id: &str,
        attempts: u32,
        code: &str,
        message: &str,
        payload: &Value,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let record = DeadLetter {
            queue: queue.as_str().to_string(),
            job_id: job_id.to_string(),
            attempts,
            code: code.to_string(),
            message: message.to_string(),
            ts: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into()),
            payload: payload.clone(),
        };

        let subject = format!("{DLQ_SUBJECT_PREFIX}.{}", queue.subject_token());
        let bytes = serde_json::to_vec(&record)?;
        self.js
            .publish(subject.clone(), bytes.into())
            .await
            .with_context(|| format!("publish dead letter to {subject}"))?
            .await
            .with_context(|| format!("ack dead letter on {subject}"))?;

        let mut labels = TelemetryLabels::new("-").with_queue(queue.as_str());
        labels.extra.push(("code".into(), record.code.clone()));
        record_counter("jobs_dead_lettered", 1, &labels);
        info!(
            queue = %record.queue,
            job_id = %record.job_id,
            attempts = record.attempts,
            code = %record.code,
            "job dead-lettered"
        );
        Ok(())
    }
}

async fn ensure_dlq_stream(js: &JsContext) -> Result<()> {
    let cfg = StreamConfig {
        name: DLQ_STREAM.into(),
        subjects: vec![format!("{DLQ_SUBJECT_PREFIX}.>")],
        retention: RetentionPolicy::Limits,
        max_messages_per_subject: DLQ_KEEP_PER_QUEUE,
        description: Some("Omnibox dead letters".into()),
        ..StreamConfig::default()
    };
    js.get_or_create_stream(cfg)
        .await
        .context("ensure DLQ stream")?;
    Ok(())
}
