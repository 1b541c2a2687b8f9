//! Queue definitions and the enqueue client.
//!
//! All queues live on one JetStream work-queue stream; each queue gets its
//! own subject and durable pull consumer. Enqueue dedup rides on
//! `Nats-Msg-Id`, deferred work on a `run_at` envelope field the harness
//! honors by NAKing until eligible.

use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy},
    Context as JsContext,
};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

pub const JOBS_STREAM: &str = "OBX-JOBS";
const JOBS_SUBJECT_PREFIX: &str = "obx.jobs";

/// The six pipeline queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "email-send")]
    EmailSend,
    #[serde(rename = "content:render")]
    ContentRender,
    #[serde(rename = "billing:renewals")]
    BillingRenewals,
    #[serde(rename = "calendar:tick")]
    CalendarTick,
    #[serde(rename = "repurpose")]
    Repurpose,
    #[serde(rename = "alerts")]
    Alerts,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::EmailSend,
        QueueName::ContentRender,
        QueueName::BillingRenewals,
        QueueName::CalendarTick,
        QueueName::Repurpose,
        QueueName::Alerts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::EmailSend => "email-send",
            QueueName::ContentRender => "content:render",
            QueueName::BillingRenewals => "billing:renewals",
            QueueName::CalendarTick => "calendar:tick",
            QueueName::Repurpose => "repurpose",
            QueueName::Alerts => "alerts",
        }
    }

    /// Subject-safe token (NATS subjects treat `.` as a separator and the
    /// colon reads poorly in stream listings).
    pub fn subject_token(&self) -> &'static str {
        match self {
            QueueName::EmailSend => "email-send",
            QueueName::ContentRender => "content-render",
            QueueName::BillingRenewals => "billing-renewals",
            QueueName::CalendarTick => "calendar-tick",
            QueueName::Repurpose => "repurpose",
            QueueName::Alerts => "alerts",
        }
    }

    pub fn subject(&self) -> String {
        format!("{JOBS_SUBJECT_PREFIX}.{}", self.subject_token())
    }

    /// Per-queue tuning: slots, attempt budget, backoff base.
    pub fn spec(&self) -> QueueSpec {
        let (concurrency, max_attempts, backoff) = match self {
            QueueName::EmailSend => (3, 3, Duration::from_secs(2)),
            QueueName::ContentRender => (2, 3, Duration::from_secs(5)),
            QueueName::BillingRenewals => (1, 3, Duration::from_secs(2)),
            QueueName::CalendarTick => (1, 3, Duration::from_secs(2)),
            QueueName::Repurpose => (2, 3, Duration::from_secs(2)),
            QueueName::Alerts => (3, 2, Duration::from_secs(2)),
        };
        QueueSpec {
            queue: *self,
            concurrency,
            max_attempts,
            backoff_base: backoff,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub queue: QueueName,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl QueueSpec {
    /// Exponential delay before the next attempt: `base * 2^(attempt-1)`,
    /// capped at five minutes.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exp);
        delay.min(Duration::from_secs(300))
    }
}

/// One enqueued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
    /// Earliest eligible execution time for deferred work.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub run_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    /// Stable id for enqueue dedup; two publishes with the same id within
    /// the stream's dedup window yield one job.
    pub dedup_id: Option<String>,
}

/// Enqueue-side client shared by the gateway, scheduler, and tests.
#[derive(Clone)]
pub struct JobQueue {
    js: JsContext,
}

impl JobQueue {
    pub async fn new(js: JsContext) -> Result<Self> {
        ensure_jobs_stream(&js).await?;
        Ok(Self { js })
    }

    pub fn context(&self) -> &JsContext {
        &self.js
    }

    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<Job> {
        let now = OffsetDateTime::now_utc();
        let job = Job {
            id: nanoid!(16),
            queue,
            payload,
            enqueued_at: now,
            run_at: options.delay.map(|d| now + d),
        };

        let mut headers = async_nats::HeaderMap::new();
        let msg_id = options.dedup_id.unwrap_or_else(|| job.id.clone());
        headers.insert("Nats-Msg-Id", msg_id.as_str());

        let bytes = serde_json::to_vec(&job)?;
        self.js
            .publish_with_headers(queue.subject(), headers, bytes.into())
            .await
            .with_context(|| format!("publish job to {}", queue.subject()))?
            .await
            .with_context(|| format!("ack enqueue on {}", queue.subject()))?;

        debug!(queue = %queue.as_str(), job_id = %job.id, delayed = job.run_at.is_some(), "job enqueued");
        Ok(job)
    }
}

pub async fn ensure_jobs_stream(js: &JsContext) -> Result<()> {
    let cfg = StreamConfig {
        name: JOBS_STREAM.into(),
        subjects: vec![format!("{JOBS_SUBJECT_PREFIX}.>")],
        retention: RetentionPolicy::WorkQueue,
        max_messages: -1,
        max_messages_per_subject: -1,
        max_bytes: -1,
        // Wide enough that date-scoped dedup ids collapse restarted
        // scheduler ticks within the same day.
        duplicate_window: Duration::from_secs(24 * 60 * 60),
        description: Some("Omnibox job queues".into()),
        ..StreamConfig::default()
    };
    js.get_or_create_stream(cfg)
        .await
        .context("ensure jobs stream")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subjects_are_stream_scoped() {
        assert_eq!(QueueName::EmailSend.subject(), "obx.jobs.email-send");
        assert_eq!(
            QueueName::ContentRender.subject(),
            "obx.jobs.content-render"
        );
    }

    #[test]
    fn queue_names_roundtrip_serde() {
        for queue in QueueName::ALL {
            let encoded = serde_json::to_string(&queue).unwrap();
            let decoded: QueueName = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, queue);
        }
        assert_eq!(
            serde_json::to_value(QueueName::BillingRenewals).unwrap(),
            json!("billing:renewals")
        );
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let spec = QueueName::EmailSend.spec();
        assert_eq!(spec.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(spec.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(spec.backoff_delay(3), Duration::from_secs(8));
        // Capped.
        assert_eq!(spec.backoff_delay(12), Duration::from_secs(300));
    }

    #[test]
    fn job_envelope_roundtrips_with_run_at() {
        let job = Job {
            id: "abc".into(),
            queue: QueueName::Repurpose,
            payload: json!({"postId": "p-1"}),
            enqueued_at: OffsetDateTime::UNIX_EPOCH,
            run_at: Some(OffsetDateTime::UNIX_EPOCH + time::Duration::hours(1)),
        };
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, job);
    }
}
