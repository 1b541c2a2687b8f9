//! Generic worker harness: one implementation, six queue configurations.
//!
//! Each job execution borrows a database connection from the pool for its
//! own statements only (processors hold the pool, never a connection across
//! jobs). The harness converts processor errors into the retry decision,
//! NAKs deferred work until eligible, and dead-letters after the attempt
//! budget. Abandoned in-flight jobs on hard shutdown are redelivered by the
//! stream; processors are idempotent consumers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::jetstream::{
    consumer::{pull::Config as PullConfig, AckPolicy},
    AckKind, Context as JsContext,
};
use async_trait::async_trait;
use futures::StreamExt;
use obx_telemetry::{record_counter, TelemetryLabels};
use time::OffsetDateTime;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::{DlqPublisher, Job, JobError, QueueSpec, JOBS_STREAM};

/// Domain logic of one queue. Side-effect complete: all DB writes and
/// external calls happen inside `process`, which fails by returning a
/// classified [`JobError`].
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<(), JobError>;
}

/// What the harness does with a failed attempt.
#[derive(Debug, PartialEq)]
pub(crate) enum RetryDecision {
    Retry(Duration),
    DeadLetter,
}

pub(crate) fn decide(err: &JobError, attempt: u32, spec: &QueueSpec) -> RetryDecision {
    if err.is_retryable() && attempt < spec.max_attempts {
        RetryDecision::Retry(spec.backoff_delay(attempt))
    } else {
        RetryDecision::DeadLetter
    }
}

/// Remaining delay before a deferred job becomes eligible.
pub(crate) fn defer_remaining(job: &Job, now: OffsetDateTime) -> Option<Duration> {
    let run_at = job.run_at?;
    if run_at <= now {
        return None;
    }
    let remaining = run_at - now;
    Some(Duration::from_secs_f64(remaining.as_seconds_f64().max(1.0)))
}

pub struct WorkerHarness {
    js: JsContext,
    spec: QueueSpec,
    processor: Arc<dyn JobProcessor>,
    dlq: DlqPublisher,
}

impl WorkerHarness {
    pub fn new(
        js: JsContext,
        spec: QueueSpec,
        processor: Arc<dyn JobProcessor>,
        dlq: DlqPublisher,
    ) -> Self {
        Self {
            js,
            spec,
            processor,
            dlq,
        }
    }

    /// Consumes the queue until `shutdown` flips, then drains in-flight jobs
    /// for up to `drain_timeout`. Returns `true` when the drain completed in
    /// time; the caller decides what a dirty drain costs.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        drain_timeout: Duration,
    ) -> Result<bool> {
        let stream = self
            .js
            .get_stream(JOBS_STREAM)
            .await
            .map_err(|err| anyhow::anyhow!("get jobs stream: {err}"))?;
        let consumer_name = format!("worker-{}", self.spec.queue.subject_token());
        let consumer = stream
            .get_or_create_consumer(
                &consumer_name,
                PullConfig {
                    durable_name: Some(consumer_name.clone()),
                    filter_subject: self.spec.queue.subject(),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: (self.spec.concurrency * 4) as i64,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| anyhow::anyhow!("ensure consumer {consumer_name}: {err}"))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|err| anyhow::anyhow!("attach consumer {consumer_name}: {err}"))?;

        info!(queue = %self.spec.queue.as_str(), concurrency = self.spec.concurrency, "worker started");

        let slots = Arc::new(Semaphore::new(self.spec.concurrency));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished tasks without blocking the pull loop.
            while in_flight.try_join_next().is_some() {}

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                permit = slots.clone().acquire_owned() => {
                    let permit = permit.context("worker semaphore closed")?;
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        next = messages.next() => {
                            let message = match next {
                                Some(Ok(message)) => message,
                                Some(Err(err)) => {
                                    warn!(queue = %self.spec.queue.as_str(), error = %err, "consumer pull error");
                                    continue;
                                }
                                None => break,
                            };
                            let spec = self.spec.clone();
                            let processor = self.processor.clone();
                            let dlq = self.dlq.clone();
                            in_flight.spawn(async move {
                                handle_message(message, &spec, processor.as_ref(), &dlq).await;
                                drop(permit);
                            });
                        }
                    }
                }
            }
        }

        info!(queue = %self.spec.queue.as_str(), "worker draining in-flight jobs");
        let drained = tokio::time::timeout(drain_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                queue = %self.spec.queue.as_str(),
                "drain timeout elapsed, abandoning in-flight jobs to redelivery"
            );
            in_flight.abort_all();
        }
        Ok(drained)
    }
}

async fn handle_message(
    message: async_nats::jetstream::Message,
    spec: &QueueSpec,
    processor: &dyn JobProcessor,
    dlq: &DlqPublisher,
) {
    let queue = spec.queue;
    let labels = TelemetryLabels::new("-").with_queue(queue.as_str());

    let job: Job = match serde_json::from_slice(&message.payload) {
        Ok(job) => job,
        Err(err) => {
            warn!(queue = %queue.as_str(), error = %err, "undecodable job payload dropped");
            let raw = String::from_utf8_lossy(&message.payload).to_string();
            if let Err(dlq_err) = dlq
                .publish(queue, "unknown", 1, "E_DECODE", &err.to_string(), &serde_json::json!({ "raw": raw }))
                .await
            {
                error!(error = %dlq_err, "failed to dead-letter undecodable payload");
            }
            ack(&message, queue).await;
            return;
        }
    };

    if let Some(remaining) = defer_remaining(&job, OffsetDateTime::now_utc()) {
        nak(&message, queue, remaining).await;
        return;
    }

    let attempt = message
        .info()
        .map(|info| info.delivered.max(1) as u32)
        .unwrap_or(1);

    match processor.process(&job).await {
        Ok(()) => {
            record_counter("jobs_completed", 1, &labels);
            ack(&message, queue).await;
        }
        Err(err) => match decide(&err, attempt, spec) {
            RetryDecision::Retry(delay) => {
                warn!(
                    queue = %queue.as_str(),
                    job_id = %job.id,
                    attempt,
                    delay_s = delay.as_secs(),
                    error = %err,
                    "job failed, retrying"
                );
                record_counter("jobs_retried", 1, &labels);
                nak(&message, queue, delay).await;
            }
            RetryDecision::DeadLetter => {
                error!(
                    queue = %queue.as_str(),
                    job_id = %job.id,
                    attempt,
                    error = %err,
                    "job failed permanently"
                );
                if let Err(dlq_err) = dlq
                    .publish(queue, &job.id, attempt, err.code(), &err.to_string(), &job.payload)
                    .await
                {
                    error!(error = %dlq_err, job_id = %job.id, "failed to publish dead letter");
                }
                ack(&message, queue).await;
            }
        },
    }
}

async fn ack(message: &async_nats::jetstream::Message, queue: crate::QueueName) {
    if let Err(err) = message.ack().await {
        warn!(queue = %queue.as_str(), error = %err, "ack failed, job will redeliver");
    }
}

async fn nak(message: &async_nats::jetstream::Message, queue: crate::QueueName, delay: Duration) {
    if let Err(err) = message.ack_with(AckKind::Nak(Some(delay))).await {
        warn!(queue = %queue.as_str(), error = %err, "nak failed, job will redeliver");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueueName;
    use serde_json::json;

    fn job_with_run_at(run_at: Option<OffsetDateTime>) -> Job {
        Job {
            id: "j-1".into(),
            queue: QueueName::Alerts,
            payload: json!({}),
            enqueued_at: OffsetDateTime::UNIX_EPOCH,
            run_at,
        }
    }

    #[test]
    fn transient_errors_retry_until_budget_spent() {
        let spec = QueueName::EmailSend.spec();
        let err = JobError::transient("E_PROVIDER", "503");
        assert_eq!(
            decide(&err, 1, &spec),
            RetryDecision::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            decide(&err, 2, &spec),
            RetryDecision::Retry(Duration::from_secs(4))
        );
        assert_eq!(decide(&err, 3, &spec), RetryDecision::DeadLetter);
    }

    #[test]
    fn permanent_errors_never_retry() {
        let spec = QueueName::EmailSend.spec();
        let err = JobError::permanent("E_PROVIDER", "400");
        assert_eq!(decide(&err, 1, &spec), RetryDecision::DeadLetter);
    }

    #[test]
    fn deferred_job_waits_out_its_delay() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let eligible = job_with_run_at(Some(now - time::Duration::seconds(5)));
        assert_eq!(defer_remaining(&eligible, now), None);

        let deferred = job_with_run_at(Some(now + time::Duration::seconds(90)));
        assert_eq!(
            defer_remaining(&deferred, now),
            Some(Duration::from_secs(90))
        );

        let immediate = job_with_run_at(None);
        assert_eq!(defer_remaining(&immediate, now), None);
    }
}
