//! Background job queues for the Omnibox pipeline.
//!
//! Six named queues share one JetStream work-queue stream and one generic
//! worker harness; each queue is a thin configuration object plus a
//! [`JobProcessor`] implementation. The harness owns the retry decision:
//! transient failures are NAKed with exponential backoff until the attempt
//! budget is spent, then dead-lettered; permanent failures (malformed
//! payloads, non-retryable provider responses) are dead-lettered at once
//! since retrying cannot fix them.

use thiserror::Error;

pub mod dlq;
pub mod processors;
pub mod queue;
pub mod scheduler;
pub mod sweeps;
pub mod worker;

pub use dlq::{DeadLetter, DlqPublisher};
pub use queue::{EnqueueOptions, Job, JobQueue, QueueName, QueueSpec, JOBS_STREAM};
pub use scheduler::Scheduler;
pub use sweeps::{NoShowSweep, ReminderDispatch, SweepConfig};
pub use worker::{JobProcessor, WorkerHarness};

/// Failure classification a processor reports to the harness.
#[derive(Debug, Error)]
pub enum JobError {
    /// Worth retrying: network hiccups, provider 5xx, DB contention.
    #[error("{code}: {message}")]
    Transient { code: String, message: String },
    /// Retrying cannot help: malformed payload, provider 4xx, missing rows.
    #[error("{code}: {message}")]
    Permanent { code: String, message: String },
}

impl JobError {
    pub fn transient(code: impl Into<String>, message: impl std::fmt::Display) -> Self {
        JobError::Transient {
            code: code.into(),
            message: message.to_string(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl std::fmt::Display) -> Self {
        JobError::Permanent {
            code: code.into(),
            message: message.to_string(),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            JobError::Transient { code, .. } | JobError::Permanent { code, .. } => code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transient { .. })
    }
}

impl From<obx_store::StoreError> for JobError {
    fn from(err: obx_store::StoreError) -> Self {
        match err {
            obx_store::StoreError::Database(inner) => JobError::transient("E_DB", inner),
            other => JobError::permanent("E_STORE", other),
        }
    }
}

impl From<obx_transport::TransportError> for JobError {
    fn from(err: obx_transport::TransportError) -> Self {
        if err.is_retryable() {
            JobError::transient("E_TRANSPORT", err)
        } else {
            JobError::permanent("E_TRANSPORT", err)
        }
    }
}
