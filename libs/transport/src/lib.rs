//! Outbound transport abstraction for the messaging pipeline.
//!
//! A [`MessageTransport`] is a concrete delivery mechanism satisfying the
//! `{send_text, send_media}` capability set. Implementations are registered
//! once at startup in a [`TransportRegistry`]; the [`TransportRouter`]
//! resolves the right one per send and falls back to recording the message
//! as pending-delivery when none is configured, so the conversation view
//! stays consistent even with incomplete integration.

use async_trait::async_trait;
use obx_core::AttachmentDescriptor;
use thiserror::Error;

pub mod cloud;
pub mod router;
pub mod session;

pub use cloud::{CloudConfig, CloudTransport};
pub use router::{TransportRegistry, TransportRouter};
pub use session::{SessionConfig, SessionTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("transport request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider response missing message id")]
    MalformedResponse,
    #[error(transparent)]
    Store(#[from] obx_store::StoreError),
    #[error(transparent)]
    Idempotency(#[from] obx_core::IdemError),
}

impl TransportError {
    /// Whether a retry can plausibly succeed. Client errors other than
    /// timeout/too-early/rate-limit cannot be fixed by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Provider { status, .. } => is_retryable_status(*status),
            TransportError::Http(err) => err.is_timeout() || err.is_connect(),
            TransportError::MalformedResponse => false,
            TransportError::Store(_) | TransportError::Idempotency(_) => false,
        }
    }
}

/// Retry classification for provider HTTP statuses.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..600).contains(&status)
}

/// Capability set every concrete transport satisfies. Both calls return the
/// provider-assigned message id.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send_text(
        &self,
        to: &str,
        text: &str,
        idempotency_key: &str,
    ) -> Result<String, TransportError>;

    async fn send_media(
        &self,
        to: &str,
        attachment: &AttachmentDescriptor,
        caption: Option<&str>,
        idempotency_key: &str,
    ) -> Result<String, TransportError>;
}
