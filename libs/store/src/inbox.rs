//! Ingestion and conversation persistence seam.

use async_trait::async_trait;
use obx_core::{
    AttachmentDescriptor, Channel, InboundEvent, MessageStatus, SenderRole, TransportKind,
};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Result of ingesting one inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub conversation_id: String,
    pub message_id: String,
    /// `true` when the provider redelivered a message we already hold.
    pub duplicate: bool,
}

/// Outcome of the message insert. Duplicate delivery is an explicit branch
/// here, not an error: it is what makes ingestion safe under provider
/// at-least-once redelivery.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(String),
    AlreadyExists(String),
}

impl InsertOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::AlreadyExists(id) => id,
        }
    }
}

/// An outbound message row as recorded by the transport router.
#[derive(Debug, Clone)]
pub struct NewOutboundMessage {
    pub org_id: String,
    pub conversation_id: Option<String>,
    /// Wire destination; used to resolve/create the conversation when no
    /// conversation id was supplied.
    pub to: String,
    pub channel: Channel,
    pub text: String,
    pub attachment: Option<AttachmentDescriptor>,
    pub status: MessageStatus,
    pub sender: SenderRole,
    pub provider_message_id: Option<String>,
    /// Degradation marker, e.g. `service_not_configured`.
    pub note: Option<String>,
}

/// Routing data the transport router needs for a conversation destination.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRoute {
    pub conversation_id: String,
    pub org_id: String,
    pub channel: Channel,
    /// Wire id of the remote party (phone / PSID).
    pub external_user_id: String,
    pub transport: TransportKind,
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Idempotently persists one inbound event: resolves or creates the
    /// contact and conversation, inserts the message, and bumps the
    /// conversation aggregates — all inside a single transaction. Calling
    /// twice with the same `(org, channel, msg_id)` yields the same receipt
    /// with `duplicate = true` and no second aggregate bump.
    async fn ingest(&self, event: &InboundEvent) -> Result<IngestReceipt, StoreError>;

    /// Records an outbound message row and returns its id, resolving the
    /// conversation from `to` when none was supplied.
    async fn record_outbound(&self, message: &NewOutboundMessage) -> Result<String, StoreError>;

    /// Resolves routing data for an existing conversation.
    async fn conversation_route(
        &self,
        org_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationRoute, StoreError>;

    /// Applies a provider delivery receipt to the message carrying this
    /// provider message id. Unknown ids are ignored (receipts can outlive
    /// retention).
    async fn update_message_status(
        &self,
        org_id: &str,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError>;
}
