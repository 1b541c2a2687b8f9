//! Transport selection, fallback persistence, and send idempotency.

use std::collections::HashMap;
use std::sync::Arc;

use obx_core::{
    Channel, Destination, IdempotencyGuard, MessageStatus, OutboundBody, OutboundRequest,
    SendReceipt, SenderRole, TransportKind,
};
use obx_store::{InboxStore, NewOutboundMessage};
use tracing::{info, warn};

use crate::{MessageTransport, TransportError};

pub const NOTE_NOT_CONFIGURED: &str = "service_not_configured";

/// Transport implementations resolved once at startup; no per-call
/// capability probing.
#[derive(Default)]
pub struct TransportRegistry {
    inner: HashMap<TransportKind, Arc<dyn MessageTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: TransportKind, transport: Arc<dyn MessageTransport>) {
        self.inner.insert(kind, transport);
    }

    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn MessageTransport>> {
        self.inner.get(&kind).cloned()
    }

    /// Builds the registry from environment configuration; unset
    /// integrations simply stay unregistered and their sends fall back.
    pub fn from_env(http: &reqwest::Client) -> Self {
        let mut registry = Self::new();
        if let Some(config) = crate::CloudConfig::from_env() {
            registry.register(
                TransportKind::Cloud,
                Arc::new(crate::CloudTransport::new(http.clone(), config)),
            );
        }
        if let Some(config) = crate::SessionConfig::from_env() {
            registry.register(
                TransportKind::Session,
                Arc::new(crate::SessionTransport::new(http.clone(), config)),
            );
        }
        registry
    }
}

pub struct TransportRouter<S: InboxStore> {
    registry: Arc<TransportRegistry>,
    store: Arc<S>,
    guard: IdempotencyGuard,
}

impl<S: InboxStore> TransportRouter<S> {
    pub fn new(registry: Arc<TransportRegistry>, store: Arc<S>, guard: IdempotencyGuard) -> Self {
        Self {
            registry,
            store,
            guard,
        }
    }

    /// Delivers one outbound request and records the outcome.
    ///
    /// A repeated call with an already-claimed idempotency key is a no-op
    /// returning the original message id. Provider failures still record a
    /// `failed` message row (the conversation view matters more than the
    /// send), then surface the error; the key stays unclaimed so the caller
    /// may retry.
    pub async fn send(&self, request: &OutboundRequest) -> Result<SendReceipt, TransportError> {
        let (to, channel, conversation_id, route_transport) = self.resolve(request).await?;
        let kind = request.transport.unwrap_or(route_transport);

        if let Some(original) = self.guard.lookup(&request.idempotency_key).await? {
            info!(key = %request.idempotency_key, message_id = %original, "send replay absorbed");
            return Ok(SendReceipt {
                transport: kind,
                to,
                message_id: original,
                provider_message_id: None,
                note: None,
            });
        }

        let Some(transport) = self.registry.get(kind) else {
            return self
                .record_fallback(request, to, channel, conversation_id, kind)
                .await;
        };

        let outcome = match &request.body {
            OutboundBody::Text(text) => {
                transport
                    .send_text(&to, text, &request.idempotency_key)
                    .await
            }
            OutboundBody::Media { attachment, caption } => {
                transport
                    .send_media(&to, attachment, caption.as_deref(), &request.idempotency_key)
                    .await
            }
        };

        match outcome {
            Ok(provider_message_id) => {
                let message_id = self
                    .store
                    .record_outbound(&self.outbound_row(
                        request,
                        &to,
                        channel,
                        conversation_id,
                        MessageStatus::Sent,
                        Some(provider_message_id.clone()),
                        None,
                    ))
                    .await?;
                self.guard
                    .claim(&request.idempotency_key, &message_id)
                    .await?;
                Ok(SendReceipt {
                    transport: kind,
                    to,
                    message_id,
                    provider_message_id: Some(provider_message_id),
                    note: None,
                })
            }
            Err(err) => {
                warn!(
                    org = %request.org_id,
                    to = %to,
                    transport = %kind.as_str(),
                    error = %err,
                    "outbound send failed"
                );
                self.store
                    .record_outbound(&self.outbound_row(
                        request,
                        &to,
                        channel,
                        conversation_id,
                        MessageStatus::Failed,
                        None,
                        None,
                    ))
                    .await?;
                Err(err)
            }
        }
    }

    async fn resolve(
        &self,
        request: &OutboundRequest,
    ) -> Result<(String, Channel, Option<String>, TransportKind), TransportError> {
        match &request.to {
            Destination::Direct(to) => {
                let kind = request.transport.unwrap_or_default();
                let channel = match kind {
                    TransportKind::Cloud => Channel::WhatsAppCloud,
                    TransportKind::Session => Channel::WhatsAppSession,
                };
                Ok((to.clone(), channel, None, kind))
            }
            Destination::Conversation(conversation_id) => {
                let route = self
                    .store
                    .conversation_route(&request.org_id, conversation_id)
                    .await?;
                Ok((
                    route.external_user_id,
                    route.channel,
                    Some(route.conversation_id),
                    route.transport,
                ))
            }
        }
    }

    async fn record_fallback(
        &self,
        request: &OutboundRequest,
        to: String,
        channel: Channel,
        conversation_id: Option<String>,
        kind: TransportKind,
    ) -> Result<SendReceipt, TransportError> {
        warn!(
            org = %request.org_id,
            transport = %kind.as_str(),
            "no transport configured, recording message without delivery"
        );
        let message_id = self
            .store
            .record_outbound(&self.outbound_row(
                request,
                &to,
                channel,
                conversation_id,
                MessageStatus::Sent,
                None,
                Some(NOTE_NOT_CONFIGURED.to_string()),
            ))
            .await?;
        self.guard
            .claim(&request.idempotency_key, &message_id)
            .await?;
        Ok(SendReceipt {
            transport: kind,
            to,
            message_id,
            provider_message_id: None,
            note: Some(NOTE_NOT_CONFIGURED.to_string()),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn outbound_row(
        &self,
        request: &OutboundRequest,
        to: &str,
        channel: Channel,
        conversation_id: Option<String>,
        status: MessageStatus,
        provider_message_id: Option<String>,
        note: Option<String>,
    ) -> NewOutboundMessage {
        let attachment = match &request.body {
            OutboundBody::Media { attachment, .. } => Some(attachment.clone()),
            OutboundBody::Text(_) => None,
        };
        NewOutboundMessage {
            org_id: request.org_id.clone(),
            conversation_id,
            to: to.to_string(),
            channel,
            text: request.body.display_text(),
            attachment,
            status,
            sender: SenderRole::Agent,
            provider_message_id,
            note,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use obx_core::{AttachmentDescriptor, InMemoryIdemStore, InboundEvent};
    use obx_store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::OffsetDateTime;

    struct FakeTransport {
        calls: AtomicUsize,
        fail_with: Option<u16>,
    }

    impl FakeTransport {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: Some(status),
            }
        }
    }

    #[async_trait]
    impl MessageTransport for FakeTransport {
        async fn send_text(
            &self,
            _to: &str,
            _text: &str,
            _key: &str,
        ) -> Result<String, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(status) => Err(TransportError::Provider {
                    status,
                    message: "simulated".into(),
                }),
                None => Ok(format!("prov-{n}")),
            }
        }

        async fn send_media(
            &self,
            _to: &str,
            _attachment: &AttachmentDescriptor,
            _caption: Option<&str>,
            _key: &str,
        ) -> Result<String, TransportError> {
            self.send_text(_to, "", _key).await
        }
    }

    fn request(key: &str) -> OutboundRequest {
        OutboundRequest {
            org_id: "org-1".into(),
            to: Destination::Direct("521555".into()),
            body: OutboundBody::Text("hello".into()),
            transport: None,
            idempotency_key: key.into(),
        }
    }

    fn router_with(
        registry: TransportRegistry,
        store: Arc<InMemoryStore>,
    ) -> TransportRouter<InMemoryStore> {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryIdemStore::new()), 1);
        TransportRouter::new(Arc::new(registry), store, guard)
    }

    #[tokio::test]
    async fn unconfigured_transport_falls_back_to_persistence() {
        let store = Arc::new(InMemoryStore::new());
        let router = router_with(TransportRegistry::new(), store.clone());

        let receipt = router.send(&request("key-1")).await.unwrap();
        assert_eq!(receipt.note.as_deref(), Some(NOTE_NOT_CONFIGURED));
        assert!(receipt.provider_message_id.is_none());

        let messages = store.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Sent);
        assert_eq!(messages[0].note.as_deref(), Some(NOTE_NOT_CONFIGURED));
    }

    #[tokio::test]
    async fn repeated_key_is_a_noop_retry() {
        let store = Arc::new(InMemoryStore::new());
        let fake = Arc::new(FakeTransport::ok());
        let mut registry = TransportRegistry::new();
        registry.register(TransportKind::Cloud, fake.clone());
        let router = router_with(registry, store.clone());

        let first = router.send(&request("key-1")).await.unwrap();
        let second = router.send(&request("key-1")).await.unwrap();

        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(store.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_records_failed_row_and_allows_retry() {
        let store = Arc::new(InMemoryStore::new());
        let fake = Arc::new(FakeTransport::failing(503));
        let mut registry = TransportRegistry::new();
        registry.register(TransportKind::Cloud, fake.clone());
        let router = router_with(registry, store.clone());

        let err = router.send(&request("key-1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.messages().await[0].status, MessageStatus::Failed);

        // The key was not claimed, so a retry reaches the provider again.
        let _ = router.send(&request("key-1")).await.unwrap_err();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn conversation_destination_uses_channel_transport() {
        let store = Arc::new(InMemoryStore::new());
        let receipt = store
            .ingest(&InboundEvent {
                org_id: "org-1".into(),
                channel: Channel::WhatsAppSession,
                external_account_id: "acct".into(),
                external_user_id: "521777".into(),
                external_thread_id: "521777".into(),
                msg_id: "m-1".into(),
                text: Some("hi".into()),
                attachments: Vec::new(),
                timestamp: OffsetDateTime::now_utc(),
                raw: serde_json::json!({}),
            })
            .await
            .unwrap();

        let session = Arc::new(FakeTransport::ok());
        let cloud = Arc::new(FakeTransport::ok());
        let mut registry = TransportRegistry::new();
        registry.register(TransportKind::Session, session.clone());
        registry.register(TransportKind::Cloud, cloud.clone());
        let router = router_with(registry, store.clone());

        let sent = router
            .send(&OutboundRequest {
                org_id: "org-1".into(),
                to: Destination::Conversation(receipt.conversation_id),
                body: OutboundBody::Text("reply".into()),
                transport: None,
                idempotency_key: "key-9".into(),
            })
            .await
            .unwrap();

        assert_eq!(sent.transport, TransportKind::Session);
        assert_eq!(sent.to, "521777");
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cloud.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn explicit_transport_overrides_route() {
        let store = Arc::new(InMemoryStore::new());
        let session = Arc::new(FakeTransport::ok());
        let mut registry = TransportRegistry::new();
        registry.register(TransportKind::Session, session.clone());
        let router = router_with(registry, store.clone());

        let mut req = request("key-2");
        req.transport = Some(TransportKind::Session);
        let receipt = router.send(&req).await.unwrap();
        assert_eq!(receipt.transport, TransportKind::Session);
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
    }
}
