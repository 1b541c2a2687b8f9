//! HTTP surface: webhook verification/delivery, outbound sends, RSVP links.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use nanoid::nanoid;
use obx_core::{
    AttachmentDescriptor, Destination, OutboundBody, OutboundRequest, TransportKind,
};
use obx_normalizer::{instagram, messenger, whatsapp};
use obx_store::{AuditStore, CalendarStore, InboxStore, RsvpAction, StoreError};
use obx_telemetry::{record_counter, TelemetryLabels};
use obx_transport::{TransportError, TransportRouter};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::{sanitize::sanitize_payload, security::verify_meta_signature};

/// Everything the gateway needs from persistence.
pub trait GatewayStore: InboxStore + AuditStore + CalendarStore {}
impl<T: InboxStore + AuditStore + CalendarStore> GatewayStore for T {}

#[derive(Clone)]
pub struct WebhookSecrets {
    pub verify_token: String,
    pub app_secret: String,
}

impl WebhookSecrets {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            verify_token: std::env::var("META_VERIFY_TOKEN")
                .map_err(|_| anyhow::anyhow!("META_VERIFY_TOKEN required"))?,
            app_secret: std::env::var("META_APP_SECRET")
                .map_err(|_| anyhow::anyhow!("META_APP_SECRET required"))?,
        })
    }
}

pub struct AppState<S>
where
    S: GatewayStore + Send + Sync + 'static,
{
    pub store: Arc<S>,
    pub router: Arc<TransportRouter<S>>,
    pub secrets: Arc<WebhookSecrets>,
}

impl<S> Clone for AppState<S>
where
    S: GatewayStore + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            router: self.router.clone(),
            secrets: self.secrets.clone(),
        }
    }
}

pub fn app<S>(state: AppState<S>) -> Router
where
    S: GatewayStore + Send + Sync + 'static,
{
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/webhooks/{provider}/{org}",
            get(verify::<S>).post(receive::<S>),
        )
        .route("/send", post(send::<S>))
        .route("/rsvp/{token}", get(rsvp::<S>))
        .with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum WebhookProvider {
    Messenger,
    Instagram,
    WhatsApp,
}

impl WebhookProvider {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "messenger" => Some(WebhookProvider::Messenger),
            "instagram" => Some(WebhookProvider::Instagram),
            "whatsapp" => Some(WebhookProvider::WhatsApp),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            WebhookProvider::Messenger => "messenger",
            WebhookProvider::Instagram => "instagram",
            WebhookProvider::WhatsApp => "whatsapp",
        }
    }
}

async fn healthz() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct VerifyQs {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    token: Option<String>,
}

async fn verify<S>(
    State(state): State<AppState<S>>,
    Path((provider, _org)): Path<(String, String)>,
    Query(q): Query<VerifyQs>,
) -> impl IntoResponse
where
    S: GatewayStore + Send + Sync + 'static,
{
    if WebhookProvider::parse(&provider).is_none() {
        return (StatusCode::NOT_FOUND, String::new());
    }
    if q.mode.as_deref() == Some("subscribe")
        && q.token.as_deref() == Some(state.secrets.verify_token.as_str())
    {
        (StatusCode::OK, q.challenge.unwrap_or_default())
    } else {
        (StatusCode::FORBIDDEN, "forbidden".to_string())
    }
}

async fn receive<S>(
    State(state): State<AppState<S>>,
    Path((provider, org)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode
where
    S: GatewayStore + Send + Sync + 'static,
{
    let Some(provider) = WebhookProvider::parse(&provider) else {
        return StatusCode::NOT_FOUND;
    };

    if !verify_meta_signature(&state.secrets.app_secret, &headers, &body) {
        warn!(provider = %provider.as_str(), org = %org, "invalid webhook signature");
        return StatusCode::UNAUTHORIZED;
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            warn!(provider = %provider.as_str(), org = %org, error = %err, "undecodable webhook body dropped");
            return StatusCode::BAD_REQUEST;
        }
    };

    // Acknowledge before doing any real work; a slow database must never
    // turn into a provider retry storm.
    tokio::spawn(process_webhook(state, provider, org, payload));
    StatusCode::OK
}

async fn process_webhook<S>(
    state: AppState<S>,
    provider: WebhookProvider,
    org: String,
    payload: Value,
) where
    S: GatewayStore + Send + Sync + 'static,
{
    let clean = sanitize_payload(&payload);
    if let Err(err) = state
        .store
        .record_event(&org, provider.as_str(), "webhook", &clean)
        .await
    {
        error!(org = %org, error = %err, "failed to persist audit copy");
    }

    let events = match provider {
        WebhookProvider::Messenger => messenger::events(&org, &payload),
        WebhookProvider::Instagram => instagram::events(&org, &payload),
        WebhookProvider::WhatsApp => whatsapp::events(&org, &payload),
    };

    for event in events {
        let labels = TelemetryLabels::new(&event.org_id).with_channel(event.channel.as_str());
        match state.store.ingest(&event).await {
            Ok(receipt) if receipt.duplicate => {
                record_counter("ingest_duplicates", 1, &labels);
            }
            Ok(receipt) => {
                record_counter("messages_ingressed", 1, &labels);
                info!(
                    org = %event.org_id,
                    channel = %event.channel.as_str(),
                    conversation = %receipt.conversation_id,
                    msg_id = %event.msg_id,
                    "message ingested"
                );
            }
            Err(err) => {
                error!(
                    org = %event.org_id,
                    channel = %event.channel.as_str(),
                    msg_id = %event.msg_id,
                    error = %err,
                    "ingest failed, event dropped"
                );
            }
        }
    }

    if provider == WebhookProvider::WhatsApp {
        for receipt in whatsapp::receipts(&org, &payload) {
            if let Err(err) = state
                .store
                .update_message_status(&org, &receipt.provider_message_id, receipt.status)
                .await
            {
                error!(org = %org, error = %err, "receipt update failed");
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendBody {
    org_id: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    media: Option<AttachmentDescriptor>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    transport: Option<String>,
}

async fn send<S>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(body): Json<SendBody>,
) -> impl IntoResponse
where
    S: GatewayStore + Send + Sync + 'static,
{
    let to = match (&body.to, &body.conversation_id) {
        (Some(to), _) => Destination::Direct(to.clone()),
        (None, Some(conversation_id)) => Destination::Conversation(conversation_id.clone()),
        (None, None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "error": "missing destination" })),
            );
        }
    };

    let outbound_body = match (&body.text, &body.media) {
        (Some(text), None) => OutboundBody::Text(text.clone()),
        (None, Some(media)) => OutboundBody::Media {
            attachment: media.clone(),
            caption: body.caption.clone(),
        },
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "error": "exactly one of text or media required" })),
            );
        }
    };

    let transport = match body.transport.as_deref() {
        None => None,
        Some(raw) => match TransportKind::parse(raw) {
            Some(kind) => Some(kind),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "ok": false, "error": format!("unknown transport {raw}") })),
                );
            }
        },
    };

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| nanoid!(21));

    let request = OutboundRequest {
        org_id: body.org_id,
        to,
        body: outbound_body,
        transport,
        idempotency_key,
    };

    match state.router.send(&request).await {
        Ok(receipt) => {
            let mut response = json!({
                "ok": true,
                "transport": receipt.transport.as_str(),
                "to": receipt.to,
                "messageId": receipt.message_id,
            });
            if let Some(note) = receipt.note {
                response["note"] = json!(note);
            }
            (StatusCode::OK, Json(response))
        }
        Err(TransportError::Store(StoreError::NotFound { entity, id })) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error": format!("{entity} not found: {id}") })),
        ),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "ok": false, "error": err.to_string() })),
        ),
    }
}

#[derive(Deserialize)]
struct RsvpQs {
    action: Option<String>,
}

async fn rsvp<S>(
    State(state): State<AppState<S>>,
    Path(token): Path<String>,
    Query(q): Query<RsvpQs>,
) -> impl IntoResponse
where
    S: GatewayStore + Send + Sync + 'static,
{
    let Some(action) = q.action.as_deref().and_then(RsvpAction::parse) else {
        return (
            StatusCode::BAD_REQUEST,
            "action must be confirm or cancel".to_string(),
        );
    };

    match state.store.apply_rsvp(&token, action).await {
        Ok(event_id) => {
            info!(event = %event_id, action = %action.as_str(), "rsvp applied");
            let word = match action {
                RsvpAction::Confirm => "confirmed",
                RsvpAction::Cancel => "canceled",
            };
            (
                StatusCode::OK,
                format!("Thanks, your appointment is {word}."),
            )
        }
        Err(StoreError::TokenConsumed(_)) => (
            StatusCode::CONFLICT,
            "This link was already used.".to_string(),
        ),
        Err(StoreError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, "Unknown link.".to_string())
        }
        Err(err) => {
            error!(error = %err, "rsvp failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong.".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use hmac::Mac;
    use http_body_util::BodyExt;
    use obx_core::{IdempotencyGuard, InMemoryIdemStore};
    use obx_store::{InMemoryStore, MemCalendarEvent};
    use obx_transport::TransportRegistry;
    use time::{Duration, OffsetDateTime};
    use tower::ServiceExt;

    const APP_SECRET: &str = "app-secret";

    fn test_state() -> (AppState<InMemoryStore>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let router = Arc::new(TransportRouter::new(
            Arc::new(TransportRegistry::new()),
            store.clone(),
            IdempotencyGuard::new(Arc::new(InMemoryIdemStore::new()), 1),
        ));
        (
            AppState {
                store: store.clone(),
                router,
                secrets: Arc::new(WebhookSecrets {
                    verify_token: "verify-me".into(),
                    app_secret: APP_SECRET.into(),
                }),
            },
            store,
        )
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(APP_SECRET.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn messenger_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "messaging": [{
                    "sender": { "id": "psid-9" },
                    "timestamp": 1700000000000i64,
                    "message": { "mid": "mid.1", "text": "hello" }
                }]
            }]
        }))
        .unwrap()
    }

    async fn wait_for_messages(store: &InMemoryStore, expected: usize) -> bool {
        for _ in 0..50 {
            if store.messages().await.len() == expected {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        store.messages().await.len() == expected
    }

    #[tokio::test]
    async fn verification_echoes_challenge() {
        let (state, _) = test_state();
        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/webhooks/messenger/org-1?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=12345")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"12345");
    }

    #[tokio::test]
    async fn verification_rejects_wrong_token() {
        let (state, _) = test_state();
        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/webhooks/messenger/org-1?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn tampered_body_is_rejected_and_nothing_ingested() {
        let (state, store) = test_state();
        let body = messenger_body();
        let signature = sign(&body);
        let mut tampered = body.clone();
        let last = tampered.len() - 2;
        tampered[last] ^= 1;

        let response = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/messenger/org-1")
                    .header("content-type", "application/json")
                    .header("X-Hub-Signature-256", signature)
                    .body(Body::from(tampered))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(store.messages().await.is_empty());
        assert!(store.audit_events().await.is_empty());
    }

    #[tokio::test]
    async fn signed_delivery_acks_then_ingests() {
        let (state, store) = test_state();
        let body = messenger_body();
        let signature = sign(&body);

        let response = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/messenger/org-1")
                    .header("content-type", "application/json")
                    .header("X-Hub-Signature-256", signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(wait_for_messages(&store, 1).await);
        let messages = store.messages().await;
        assert_eq!(messages[0].external_id.as_deref(), Some("mid.1"));

        let audit = store.audit_events().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].1, "messenger");
    }

    #[tokio::test]
    async fn redelivered_webhook_does_not_duplicate() {
        let (state, store) = test_state();
        let body = messenger_body();
        let signature = sign(&body);
        let app = app(state);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/webhooks/messenger/org-1")
                        .header("content-type", "application/json")
                        .header("X-Hub-Signature-256", signature.clone())
                        .body(Body::from(body.clone()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert!(wait_for_messages(&store, 1).await);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.messages().await.len(), 1);
        assert_eq!(store.conversations().await[0].unread_count, 1);
    }

    #[tokio::test]
    async fn send_requires_destination() {
        let (state, _) = test_state();
        let response = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/send")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&json!({ "orgId": "org-1", "text": "hi" })).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let payload: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload["ok"], false);
    }

    #[tokio::test]
    async fn unconfigured_send_reports_fallback_note() {
        let (state, store) = test_state();
        let response = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/send")
                    .header("content-type", "application/json")
                    .header("Idempotency-Key", "send-1")
                    .body(Body::from(
                        serde_json::to_vec(&json!({
                            "orgId": "org-1",
                            "to": "521555",
                            "text": "hi"
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let payload: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["note"], "service_not_configured");
        assert_eq!(store.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn rsvp_link_confirms_once() {
        let (state, store) = test_state();
        store
            .seed_calendar_event(MemCalendarEvent {
                id: "evt-1".into(),
                org_id: "org-1".into(),
                contact_name: "Ana".into(),
                contact_phone: Some("521555".into()),
                summary: "Consult".into(),
                start_at: OffsetDateTime::now_utc() + Duration::hours(1),
                rsvp_status: "pending".into(),
                rsvp_token: None,
                reminder_sent_at: None,
                noshow_at: None,
                canceled_at: None,
            })
            .await;
        let token = store.ensure_rsvp_token("evt-1").await.unwrap();
        let app = app(state);

        let ok = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/rsvp/{token}?action=confirm"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let again = app
            .oneshot(
                Request::builder()
                    .uri(format!("/rsvp/{token}?action=cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);
    }
}
