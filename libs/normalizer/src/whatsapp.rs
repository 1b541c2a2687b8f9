//! WhatsApp Cloud API webhook normalization
//! (`entry[].changes[].value.messages[]` plus `statuses[]` receipts).

use obx_core::{Channel, InboundEvent, MessageStatus};
use serde_json::Value;

use crate::{attachments::map_attachment, str_field, timestamp_or_now, StatusReceipt};

const MEDIA_KEYS: &[&str] = &["image", "video", "audio", "document", "sticker"];

pub fn events(org_id: &str, body: &Value) -> Vec<InboundEvent> {
    let mut out = Vec::new();
    for value in change_values(body) {
        let phone_id = value
            .get("metadata")
            .and_then(|m| m.get("phone_number_id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let Some(messages) = value.get("messages").and_then(|v| v.as_array()) else {
            continue;
        };
        for message in messages {
            if let Some(event) = event_from_message(org_id, phone_id, message) {
                out.push(event);
            }
        }
    }
    out
}

/// Extracts delivery/read receipts from the `statuses[]` array of the same
/// webhook shape. Unknown status literals are dropped.
pub fn receipts(org_id: &str, body: &Value) -> Vec<StatusReceipt> {
    let mut out = Vec::new();
    for value in change_values(body) {
        let Some(statuses) = value.get("statuses").and_then(|v| v.as_array()) else {
            continue;
        };
        for status in statuses {
            let Some(provider_message_id) = str_field(status, "id") else {
                continue;
            };
            let Some(parsed) = str_field(status, "status").and_then(MessageStatus::from_receipt)
            else {
                continue;
            };
            out.push(StatusReceipt {
                org_id: org_id.to_string(),
                provider_message_id: provider_message_id.to_string(),
                status: parsed,
                recipient_id: str_field(status, "recipient_id").map(|s| s.to_string()),
            });
        }
    }
    out
}

fn change_values(body: &Value) -> impl Iterator<Item = &Value> {
    body.get("entry")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("changes").and_then(|v| v.as_array()))
        .flatten()
        .filter_map(|change| change.get("value"))
}

fn event_from_message(org_id: &str, phone_id: &str, message: &Value) -> Option<InboundEvent> {
    let from = str_field(message, "from")?.to_string();
    let msg_id = str_field(message, "id")?.to_string();

    let text = message
        .get("text")
        .and_then(|t| t.get("body"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut attachments = Vec::new();
    let mut caption = None;
    for key in MEDIA_KEYS {
        if let Some(media) = message.get(*key) {
            if let Some(mut descriptor) = map_attachment(media) {
                if descriptor.kind == obx_core::AttachmentKind::File && *key != "document" {
                    if let Some(kind) = obx_core::AttachmentKind::parse(key) {
                        descriptor.kind = kind;
                    }
                }
                attachments.push(descriptor);
            }
            caption = caption.or_else(|| {
                media
                    .get("caption")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            });
        }
    }

    Some(InboundEvent {
        org_id: org_id.to_string(),
        channel: Channel::WhatsAppCloud,
        external_account_id: phone_id.to_string(),
        external_user_id: from.clone(),
        external_thread_id: from,
        msg_id,
        text: text.or(caption),
        attachments,
        timestamp: timestamp_or_now(message.get("timestamp")),
        raw: message.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery(value: Value) -> Value {
        json!({ "object": "whatsapp_business_account", "entry": [{ "id": "waba-1", "changes": [{ "field": "messages", "value": value }] }] })
    }

    #[test]
    fn extracts_text_message() {
        let body = delivery(json!({
            "metadata": { "phone_number_id": "phone-1" },
            "contacts": [{ "wa_id": "521555", "profile": { "name": "Ana" } }],
            "messages": [{
                "from": "521555",
                "id": "wamid.1",
                "timestamp": "1700000000",
                "type": "text",
                "text": { "body": "hola" }
            }]
        }));
        let events = events("org-1", &body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, Channel::WhatsAppCloud);
        assert_eq!(events[0].external_account_id, "phone-1");
        assert_eq!(events[0].msg_id, "wamid.1");
        assert_eq!(events[0].text.as_deref(), Some("hola"));
    }

    #[test]
    fn media_message_without_url_still_maps_kind_and_mime() {
        let body = delivery(json!({
            "metadata": { "phone_number_id": "phone-1" },
            "messages": [{
                "from": "521555",
                "id": "wamid.2",
                "timestamp": "1700000000",
                "type": "audio",
                "audio": { "id": "media-9", "mime_type": "audio/ogg; codecs=opus" }
            }]
        }));
        let events = events("org-1", &body);
        assert_eq!(events[0].attachments.len(), 1);
        assert_eq!(
            events[0].attachments[0].kind,
            obx_core::AttachmentKind::Audio
        );
        assert!(events[0].attachments[0].remote_url.is_none());
    }

    #[test]
    fn caption_becomes_text_fallback() {
        let body = delivery(json!({
            "metadata": { "phone_number_id": "phone-1" },
            "messages": [{
                "from": "521555",
                "id": "wamid.3",
                "timestamp": "1700000000",
                "type": "image",
                "image": { "id": "media-1", "mime_type": "image/jpeg", "caption": "receipt photo" }
            }]
        }));
        let events = events("org-1", &body);
        assert_eq!(events[0].text.as_deref(), Some("receipt photo"));
    }

    #[test]
    fn receipts_map_status_literals() {
        let body = delivery(json!({
            "metadata": { "phone_number_id": "phone-1" },
            "statuses": [
                { "id": "wamid.9", "status": "delivered", "recipient_id": "521555" },
                { "id": "wamid.9", "status": "warmup" }
            ]
        }));
        let receipts = receipts("org-1", &body);
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].status, MessageStatus::Delivered);
        assert_eq!(receipts[0].recipient_id.as_deref(), Some("521555"));
    }
}
