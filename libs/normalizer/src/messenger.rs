//! Meta Messenger webhook normalization (`entry[].messaging[]`).

use obx_core::{Channel, InboundEvent};
use serde_json::Value;

use crate::{attachments::map_attachment, str_field, timestamp_or_now};

/// Extracts all inbound events from one Messenger webhook delivery.
/// One delivery may batch several entries and several messaging leaves.
pub fn events(org_id: &str, body: &Value) -> Vec<InboundEvent> {
    let mut out = Vec::new();
    let Some(entries) = body.get("entry").and_then(|v| v.as_array()) else {
        return out;
    };

    for entry in entries {
        let page_id = str_field(entry, "id").unwrap_or_default();
        let Some(messaging) = entry.get("messaging").and_then(|v| v.as_array()) else {
            continue;
        };
        for leaf in messaging {
            if let Some(event) = event_from_leaf(org_id, page_id, leaf) {
                out.push(event);
            }
        }
    }
    out
}

fn event_from_leaf(org_id: &str, page_id: &str, leaf: &Value) -> Option<InboundEvent> {
    let message = leaf.get("message")?;
    let sender_id = leaf
        .get("sender")
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())?;

    // Echoes of our own page sends come back through the same webhook.
    if sender_id == page_id
        || message
            .get("is_echo")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    {
        return None;
    }

    let msg_id = str_field(message, "mid")?.to_string();
    let text = str_field(message, "text").map(|s| s.to_string());
    let attachments = message
        .get("attachments")
        .and_then(|v| v.as_array())
        .map(|list| list.iter().filter_map(map_attachment).collect())
        .unwrap_or_default();

    Some(InboundEvent {
        org_id: org_id.to_string(),
        channel: Channel::Messenger,
        external_account_id: page_id.to_string(),
        external_user_id: sender_id.to_string(),
        external_thread_id: sender_id.to_string(),
        msg_id,
        text,
        attachments,
        timestamp: timestamp_or_now(leaf.get("timestamp")),
        raw: leaf.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery(messaging: Value) -> Value {
        json!({
            "object": "page",
            "entry": [{ "id": "page-1", "time": 1700000000123i64, "messaging": messaging }]
        })
    }

    #[test]
    fn extracts_text_message() {
        let body = delivery(json!([{
            "sender": { "id": "psid-7" },
            "recipient": { "id": "page-1" },
            "timestamp": 1700000000123i64,
            "message": { "mid": "mid.abc", "text": "hi there" }
        }]));
        let events = events("org-1", &body);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.channel, Channel::Messenger);
        assert_eq!(event.external_user_id, "psid-7");
        assert_eq!(event.msg_id, "mid.abc");
        assert_eq!(event.text.as_deref(), Some("hi there"));
        assert_eq!(event.timestamp.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn skips_echoes_and_non_message_leaves() {
        let body = delivery(json!([
            {
                "sender": { "id": "page-1" },
                "message": { "mid": "mid.echo", "text": "our own reply" }
            },
            {
                "sender": { "id": "psid-7" },
                "message": { "mid": "mid.flagged", "is_echo": true, "text": "flagged echo" }
            },
            {
                "sender": { "id": "psid-7" },
                "delivery": { "mids": ["mid.abc"] }
            }
        ]));
        assert!(events("org-1", &body).is_empty());
    }

    #[test]
    fn maps_attachments_through_the_mapper() {
        let body = delivery(json!([{
            "sender": { "id": "psid-7" },
            "timestamp": 1700000000123i64,
            "message": {
                "mid": "mid.att",
                "attachments": [
                    { "type": "image", "payload": { "url": "https://cdn/a.png" } }
                ]
            }
        }]));
        let events = events("org-1", &body);
        assert_eq!(events[0].attachments.len(), 1);
        assert_eq!(
            events[0].attachments[0].remote_url.as_deref(),
            Some("https://cdn/a.png")
        );
    }

    #[test]
    fn duplicates_within_one_batch_are_kept() {
        let leaf = json!({
            "sender": { "id": "psid-7" },
            "message": { "mid": "mid.dup", "text": "again" }
        });
        let body = delivery(json!([leaf.clone(), leaf]));
        assert_eq!(events("org-1", &body).len(), 2);
    }
}
