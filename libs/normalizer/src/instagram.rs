//! Instagram webhook normalization.
//!
//! Instagram DMs arrive in two shapes depending on the subscription: the
//! `entry[].changes[].value.messages[]` form and the Messenger-style
//! `entry[].messaging[]` form. Both are accepted here.

use obx_core::{Channel, InboundEvent};
use serde_json::Value;

use crate::{attachments::map_attachment, str_field, timestamp_or_now};

pub fn events(org_id: &str, body: &Value) -> Vec<InboundEvent> {
    let mut out = Vec::new();
    let Some(entries) = body.get("entry").and_then(|v| v.as_array()) else {
        return out;
    };

    for entry in entries {
        let account_id = str_field(entry, "id").unwrap_or_default();

        if let Some(changes) = entry.get("changes").and_then(|v| v.as_array()) {
            for change in changes {
                let Some(value) = change.get("value") else {
                    continue;
                };
                let Some(messages) = value.get("messages").and_then(|v| v.as_array()) else {
                    continue;
                };
                for message in messages {
                    if let Some(event) = event_from_change_message(org_id, account_id, message) {
                        out.push(event);
                    }
                }
            }
        }

        if let Some(messaging) = entry.get("messaging").and_then(|v| v.as_array()) {
            for leaf in messaging {
                if let Some(event) = event_from_messaging_leaf(org_id, account_id, leaf) {
                    out.push(event);
                }
            }
        }
    }
    out
}

fn event_from_change_message(org_id: &str, account_id: &str, message: &Value) -> Option<InboundEvent> {
    let from = str_field(message, "from")
        .or_else(|| {
            message
                .get("from")
                .and_then(|f| f.get("id"))
                .and_then(|v| v.as_str())
        })?
        .to_string();
    if from == account_id {
        return None;
    }
    let msg_id = str_field(message, "id").or_else(|| str_field(message, "mid"))?.to_string();
    let text = str_field(message, "text")
        .map(|s| s.to_string())
        .or_else(|| {
            message
                .get("text")
                .and_then(|t| t.get("body"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        });
    let attachments = message
        .get("attachments")
        .and_then(|v| v.as_array())
        .map(|list| list.iter().filter_map(map_attachment).collect())
        .unwrap_or_default();

    Some(InboundEvent {
        org_id: org_id.to_string(),
        channel: Channel::Instagram,
        external_account_id: account_id.to_string(),
        external_user_id: from.clone(),
        external_thread_id: from,
        msg_id,
        text,
        attachments,
        timestamp: timestamp_or_now(message.get("timestamp")),
        raw: message.clone(),
    })
}

fn event_from_messaging_leaf(org_id: &str, account_id: &str, leaf: &Value) -> Option<InboundEvent> {
    let message = leaf.get("message")?;
    let sender_id = leaf
        .get("sender")
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())?;
    if sender_id == account_id
        || message
            .get("is_echo")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    {
        return None;
    }

    let msg_id = str_field(message, "mid")?.to_string();
    let attachments = message
        .get("attachments")
        .and_then(|v| v.as_array())
        .map(|list| list.iter().filter_map(map_attachment).collect())
        .unwrap_or_default();

    Some(InboundEvent {
        org_id: org_id.to_string(),
        channel: Channel::Instagram,
        external_account_id: account_id.to_string(),
        external_user_id: sender_id.to_string(),
        external_thread_id: sender_id.to_string(),
        msg_id,
        text: str_field(message, "text").map(|s| s.to_string()),
        attachments,
        timestamp: timestamp_or_now(leaf.get("timestamp")),
        raw: leaf.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_changes_shape() {
        let body = json!({
            "entry": [{
                "id": "ig-account-1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messages": [{
                            "id": "ig-mid-1",
                            "from": "ig-user-5",
                            "timestamp": "1700000000",
                            "text": "dm text"
                        }]
                    }
                }]
            }]
        });
        let events = events("org-1", &body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, Channel::Instagram);
        assert_eq!(events[0].msg_id, "ig-mid-1");
        assert_eq!(events[0].text.as_deref(), Some("dm text"));
    }

    #[test]
    fn extracts_messaging_shape_and_skips_echo() {
        let body = json!({
            "entry": [{
                "id": "ig-account-1",
                "messaging": [
                    {
                        "sender": { "id": "ig-user-5" },
                        "timestamp": 1700000000321i64,
                        "message": { "mid": "ig-mid-2", "text": "story reply" }
                    },
                    {
                        "sender": { "id": "ig-account-1" },
                        "message": { "mid": "ig-mid-3", "text": "own send" }
                    }
                ]
            }]
        });
        let events = events("org-1", &body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].msg_id, "ig-mid-2");
    }

    #[test]
    fn missing_message_key_is_skipped() {
        let body = json!({
            "entry": [{
                "id": "ig-account-1",
                "messaging": [{ "sender": { "id": "ig-user-5" }, "read": { "watermark": 1 } }]
            }]
        });
        assert!(events("org-1", &body).is_empty());
    }
}
