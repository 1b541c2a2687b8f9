//! Converts provider-specific webhook bodies into canonical
//! [`InboundEvent`](obx_core::InboundEvent)s.
//!
//! Each provider module walks its own nesting (`entry[].messaging[]` for
//! Messenger, `entry[].changes[].value.messages[]` for Instagram and
//! WhatsApp Cloud), skips self-authored echoes, and emits one event per leaf
//! message. Malformed leaves are skipped, never errored: retrying cannot fix
//! a payload the provider already shipped. Deduplication is not done here;
//! the ingestion pipeline owns it, keyed on `msg_id`.

use serde_json::Value;
use time::OffsetDateTime;

pub mod attachments;
pub mod instagram;
pub mod messenger;
pub mod whatsapp;

pub use attachments::map_attachment;

/// A delivery/read receipt extracted from a provider status callback.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReceipt {
    pub org_id: String,
    pub provider_message_id: String,
    pub status: obx_core::MessageStatus,
    pub recipient_id: Option<String>,
}

pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

/// Provider epochs arrive as seconds or milliseconds, as strings or numbers.
/// Anything unparseable falls back to the ingestion wall-clock time.
pub(crate) fn timestamp_or_now(raw: Option<&Value>) -> OffsetDateTime {
    let epoch = match raw {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    };
    epoch
        .and_then(|n| {
            let secs = if n > 1_000_000_000_000 { n / 1000 } else { n };
            OffsetDateTime::from_unix_timestamp(secs).ok()
        })
        .unwrap_or_else(OffsetDateTime::now_utc)
}
