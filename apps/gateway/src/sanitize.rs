//! Audit-copy sanitization.
//!
//! Raw provider payloads are persisted for replay/debugging, but never with
//! credential material: any field whose name matches the secret pattern is
//! stripped before the copy reaches the audit sink.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)token|secret|signature|key").unwrap())
}

/// Returns a deep copy with every secret-named field removed, at any depth.
pub fn sanitize_payload(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(name, _)| !secret_pattern().is_match(name))
                .map(|(name, value)| (name.clone(), sanitize_payload(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_payload).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_secret_fields_recursively() {
        let raw = json!({
            "entry": [{
                "access_token": "EAAB...",
                "messaging": [{
                    "sender": { "id": "psid-1", "session_key": "abc" },
                    "message": { "mid": "m-1", "text": "hi" }
                }]
            }],
            "X-Hub-Signature-256": "sha256=deadbeef",
            "verify_TOKEN": "hub-secret"
        });
        let clean = sanitize_payload(&raw);

        assert!(clean.get("X-Hub-Signature-256").is_none());
        assert!(clean.get("verify_TOKEN").is_none());
        let entry = &clean["entry"][0];
        assert!(entry.get("access_token").is_none());
        let sender = &entry["messaging"][0]["sender"];
        assert!(sender.get("session_key").is_none());
        assert_eq!(sender["id"], "psid-1");
        assert_eq!(entry["messaging"][0]["message"]["text"], "hi");
    }

    #[test]
    fn passes_scalars_and_arrays_through() {
        let raw = json!([1, "two", { "apikey": "x", "ok": true }]);
        let clean = sanitize_payload(&raw);
        assert_eq!(clean, json!([1, "two", { "ok": true }]));
    }
}
