//! Tolerant attachment mapping.
//!
//! Provider attachment shapes differ between live webhooks and
//! backfill/history API responses, so every property is resolved through an
//! ordered candidate list and the first non-null match wins.

use obx_core::{AttachmentDescriptor, AttachmentKind};
use serde_json::Value;

const URL_CANDIDATES: &[&str] = &[
    "remote_url",
    "url",
    "payload.url",
    "file_url",
    "image_url",
    "video_url",
    "sticker_url",
    "href",
    "link",
];

const MIME_CANDIDATES: &[&str] = &["mime", "mime_type", "mimetype", "content_type", "payload.mime_type"];

const SIZE_CANDIDATES: &[&str] = &["size", "file_size", "filesize", "file_length", "payload.size"];

const WIDTH_CANDIDATES: &[&str] = &["width", "payload.width", "image_data.width"];

const HEIGHT_CANDIDATES: &[&str] = &["height", "payload.height", "image_data.height"];

const DURATION_CANDIDATES: &[&str] = &["duration_ms", "duration", "payload.duration", "seconds"];

const TYPE_CANDIDATES: &[&str] = &["type", "kind", "attachment_type", "media_type"];

/// Maps one provider attachment object onto the uniform descriptor.
/// Returns `None` only when the object carries nothing usable at all.
pub fn map_attachment(raw: &Value) -> Option<AttachmentDescriptor> {
    if !raw.is_object() {
        return None;
    }

    let mime = first_string(raw, MIME_CANDIDATES);
    let kind = first_string(raw, TYPE_CANDIDATES)
        .as_deref()
        .and_then(AttachmentKind::parse)
        .or_else(|| mime.as_deref().map(AttachmentKind::from_mime))
        .unwrap_or(AttachmentKind::File);

    let remote_url = first_string(raw, URL_CANDIDATES);
    let size = first_u64(raw, SIZE_CANDIDATES);
    let width = first_u64(raw, WIDTH_CANDIDATES).map(|v| v as u32);
    let height = first_u64(raw, HEIGHT_CANDIDATES).map(|v| v as u32);
    let duration_ms = first_u64(raw, DURATION_CANDIDATES);

    if remote_url.is_none()
        && mime.is_none()
        && size.is_none()
        && first_string(raw, TYPE_CANDIDATES).is_none()
    {
        return None;
    }

    Some(AttachmentDescriptor {
        kind,
        mime,
        size,
        remote_url,
        width,
        height,
        duration_ms,
    })
}

/// Resolves a possibly dotted path like `payload.url`.
fn lookup<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = raw;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn first_string(raw: &Value, candidates: &[&str]) -> Option<String> {
    candidates.iter().find_map(|path| {
        lookup(raw, path)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    })
}

fn first_u64(raw: &Value, candidates: &[&str]) -> Option<u64> {
    candidates.iter().find_map(|path| {
        let value = lookup(raw, path)?;
        match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse::<u64>().ok(),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_url_beats_image_url() {
        let raw = json!({
            "type": "image",
            "payload": { "url": "https://cdn.example.com/a.png" },
            "image_url": "https://cdn.example.com/b.png"
        });
        let mapped = map_attachment(&raw).expect("descriptor");
        assert_eq!(
            mapped.remote_url.as_deref(),
            Some("https://cdn.example.com/a.png")
        );
        assert_eq!(mapped.kind, AttachmentKind::Image);
    }

    #[test]
    fn remote_url_has_top_priority() {
        let raw = json!({
            "remote_url": "https://store.example.com/x",
            "url": "https://cdn.example.com/y",
        });
        let mapped = map_attachment(&raw).expect("descriptor");
        assert_eq!(
            mapped.remote_url.as_deref(),
            Some("https://store.example.com/x")
        );
    }

    #[test]
    fn kind_inferred_from_mime_when_type_missing() {
        let raw = json!({ "mime_type": "video/mp4", "link": "https://x/v.mp4" });
        let mapped = map_attachment(&raw).expect("descriptor");
        assert_eq!(mapped.kind, AttachmentKind::Video);
        assert_eq!(mapped.mime.as_deref(), Some("video/mp4"));
    }

    #[test]
    fn numeric_fields_accept_strings() {
        let raw = json!({
            "type": "audio",
            "file_size": "2048",
            "duration": 7500
        });
        let mapped = map_attachment(&raw).expect("descriptor");
        assert_eq!(mapped.size, Some(2048));
        assert_eq!(mapped.duration_ms, Some(7500));
    }

    #[test]
    fn empty_object_maps_to_none() {
        assert_eq!(map_attachment(&json!({})), None);
        assert_eq!(map_attachment(&json!("not-an-object")), None);
    }
}
