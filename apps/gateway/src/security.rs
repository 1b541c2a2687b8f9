//! Meta-family webhook signature verification.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verifies `X-Hub-Signature-256: sha256=<hex hmac>` over the raw body.
/// Comparison is constant-time; any malformed header fails closed.
pub fn verify_meta_signature(app_secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    let header = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(provided) = header.strip_prefix("sha256=") else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(app_secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn signed_headers(secret: &str, body: &[u8]) -> HeaderMap {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        let mut headers = HeaderMap::new();
        headers.insert("X-Hub-Signature-256", HeaderValue::from_str(&sig).unwrap());
        headers
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"entry":[]}"#;
        let headers = signed_headers("secret", body);
        assert!(verify_meta_signature("secret", &headers, body));
    }

    #[test]
    fn rejects_tampered_body() {
        let headers = signed_headers("secret", br#"{"entry":[]}"#);
        assert!(!verify_meta_signature("secret", &headers, br#"{"entry":[1]}"#));
    }

    #[test]
    fn rejects_missing_or_unprefixed_header() {
        let body = b"{}";
        assert!(!verify_meta_signature("secret", &HeaderMap::new(), body));

        let mut headers = HeaderMap::new();
        headers.insert("X-Hub-Signature-256", HeaderValue::from_static("deadbeef"));
        assert!(!verify_meta_signature("secret", &headers, body));
    }
}
