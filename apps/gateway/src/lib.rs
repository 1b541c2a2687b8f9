//! Webhook HTTP boundary.
//!
//! Providers get a fast `200 OK`: signature verification happens inline,
//! everything else (audit copy, normalization, ingestion) runs in a
//! detached task so provider-side retry storms never build up behind
//! database latency. Processing errors are logged and dropped, never
//! surfaced to the provider.

pub mod routes;
pub mod sanitize;
pub mod security;

pub use routes::{app, AppState, WebhookSecrets};
