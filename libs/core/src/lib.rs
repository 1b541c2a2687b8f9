//! Omnibox core contracts and value types.
//!
//! This crate exposes the canonical message model exchanged between the
//! webhook gateway, the ingestion pipeline, the transport router, and the
//! job workers. It also carries the wire-convention value resolved at
//! startup and a small idempotency guard shared by send paths.

pub mod conventions;
pub mod idempotency;
pub mod types;

pub use conventions::*;
pub use idempotency::*;
pub use types::*;
