//! Data-access seams for the Omnibox pipeline.
//!
//! Every concern the pipeline persists sits behind an async trait with a
//! Postgres implementation ([`PgStore`]) and an in-memory double
//! ([`InMemoryStore`]) for tests. Writes that matter for correctness are
//! single atomic statements or one short transaction; tenant isolation is
//! applied per transaction with `set_config('app.org_id', …, true)` so the
//! row-level policies see the org and the setting dies with the transaction.

pub mod audit;
pub mod billing;
pub mod calendar;
pub mod content;
pub mod conventions;
pub mod inbox;
pub mod marketing;
pub mod memory;
pub mod pg;

pub use audit::*;
pub use billing::*;
pub use calendar::*;
pub use content::*;
pub use conventions::*;
pub use inbox::*;
pub use marketing::*;
pub use memory::{
    InMemoryStore, MemCalendarEvent, MemContact, MemConversation, MemInvoice, MemMessage,
};
pub use pg::PgStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("rsvp token already consumed: {0}")]
    TokenConsumed(String),
    #[error("invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },
}
