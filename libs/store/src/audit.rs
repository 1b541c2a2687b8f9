//! Raw-event audit sink (`integration_events`).

use async_trait::async_trait;
use serde_json::Value;

use crate::StoreError;

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persists one sanitized provider payload (or internal auditable event
    /// such as an email send outcome) for later inspection.
    async fn record_event(
        &self,
        org_id: &str,
        source: &str,
        kind: &str,
        payload: &Value,
    ) -> Result<(), StoreError>;
}
