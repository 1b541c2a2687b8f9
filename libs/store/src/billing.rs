//! Billing dunning persistence: overdue-invoice scan and per-step records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::StoreError;

/// A pending invoice past its due date, as seen by the daily renewals tick.
#[derive(Debug, Clone, PartialEq)]
pub struct OverdueInvoice {
    pub invoice_id: String,
    pub org_id: String,
    pub customer_email: String,
    pub amount_cents: i64,
    pub due_at: OffsetDateTime,
    pub days_overdue: i64,
}

/// Dunning steps, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DunningStep {
    DueReminder,
    OverdueNotice,
    Deactivated,
}

impl DunningStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            DunningStep::DueReminder => "due_reminder",
            DunningStep::OverdueNotice => "overdue_notice",
            DunningStep::Deactivated => "deactivated",
        }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Pending invoices whose due date has passed, oldest first.
    async fn overdue_invoices(&self) -> Result<Vec<OverdueInvoice>, StoreError>;

    /// Records that a dunning step ran for an invoice; the same step is
    /// recorded at most once per invoice (repeat calls are no-ops), which
    /// keeps the daily tick idempotent.
    async fn record_dunning_step(
        &self,
        invoice_id: &str,
        step: DunningStep,
    ) -> Result<bool, StoreError>;

    /// Deactivates an organization (soft flag; nothing is deleted).
    async fn deactivate_org(&self, org_id: &str) -> Result<(), StoreError>;
}
