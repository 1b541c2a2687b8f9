//! Marketing persistence: email suppression, campaign recipients, and the
//! birthday automation tick.

use async_trait::async_trait;

use crate::StoreError;

#[async_trait]
pub trait MarketingStore: Send + Sync {
    /// True when the address is on the organization's suppression list.
    async fn is_suppressed(&self, org_id: &str, email: &str) -> Result<bool, StoreError>;

    /// Updates the originating campaign-recipient row, when one exists,
    /// with the delivery outcome (`sent` / `suppressed` / `failed`).
    async fn update_campaign_recipient(
        &self,
        org_id: &str,
        recipient_id: &str,
        outcome: &str,
    ) -> Result<(), StoreError>;

    /// Whether the organization has the birthday automation enabled.
    async fn birthday_automation_enabled(&self, org_id: &str) -> Result<bool, StoreError>;

    /// Organizations with the birthday automation enabled; drives the
    /// per-org calendar tick.
    async fn orgs_with_birthday_automation(&self) -> Result<Vec<String>, StoreError>;

    /// Creates a scheduled birthday campaign row for the organization's
    /// contacts with upcoming birthdays. Returns the campaign id, or `None`
    /// when no contact qualifies today.
    async fn schedule_birthday_campaign(&self, org_id: &str)
        -> Result<Option<String>, StoreError>;
}
