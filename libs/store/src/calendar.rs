//! Calendar sweep persistence: no-show transitions, reminder bookkeeping,
//! and RSVP token state changes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::StoreError;

/// An event due for a pre-appointment reminder.
#[derive(Debug, Clone, PartialEq)]
pub struct ReminderCandidate {
    pub event_id: String,
    pub org_id: String,
    pub contact_name: String,
    /// Wire destination for the reminder (phone for WhatsApp sends).
    pub contact_phone: String,
    pub summary: String,
    pub start_at: OffsetDateTime,
    /// Present when a previous dispatch already minted a token.
    pub rsvp_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RsvpAction {
    Confirm,
    Cancel,
}

impl RsvpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RsvpAction::Confirm => "confirmed",
            RsvpAction::Cancel => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "confirm" => Some(RsvpAction::Confirm),
            "cancel" => Some(RsvpAction::Cancel),
            _ => None,
        }
    }
}

#[async_trait]
pub trait CalendarStore: Send + Sync {
    /// Transitions every still-pending event whose start time is more than
    /// `grace_minutes` in the past (and not canceled) to `noshow`, stamping
    /// `noshow_at`. One conditional UPDATE; safe to run repeatedly and
    /// concurrently. Returns the number of rows transitioned.
    async fn mark_no_shows(&self, grace_minutes: i64) -> Result<u64, StoreError>;

    /// Events starting within `lookahead_minutes` whose last reminder (if
    /// any) is older than `resend_after_minutes`.
    async fn due_reminders(
        &self,
        lookahead_minutes: i64,
        resend_after_minutes: i64,
    ) -> Result<Vec<ReminderCandidate>, StoreError>;

    /// Returns the event's RSVP token, minting and persisting one on first
    /// use.
    async fn ensure_rsvp_token(&self, event_id: &str) -> Result<String, StoreError>;

    /// Stamps `reminder_sent_at = now()`; called only after confirmed
    /// delivery so a failed send retries on the next run.
    async fn mark_reminder_sent(&self, event_id: &str) -> Result<(), StoreError>;

    /// Applies an unauthenticated RSVP action via its token. Returns the
    /// event id on success.
    async fn apply_rsvp(&self, token: &str, action: RsvpAction) -> Result<String, StoreError>;
}
