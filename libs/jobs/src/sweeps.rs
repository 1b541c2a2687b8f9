//! Cron-style sweeps: no-show detection and pre-appointment reminders.

use std::sync::Arc;

use obx_core::{Destination, OutboundBody, OutboundRequest};
use obx_store::{CalendarStore, InboxStore, ReminderCandidate, StoreError};
use obx_transport::TransportRouter;
use time::macros::format_description;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub grace_minutes: i64,
    pub lookahead_minutes: i64,
    pub resend_after_minutes: i64,
    /// Public base for RSVP confirmation links.
    pub rsvp_base_url: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            grace_minutes: 15,
            lookahead_minutes: 120,
            resend_after_minutes: 60,
            rsvp_base_url: "http://localhost:8080".into(),
        }
    }
}

impl SweepConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(minutes) = env_i64("OBX_NOSHOW_GRACE_MINUTES") {
            config.grace_minutes = minutes;
        }
        if let Some(minutes) = env_i64("OBX_REMINDER_LOOKAHEAD_MINUTES") {
            config.lookahead_minutes = minutes;
        }
        if let Some(minutes) = env_i64("OBX_REMINDER_RESEND_MINUTES") {
            config.resend_after_minutes = minutes;
        }
        if let Ok(base) = std::env::var("OBX_RSVP_BASE_URL") {
            if !base.is_empty() {
                config.rsvp_base_url = base;
            }
        }
        config
    }
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Marks past-due pending appointments. The conditional UPDATE makes the
/// sweep repeat-safe; already-transitioned rows never match again.
pub struct NoShowSweep {
    calendar: Arc<dyn CalendarStore>,
    grace_minutes: i64,
}

impl NoShowSweep {
    pub fn new(calendar: Arc<dyn CalendarStore>, grace_minutes: i64) -> Self {
        Self {
            calendar,
            grace_minutes,
        }
    }

    pub async fn run(&self) -> Result<u64, StoreError> {
        let transitioned = self.calendar.mark_no_shows(self.grace_minutes).await?;
        if transitioned > 0 {
            info!(count = transitioned, "appointments marked no-show");
        }
        Ok(transitioned)
    }
}

/// Sends templated reminders for upcoming appointments; `reminder_sent_at`
/// is stamped only after confirmed delivery so failed sends retry on the
/// next run.
pub struct ReminderDispatch<S: InboxStore> {
    calendar: Arc<dyn CalendarStore>,
    router: Arc<TransportRouter<S>>,
    config: SweepConfig,
}

impl<S: InboxStore> ReminderDispatch<S> {
    pub fn new(
        calendar: Arc<dyn CalendarStore>,
        router: Arc<TransportRouter<S>>,
        config: SweepConfig,
    ) -> Self {
        Self {
            calendar,
            router,
            config,
        }
    }

    pub async fn run(&self) -> Result<usize, StoreError> {
        let due = self
            .calendar
            .due_reminders(self.config.lookahead_minutes, self.config.resend_after_minutes)
            .await?;
        let mut sent = 0;

        for candidate in due {
            let token = self.calendar.ensure_rsvp_token(&candidate.event_id).await?;
            let text = render_reminder(&candidate, &token, &self.config.rsvp_base_url);
            let request = OutboundRequest {
                org_id: candidate.org_id.clone(),
                to: Destination::Direct(candidate.contact_phone.clone()),
                body: OutboundBody::Text(text),
                transport: None,
                idempotency_key: format!(
                    "reminder:{}:{}",
                    candidate.event_id,
                    candidate.start_at.unix_timestamp()
                ),
            };

            match self.router.send(&request).await {
                Ok(receipt) if receipt.note.is_none() => {
                    self.calendar
                        .mark_reminder_sent(&candidate.event_id)
                        .await?;
                    sent += 1;
                }
                Ok(receipt) => {
                    warn!(
                        event = %candidate.event_id,
                        note = %receipt.note.unwrap_or_default(),
                        "reminder recorded without delivery, leaving unstamped"
                    );
                }
                Err(err) => {
                    warn!(
                        event = %candidate.event_id,
                        error = %err,
                        "reminder send failed, will retry next run"
                    );
                }
            }
        }
        Ok(sent)
    }
}

fn render_reminder(candidate: &ReminderCandidate, token: &str, base_url: &str) -> String {
    let when = candidate
        .start_at
        .format(format_description!(
            "[year]-[month]-[day] at [hour]:[minute] UTC"
        ))
        .unwrap_or_else(|_| candidate.start_at.unix_timestamp().to_string());
    format!(
        "Hi {name}! Reminder: {summary} on {when}. Confirm or cancel here: {base}/rsvp/{token}",
        name = candidate.contact_name,
        summary = candidate.summary,
        base = base_url.trim_end_matches('/'),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use obx_core::{IdempotencyGuard, InMemoryIdemStore};
    use obx_store::{InMemoryStore, MemCalendarEvent};
    use obx_transport::TransportRegistry;
    use time::{Duration, OffsetDateTime};

    fn upcoming_event(id: &str, minutes_ahead: i64) -> MemCalendarEvent {
        MemCalendarEvent {
            id: id.into(),
            org_id: "org-1".into(),
            contact_name: "Ana".into(),
            contact_phone: Some("521555".into()),
            summary: "Consultation".into(),
            start_at: OffsetDateTime::now_utc() + Duration::minutes(minutes_ahead),
            rsvp_status: "pending".into(),
            rsvp_token: None,
            reminder_sent_at: None,
            noshow_at: None,
            canceled_at: None,
        }
    }

    fn dispatch(store: Arc<InMemoryStore>) -> ReminderDispatch<InMemoryStore> {
        // Empty registry: sends take the fallback path, which does not count
        // as confirmed delivery.
        let router = Arc::new(TransportRouter::new(
            Arc::new(TransportRegistry::new()),
            store.clone(),
            IdempotencyGuard::new(Arc::new(InMemoryIdemStore::new()), 1),
        ));
        ReminderDispatch::new(store, router, SweepConfig::default())
    }

    #[tokio::test]
    async fn fallback_delivery_leaves_reminder_unstamped() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_calendar_event(upcoming_event("evt-1", 30)).await;
        let dispatch = dispatch(store.clone());

        assert_eq!(dispatch.run().await.unwrap(), 0);
        let event = store.calendar_event("evt-1").await.unwrap();
        assert!(event.reminder_sent_at.is_none());
        // The token was still minted for the rendered link.
        assert!(event.rsvp_token.is_some());
    }

    #[test]
    fn reminder_text_substitutes_fields() {
        let candidate = ReminderCandidate {
            event_id: "evt-1".into(),
            org_id: "org-1".into(),
            contact_name: "Ana".into(),
            contact_phone: "521555".into(),
            summary: "Consultation".into(),
            start_at: OffsetDateTime::UNIX_EPOCH,
            rsvp_token: None,
        };
        let text = render_reminder(&candidate, "tok123", "https://app.example.com/");
        assert!(text.contains("Hi Ana!"));
        assert!(text.contains("Consultation"));
        assert!(text.contains("https://app.example.com/rsvp/tok123"));
        assert!(text.contains("1970-01-01 at 00:00 UTC"));
    }
}
