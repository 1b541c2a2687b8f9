//! In-memory implementation of the store seams.
//!
//! Mirrors the Postgres semantics closely enough to exercise pipeline logic
//! in tests and single-process demos: idempotent message insert keyed on
//! `(org, channel, external_id)`, one open conversation per
//! `(org, contact, channel)`, conditional sweep transitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use obx_core::{
    AttachmentDescriptor, Channel, Direction, InboundEvent, MessageStatus, SenderRole,
    WireConventions,
};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    AuditStore, BillingStore, CalendarStore, ContentStore, ConversationRoute, DunningStep,
    InboxStore, IngestReceipt, MarketingStore, NewOutboundMessage, OverdueInvoice,
    ReminderCandidate, RsvpAction, SourcePost, StoreError,
};

#[derive(Debug, Clone)]
pub struct MemContact {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub consent: bool,
}

#[derive(Debug, Clone)]
pub struct MemConversation {
    pub id: String,
    pub org_id: String,
    pub contact_id: String,
    pub channel: Channel,
    pub external_thread_id: String,
    pub status: String,
    pub unread_count: u32,
    pub last_message_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct MemMessage {
    pub id: String,
    pub org_id: String,
    pub conversation_id: String,
    pub channel: Channel,
    pub direction: String,
    pub sender: String,
    pub kind: String,
    pub text: Option<String>,
    pub external_id: Option<String>,
    pub status: MessageStatus,
    pub note: Option<String>,
    pub attachments: Vec<AttachmentDescriptor>,
}

#[derive(Debug, Clone)]
pub struct MemCalendarEvent {
    pub id: String,
    pub org_id: String,
    pub contact_name: String,
    pub contact_phone: Option<String>,
    pub summary: String,
    pub start_at: OffsetDateTime,
    pub rsvp_status: String,
    pub rsvp_token: Option<String>,
    pub reminder_sent_at: Option<OffsetDateTime>,
    pub noshow_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct MemInvoice {
    pub id: String,
    pub org_id: String,
    pub customer_email: String,
    pub amount_cents: i64,
    pub status: String,
    pub due_at: OffsetDateTime,
}

#[derive(Default)]
struct State {
    contacts: Vec<MemContact>,
    id_map: HashMap<(String, Channel, String), String>,
    conversations: Vec<MemConversation>,
    messages: Vec<MemMessage>,
    events: Vec<MemCalendarEvent>,
    invoices: Vec<MemInvoice>,
    dunning: HashSet<(String, String)>,
    inactive_orgs: HashSet<String>,
    suppressions: HashSet<(String, String)>,
    campaign_recipients: HashMap<(String, String), String>,
    birthday_enabled: HashSet<String>,
    birthday_due: HashSet<String>,
    campaigns: Vec<(String, String)>,
    assets: HashMap<String, (String, Value)>,
    posts: HashMap<String, SourcePost>,
    derivatives: Vec<(String, String, String, String)>,
    repurpose_jobs: HashMap<String, String>,
    audit: Vec<(String, String, String, Value)>,
}

#[derive(Clone)]
pub struct InMemoryStore {
    conventions: WireConventions,
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_conventions(WireConventions::default())
    }

    pub fn with_conventions(conventions: WireConventions) -> Self {
        Self {
            conventions,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn conventions(&self) -> &WireConventions {
        &self.conventions
    }

    pub async fn messages(&self) -> Vec<MemMessage> {
        self.state.lock().await.messages.clone()
    }

    pub async fn conversations(&self) -> Vec<MemConversation> {
        self.state.lock().await.conversations.clone()
    }

    pub async fn audit_events(&self) -> Vec<(String, String, String, Value)> {
        self.state.lock().await.audit.clone()
    }

    pub async fn calendar_event(&self, event_id: &str) -> Option<MemCalendarEvent> {
        self.state
            .lock()
            .await
            .events
            .iter()
            .find(|e| e.id == event_id)
            .cloned()
    }

    pub async fn derivatives(&self) -> Vec<(String, String, String, String)> {
        self.state.lock().await.derivatives.clone()
    }

    pub async fn repurpose_status(&self, post_id: &str) -> Option<String> {
        self.state.lock().await.repurpose_jobs.get(post_id).cloned()
    }

    pub async fn campaigns(&self) -> Vec<(String, String)> {
        self.state.lock().await.campaigns.clone()
    }

    pub async fn asset(&self, asset_id: &str) -> Option<(String, Value)> {
        self.state.lock().await.assets.get(asset_id).cloned()
    }

    pub async fn org_active(&self, org_id: &str) -> bool {
        !self.state.lock().await.inactive_orgs.contains(org_id)
    }

    pub async fn recipient_status(&self, org_id: &str, recipient_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .campaign_recipients
            .get(&(org_id.to_string(), recipient_id.to_string()))
            .cloned()
    }

    pub async fn seed_calendar_event(&self, event: MemCalendarEvent) {
        self.state.lock().await.events.push(event);
    }

    pub async fn seed_invoice(&self, invoice: MemInvoice) {
        self.state.lock().await.invoices.push(invoice);
    }

    pub async fn seed_suppression(&self, org_id: &str, email: &str) {
        self.state
            .lock()
            .await
            .suppressions
            .insert((org_id.to_string(), email.to_lowercase()));
    }

    pub async fn seed_campaign_recipient(&self, org_id: &str, recipient_id: &str) {
        self.state.lock().await.campaign_recipients.insert(
            (org_id.to_string(), recipient_id.to_string()),
            "pending".to_string(),
        );
    }

    pub async fn seed_birthday_automation(&self, org_id: &str, due_today: bool) {
        let mut state = self.state.lock().await;
        state.birthday_enabled.insert(org_id.to_string());
        if due_today {
            state.birthday_due.insert(org_id.to_string());
        }
    }

    pub async fn seed_asset(&self, asset_id: &str) {
        self.state
            .lock()
            .await
            .assets
            .insert(asset_id.to_string(), (String::new(), Value::Null));
    }

    pub async fn seed_post(&self, post: SourcePost) {
        let mut state = self.state.lock().await;
        state
            .repurpose_jobs
            .insert(post.post_id.clone(), "pending".to_string());
        state.posts.insert(post.post_id.clone(), post);
    }

    pub async fn seed_repurpose_job(&self, post_id: &str) {
        self.state
            .lock()
            .await
            .repurpose_jobs
            .insert(post_id.to_string(), "pending".to_string());
    }

    fn resolve_or_create_contact(
        state: &mut State,
        org_id: &str,
        channel: Channel,
        external_user_id: &str,
    ) -> String {
        let map_key = (org_id.to_string(), channel, external_user_id.to_string());
        if let Some(contact_id) = state.id_map.get(&map_key) {
            return contact_id.clone();
        }
        let matched = state
            .contacts
            .iter()
            .find(|c| {
                c.org_id == org_id
                    && (c.phone.as_deref() == Some(external_user_id)
                        || c.email.as_deref() == Some(external_user_id))
            })
            .map(|c| c.id.clone());
        let contact_id = matched.unwrap_or_else(|| {
            let id = Uuid::new_v4().to_string();
            let phone = matches!(channel, Channel::WhatsAppCloud | Channel::WhatsAppSession)
                .then(|| external_user_id.to_string());
            state.contacts.push(MemContact {
                id: id.clone(),
                org_id: org_id.to_string(),
                name: external_user_id.to_string(),
                phone,
                email: None,
                consent: false,
            });
            id
        });
        state.id_map.insert(map_key, contact_id.clone());
        contact_id
    }

    fn resolve_or_create_conversation(
        state: &mut State,
        org_id: &str,
        contact_id: &str,
        channel: Channel,
        external_thread_id: &str,
    ) -> String {
        if let Some(existing) = state.conversations.iter().find(|c| {
            c.org_id == org_id
                && c.contact_id == contact_id
                && c.channel == channel
                && c.status == "open"
        }) {
            return existing.id.clone();
        }
        let id = Uuid::new_v4().to_string();
        state.conversations.push(MemConversation {
            id: id.clone(),
            org_id: org_id.to_string(),
            contact_id: contact_id.to_string(),
            channel,
            external_thread_id: external_thread_id.to_string(),
            status: "open".to_string(),
            unread_count: 0,
            last_message_at: OffsetDateTime::now_utc(),
        });
        id
    }
}

#[async_trait]
impl InboxStore for InMemoryStore {
    async fn ingest(&self, event: &InboundEvent) -> Result<IngestReceipt, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.messages.iter().find(|m| {
            m.org_id == event.org_id
                && m.channel == event.channel
                && m.external_id.as_deref() == Some(event.msg_id.as_str())
        }) {
            return Ok(IngestReceipt {
                conversation_id: existing.conversation_id.clone(),
                message_id: existing.id.clone(),
                duplicate: true,
            });
        }

        let contact_id = Self::resolve_or_create_contact(
            &mut state,
            &event.org_id,
            event.channel,
            &event.external_user_id,
        );
        let conversation_id = Self::resolve_or_create_conversation(
            &mut state,
            &event.org_id,
            &contact_id,
            event.channel,
            &event.external_thread_id,
        );

        let message_id = Uuid::new_v4().to_string();
        let kind = event
            .attachments
            .first()
            .map(|a| a.kind.as_str())
            .unwrap_or("text");
        state.messages.push(MemMessage {
            id: message_id.clone(),
            org_id: event.org_id.clone(),
            conversation_id: conversation_id.clone(),
            channel: event.channel,
            direction: self.conventions.direction(Direction::In).to_string(),
            sender: self.conventions.sender(SenderRole::Contact).to_string(),
            kind: kind.to_string(),
            text: event.text.clone(),
            external_id: Some(event.msg_id.clone()),
            status: MessageStatus::Sent,
            note: None,
            attachments: event.attachments.clone(),
        });
        if let Some(conversation) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conversation.last_message_at = OffsetDateTime::now_utc();
            conversation.unread_count += 1;
        }

        Ok(IngestReceipt {
            conversation_id,
            message_id,
            duplicate: false,
        })
    }

    async fn record_outbound(&self, message: &NewOutboundMessage) -> Result<String, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(external_id) = message.provider_message_id.as_deref() {
            if let Some(existing) = state.messages.iter().find(|m| {
                m.org_id == message.org_id
                    && m.channel == message.channel
                    && m.external_id.as_deref() == Some(external_id)
            }) {
                return Ok(existing.id.clone());
            }
        }

        let conversation_id = match &message.conversation_id {
            Some(id) => id.clone(),
            None => {
                let contact_id = Self::resolve_or_create_contact(
                    &mut state,
                    &message.org_id,
                    message.channel,
                    &message.to,
                );
                Self::resolve_or_create_conversation(
                    &mut state,
                    &message.org_id,
                    &contact_id,
                    message.channel,
                    &message.to,
                )
            }
        };

        let message_id = Uuid::new_v4().to_string();
        let kind = message
            .attachment
            .as_ref()
            .map(|a| a.kind.as_str())
            .unwrap_or("text");
        state.messages.push(MemMessage {
            id: message_id.clone(),
            org_id: message.org_id.clone(),
            conversation_id: conversation_id.clone(),
            channel: message.channel,
            direction: self.conventions.direction(Direction::Out).to_string(),
            sender: self.conventions.sender(message.sender).to_string(),
            kind: kind.to_string(),
            text: Some(message.text.clone()),
            external_id: message.provider_message_id.clone(),
            status: message.status,
            note: message.note.clone(),
            attachments: message.attachment.clone().into_iter().collect(),
        });
        if let Some(conversation) = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conversation.last_message_at = OffsetDateTime::now_utc();
        }
        Ok(message_id)
    }

    async fn conversation_route(
        &self,
        org_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationRoute, StoreError> {
        let state = self.state.lock().await;
        let conversation = state
            .conversations
            .iter()
            .find(|c| c.org_id == org_id && c.id == conversation_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;
        Ok(ConversationRoute {
            conversation_id: conversation.id.clone(),
            org_id: conversation.org_id.clone(),
            channel: conversation.channel,
            external_user_id: conversation.external_thread_id.clone(),
            transport: conversation.channel.default_transport(),
        })
    }

    async fn update_message_status(
        &self,
        org_id: &str,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.messages.iter_mut().find(|m| {
            m.org_id == org_id && m.external_id.as_deref() == Some(provider_message_id)
        }) {
            message.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarStore for InMemoryStore {
    async fn mark_no_shows(&self, grace_minutes: i64) -> Result<u64, StoreError> {
        let cutoff = OffsetDateTime::now_utc() - Duration::minutes(grace_minutes);
        let mut state = self.state.lock().await;
        let mut transitioned = 0;
        for event in state.events.iter_mut() {
            if event.rsvp_status == "pending"
                && event.canceled_at.is_none()
                && event.start_at < cutoff
            {
                event.rsvp_status = "noshow".to_string();
                event.noshow_at = Some(OffsetDateTime::now_utc());
                transitioned += 1;
            }
        }
        Ok(transitioned)
    }

    async fn due_reminders(
        &self,
        lookahead_minutes: i64,
        resend_after_minutes: i64,
    ) -> Result<Vec<ReminderCandidate>, StoreError> {
        let now = OffsetDateTime::now_utc();
        let horizon = now + Duration::minutes(lookahead_minutes);
        let resend_cutoff = now - Duration::minutes(resend_after_minutes);
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| {
                e.rsvp_status == "pending"
                    && e.canceled_at.is_none()
                    && e.contact_phone.is_some()
                    && e.start_at >= now
                    && e.start_at <= horizon
                    && e.reminder_sent_at.map(|t| t < resend_cutoff).unwrap_or(true)
            })
            .map(|e| ReminderCandidate {
                event_id: e.id.clone(),
                org_id: e.org_id.clone(),
                contact_name: e.contact_name.clone(),
                contact_phone: e.contact_phone.clone().unwrap_or_default(),
                summary: e.summary.clone(),
                start_at: e.start_at,
                rsvp_token: e.rsvp_token.clone(),
            })
            .collect())
    }

    async fn ensure_rsvp_token(&self, event_id: &str) -> Result<String, StoreError> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "calendar_event",
                id: event_id.to_string(),
            })?;
        if event.rsvp_token.is_none() {
            event.rsvp_token = Some(nanoid::nanoid!(32));
        }
        Ok(event.rsvp_token.clone().unwrap_or_default())
    }

    async fn mark_reminder_sent(&self, event_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(event) = state.events.iter_mut().find(|e| e.id == event_id) {
            event.reminder_sent_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn apply_rsvp(&self, token: &str, action: RsvpAction) -> Result<String, StoreError> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.rsvp_token.as_deref() == Some(token));
        match event {
            Some(event) if event.rsvp_status == "pending" => {
                event.rsvp_status = action.as_str().to_string();
                Ok(event.id.clone())
            }
            Some(_) => Err(StoreError::TokenConsumed(token.to_string())),
            None => Err(StoreError::NotFound {
                entity: "rsvp_token",
                id: token.to_string(),
            }),
        }
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn overdue_invoices(&self) -> Result<Vec<OverdueInvoice>, StoreError> {
        let now = OffsetDateTime::now_utc();
        let state = self.state.lock().await;
        let mut overdue: Vec<OverdueInvoice> = state
            .invoices
            .iter()
            .filter(|i| i.status == "pending" && i.due_at < now)
            .map(|i| OverdueInvoice {
                invoice_id: i.id.clone(),
                org_id: i.org_id.clone(),
                customer_email: i.customer_email.clone(),
                amount_cents: i.amount_cents,
                due_at: i.due_at,
                days_overdue: (now - i.due_at).whole_days(),
            })
            .collect();
        overdue.sort_by_key(|i| i.due_at);
        Ok(overdue)
    }

    async fn record_dunning_step(
        &self,
        invoice_id: &str,
        step: DunningStep,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .dunning
            .insert((invoice_id.to_string(), step.as_str().to_string())))
    }

    async fn deactivate_org(&self, org_id: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .inactive_orgs
            .insert(org_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl MarketingStore for InMemoryStore {
    async fn is_suppressed(&self, org_id: &str, email: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .suppressions
            .contains(&(org_id.to_string(), email.to_lowercase())))
    }

    async fn update_campaign_recipient(
        &self,
        org_id: &str,
        recipient_id: &str,
        outcome: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let key = (org_id.to_string(), recipient_id.to_string());
        if let Some(status) = state.campaign_recipients.get_mut(&key) {
            *status = outcome.to_string();
        }
        Ok(())
    }

    async fn birthday_automation_enabled(&self, org_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.birthday_enabled.contains(org_id))
    }

    async fn orgs_with_birthday_automation(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let mut orgs: Vec<String> = state
            .birthday_enabled
            .iter()
            .filter(|org| !state.inactive_orgs.contains(*org))
            .cloned()
            .collect();
        orgs.sort();
        Ok(orgs)
    }

    async fn schedule_birthday_campaign(
        &self,
        org_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock().await;
        if !state.birthday_due.contains(org_id) {
            return Ok(None);
        }
        let id = Uuid::new_v4().to_string();
        state.campaigns.push((id.clone(), org_id.to_string()));
        Ok(Some(id))
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn complete_asset(
        &self,
        asset_id: &str,
        url: &str,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.assets.get_mut(asset_id) {
            Some(slot) => {
                *slot = (url.to_string(), metadata.clone());
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "content_asset",
                id: asset_id.to_string(),
            }),
        }
    }

    async fn source_post(&self, post_id: &str) -> Result<Option<SourcePost>, StoreError> {
        Ok(self.state.lock().await.posts.get(post_id).cloned())
    }

    async fn insert_derivative(
        &self,
        org_id: &str,
        source_post_id: &str,
        mode: &str,
        body: &str,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.state.lock().await.derivatives.push((
            org_id.to_string(),
            source_post_id.to_string(),
            mode.to_string(),
            body.to_string(),
        ));
        Ok(id)
    }

    async fn finish_repurpose_job(
        &self,
        post_id: &str,
        completed: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let status = if completed { "completed" } else { "not_found" };
        state
            .repurpose_jobs
            .insert(post_id.to_string(), status.to_string());
        Ok(())
    }
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn record_event(
        &self,
        org_id: &str,
        source: &str,
        kind: &str,
        payload: &Value,
    ) -> Result<(), StoreError> {
        self.state.lock().await.audit.push((
            org_id.to_string(),
            source.to_string(),
            kind.to_string(),
            payload.clone(),
        ));
        Ok(())
    }
}
