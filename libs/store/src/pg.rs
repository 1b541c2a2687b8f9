//! Postgres implementation of the store seams.
//!
//! Correctness-relevant writes are single statements or one short
//! transaction. Tenant-scoped transactions call
//! `set_config('app.org_id', $1, true)` first; the `true` makes the setting
//! transaction-local (`SET LOCAL` semantics), so the connection returns to
//! the pool clean. Cross-org maintenance (sweeps, billing scan) runs on the
//! worker's service role, which the row policies exempt.

use async_trait::async_trait;
use obx_core::{Direction, InboundEvent, MessageStatus, SenderRole, WireConventions};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    AuditStore, BillingStore, CalendarStore, ContentStore, ConversationRoute, DunningStep,
    InboxStore, IngestReceipt, InsertOutcome, MarketingStore, NewOutboundMessage, OverdueInvoice,
    ReminderCandidate, RsvpAction, SourcePost, StoreError,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    conventions: WireConventions,
}

impl PgStore {
    pub fn new(pool: PgPool, conventions: WireConventions) -> Self {
        Self { pool, conventions }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn conventions(&self) -> &WireConventions {
        &self.conventions
    }

    /// Begins a transaction scoped to one organization for the row-level
    /// policies keyed on `app.org_id`.
    async fn org_tx(&self, org_id: &str) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('app.org_id', $1, true)")
            .bind(org_id)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn resolve_or_create_contact(
        tx: &mut Transaction<'static, Postgres>,
        org_id: &str,
        channel: obx_core::Channel,
        external_user_id: &str,
    ) -> Result<String, StoreError> {
        let mapped = sqlx::query_scalar::<_, String>(
            "SELECT contact_id FROM channel_id_map \
             WHERE org_id = $1 AND channel = $2 AND external_id = $3",
        )
        .bind(org_id)
        .bind(channel.as_str())
        .bind(external_user_id)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some(contact_id) = mapped {
            return Ok(contact_id);
        }

        // WhatsApp wire ids are phone numbers; PSIDs never match here.
        let by_identity = sqlx::query_scalar::<_, String>(
            "SELECT id FROM contacts \
             WHERE org_id = $1 AND (phone = $2 OR email = $2) \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(org_id)
        .bind(external_user_id)
        .fetch_optional(&mut **tx)
        .await?;

        let contact_id = match by_identity {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                let phone = matches!(
                    channel,
                    obx_core::Channel::WhatsAppCloud | obx_core::Channel::WhatsAppSession
                )
                .then(|| external_user_id.to_string());
                sqlx::query(
                    "INSERT INTO contacts (id, org_id, name, phone, consent, created_at) \
                     VALUES ($1, $2, $3, $4, false, now())",
                )
                .bind(&id)
                .bind(org_id)
                .bind(external_user_id)
                .bind(phone)
                .execute(&mut **tx)
                .await?;
                debug!(org = %org_id, contact = %id, "contact created");
                id
            }
        };

        sqlx::query(
            "INSERT INTO channel_id_map (org_id, channel, external_id, contact_id) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (org_id, channel, external_id) DO NOTHING",
        )
        .bind(org_id)
        .bind(channel.as_str())
        .bind(external_user_id)
        .bind(&contact_id)
        .execute(&mut **tx)
        .await?;

        Ok(contact_id)
    }

    /// At most one open conversation per (org, contact, channel); the
    /// partial unique index makes the upsert race-free.
    async fn resolve_or_create_conversation(
        tx: &mut Transaction<'static, Postgres>,
        org_id: &str,
        contact_id: &str,
        channel: obx_core::Channel,
        external_thread_id: &str,
    ) -> Result<String, StoreError> {
        let candidate_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO conversations \
             (id, org_id, contact_id, channel, external_thread_id, status, unread_count, last_message_at) \
             VALUES ($1, $2, $3, $4, $5, 'open', 0, now()) \
             ON CONFLICT (org_id, contact_id, channel) WHERE status = 'open' DO NOTHING",
        )
        .bind(&candidate_id)
        .bind(org_id)
        .bind(contact_id)
        .bind(channel.as_str())
        .bind(external_thread_id)
        .execute(&mut **tx)
        .await?;

        let conversation_id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM conversations \
             WHERE org_id = $1 AND contact_id = $2 AND channel = $3 AND status = 'open'",
        )
        .bind(org_id)
        .bind(contact_id)
        .bind(channel.as_str())
        .fetch_one(&mut **tx)
        .await?;
        Ok(conversation_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_message(
        tx: &mut Transaction<'static, Postgres>,
        org_id: &str,
        conversation_id: &str,
        channel: obx_core::Channel,
        direction: &str,
        sender: &str,
        kind: &str,
        text: Option<&str>,
        external_id: Option<&str>,
        status: MessageStatus,
        note: Option<&str>,
    ) -> Result<InsertOutcome, StoreError> {
        let candidate_id = Uuid::new_v4().to_string();
        let inserted = sqlx::query_scalar::<_, String>(
            "INSERT INTO messages \
             (id, org_id, conversation_id, channel, direction, sender, kind, text, external_id, status, note, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, now()) \
             ON CONFLICT (org_id, channel, external_id) WHERE external_id IS NOT NULL DO NOTHING \
             RETURNING id",
        )
        .bind(&candidate_id)
        .bind(org_id)
        .bind(conversation_id)
        .bind(channel.as_str())
        .bind(direction)
        .bind(sender)
        .bind(kind)
        .bind(text)
        .bind(external_id)
        .bind(status.as_str())
        .bind(note)
        .fetch_optional(&mut **tx)
        .await?;

        match inserted {
            Some(id) => Ok(InsertOutcome::Inserted(id)),
            None => {
                let existing = sqlx::query_scalar::<_, String>(
                    "SELECT id FROM messages \
                     WHERE org_id = $1 AND channel = $2 AND external_id = $3",
                )
                .bind(org_id)
                .bind(channel.as_str())
                .bind(external_id)
                .fetch_one(&mut **tx)
                .await?;
                Ok(InsertOutcome::AlreadyExists(existing))
            }
        }
    }

    async fn insert_attachments(
        tx: &mut Transaction<'static, Postgres>,
        message_id: &str,
        attachments: &[obx_core::AttachmentDescriptor],
    ) -> Result<(), StoreError> {
        for attachment in attachments {
            sqlx::query(
                "INSERT INTO message_attachments \
                 (id, message_id, kind, mime, size, remote_url, width, height, duration_ms) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(message_id)
            .bind(attachment.kind.as_str())
            .bind(&attachment.mime)
            .bind(attachment.size.map(|v| v as i64))
            .bind(&attachment.remote_url)
            .bind(attachment.width.map(|v| v as i32))
            .bind(attachment.height.map(|v| v as i32))
            .bind(attachment.duration_ms.map(|v| v as i64))
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    fn message_kind(attachments: &[obx_core::AttachmentDescriptor]) -> &'static str {
        match attachments.first().map(|a| a.kind) {
            Some(kind) => kind.as_str(),
            None => "text",
        }
    }
}

#[async_trait]
impl InboxStore for PgStore {
    async fn ingest(&self, event: &InboundEvent) -> Result<IngestReceipt, StoreError> {
        let mut tx = self.org_tx(&event.org_id).await?;

        let contact_id = Self::resolve_or_create_contact(
            &mut tx,
            &event.org_id,
            event.channel,
            &event.external_user_id,
        )
        .await?;
        let conversation_id = Self::resolve_or_create_conversation(
            &mut tx,
            &event.org_id,
            &contact_id,
            event.channel,
            &event.external_thread_id,
        )
        .await?;

        let outcome = Self::insert_message(
            &mut tx,
            &event.org_id,
            &conversation_id,
            event.channel,
            self.conventions.direction(Direction::In),
            self.conventions.sender(SenderRole::Contact),
            Self::message_kind(&event.attachments),
            event.text.as_deref(),
            Some(&event.msg_id),
            MessageStatus::Sent,
            None,
        )
        .await?;

        let (message_id, duplicate) = match outcome {
            InsertOutcome::Inserted(id) => {
                Self::insert_attachments(&mut tx, &id, &event.attachments).await?;
                sqlx::query(
                    "UPDATE conversations \
                     SET last_message_at = now(), unread_count = unread_count + 1 \
                     WHERE id = $1",
                )
                .bind(&conversation_id)
                .execute(&mut *tx)
                .await?;
                (id, false)
            }
            InsertOutcome::AlreadyExists(id) => (id, true),
        };

        tx.commit().await?;
        if duplicate {
            info!(
                org = %event.org_id,
                channel = %event.channel.as_str(),
                msg_id = %event.msg_id,
                "duplicate delivery absorbed"
            );
        }
        Ok(IngestReceipt {
            conversation_id,
            message_id,
            duplicate,
        })
    }

    async fn record_outbound(&self, message: &NewOutboundMessage) -> Result<String, StoreError> {
        let mut tx = self.org_tx(&message.org_id).await?;

        let conversation_id = match &message.conversation_id {
            Some(id) => id.clone(),
            None => {
                let contact_id = Self::resolve_or_create_contact(
                    &mut tx,
                    &message.org_id,
                    message.channel,
                    &message.to,
                )
                .await?;
                Self::resolve_or_create_conversation(
                    &mut tx,
                    &message.org_id,
                    &contact_id,
                    message.channel,
                    &message.to,
                )
                .await?
            }
        };

        let attachments: &[obx_core::AttachmentDescriptor] = match &message.attachment {
            Some(attachment) => std::slice::from_ref(attachment),
            None => &[],
        };
        let outcome = Self::insert_message(
            &mut tx,
            &message.org_id,
            &conversation_id,
            message.channel,
            self.conventions.direction(Direction::Out),
            self.conventions.sender(message.sender),
            Self::message_kind(attachments),
            Some(&message.text),
            message.provider_message_id.as_deref(),
            message.status,
            message.note.as_deref(),
        )
        .await?;

        let message_id = match outcome {
            InsertOutcome::Inserted(id) => {
                Self::insert_attachments(&mut tx, &id, attachments).await?;
                sqlx::query("UPDATE conversations SET last_message_at = now() WHERE id = $1")
                    .bind(&conversation_id)
                    .execute(&mut *tx)
                    .await?;
                id
            }
            InsertOutcome::AlreadyExists(id) => id,
        };

        tx.commit().await?;
        Ok(message_id)
    }

    async fn conversation_route(
        &self,
        org_id: &str,
        conversation_id: &str,
    ) -> Result<ConversationRoute, StoreError> {
        let mut tx = self.org_tx(org_id).await?;
        let row = sqlx::query(
            "SELECT id, org_id, channel, external_thread_id FROM conversations \
             WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            entity: "conversation",
            id: conversation_id.to_string(),
        })?;
        tx.commit().await?;

        let channel_raw: String = row.get("channel");
        let channel =
            obx_core::Channel::parse(&channel_raw).ok_or_else(|| StoreError::Invalid {
                field: "channel",
                value: channel_raw.clone(),
            })?;
        Ok(ConversationRoute {
            conversation_id: row.get("id"),
            org_id: row.get("org_id"),
            channel,
            external_user_id: row.get("external_thread_id"),
            transport: channel.default_transport(),
        })
    }

    async fn update_message_status(
        &self,
        org_id: &str,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self.org_tx(org_id).await?;
        let result = sqlx::query(
            "UPDATE messages SET status = $3 \
             WHERE org_id = $1 AND external_id = $2",
        )
        .bind(org_id)
        .bind(provider_message_id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            debug!(
                org = %org_id,
                provider_message_id = %provider_message_id,
                "receipt for unknown message ignored"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarStore for PgStore {
    async fn mark_no_shows(&self, grace_minutes: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE calendar_events \
             SET rsvp_status = 'noshow', noshow_at = now() \
             WHERE rsvp_status = 'pending' \
               AND canceled_at IS NULL \
               AND start_at < now() - make_interval(mins => $1::int)",
        )
        .bind(grace_minutes as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn due_reminders(
        &self,
        lookahead_minutes: i64,
        resend_after_minutes: i64,
    ) -> Result<Vec<ReminderCandidate>, StoreError> {
        let rows = sqlx::query(
            "SELECT e.id, e.org_id, e.summary, e.start_at, e.rsvp_token, c.name, c.phone \
             FROM calendar_events e \
             JOIN contacts c ON c.id = e.contact_id \
             WHERE e.rsvp_status = 'pending' \
               AND e.canceled_at IS NULL \
               AND c.phone IS NOT NULL \
               AND e.start_at BETWEEN now() AND now() + make_interval(mins => $1::int) \
               AND (e.reminder_sent_at IS NULL \
                    OR e.reminder_sent_at < now() - make_interval(mins => $2::int)) \
             ORDER BY e.start_at ASC",
        )
        .bind(lookahead_minutes as i32)
        .bind(resend_after_minutes as i32)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ReminderCandidate {
                event_id: row.get("id"),
                org_id: row.get("org_id"),
                contact_name: row.get("name"),
                contact_phone: row.get("phone"),
                summary: row.get("summary"),
                start_at: row.get::<OffsetDateTime, _>("start_at"),
                rsvp_token: row.get("rsvp_token"),
            })
            .collect())
    }

    async fn ensure_rsvp_token(&self, event_id: &str) -> Result<String, StoreError> {
        let minted = nanoid::nanoid!(32);
        // COALESCE keeps the first token ever minted for the event.
        let token = sqlx::query_scalar::<_, Option<String>>(
            "UPDATE calendar_events SET rsvp_token = COALESCE(rsvp_token, $2) \
             WHERE id = $1 RETURNING rsvp_token",
        )
        .bind(event_id)
        .bind(&minted)
        .fetch_optional(&self.pool)
        .await?
        .flatten()
        .ok_or_else(|| StoreError::NotFound {
            entity: "calendar_event",
            id: event_id.to_string(),
        })?;
        Ok(token)
    }

    async fn mark_reminder_sent(&self, event_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE calendar_events SET reminder_sent_at = now() WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_rsvp(&self, token: &str, action: RsvpAction) -> Result<String, StoreError> {
        let updated = sqlx::query_scalar::<_, String>(
            "UPDATE calendar_events SET rsvp_status = $2 \
             WHERE rsvp_token = $1 AND rsvp_status = 'pending' \
             RETURNING id",
        )
        .bind(token)
        .bind(action.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(id) => Ok(id),
            None => {
                let exists = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM calendar_events WHERE rsvp_token = $1)",
                )
                .bind(token)
                .fetch_one(&self.pool)
                .await?;
                if exists {
                    Err(StoreError::TokenConsumed(token.to_string()))
                } else {
                    Err(StoreError::NotFound {
                        entity: "rsvp_token",
                        id: token.to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn overdue_invoices(&self) -> Result<Vec<OverdueInvoice>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, org_id, customer_email, amount_cents, due_at FROM invoices \
             WHERE status = 'pending' AND due_at < now() \
             ORDER BY due_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let now = OffsetDateTime::now_utc();
        Ok(rows
            .into_iter()
            .map(|row| {
                let due_at: OffsetDateTime = row.get("due_at");
                OverdueInvoice {
                    invoice_id: row.get("id"),
                    org_id: row.get("org_id"),
                    customer_email: row.get("customer_email"),
                    amount_cents: row.get("amount_cents"),
                    due_at,
                    days_overdue: (now - due_at).whole_days(),
                }
            })
            .collect())
    }

    async fn record_dunning_step(
        &self,
        invoice_id: &str,
        step: DunningStep,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO invoice_dunning_events (id, invoice_id, step, created_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (invoice_id, step) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(invoice_id)
        .bind(step.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_org(&self, org_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE organizations SET active = false, deactivated_at = now() \
             WHERE id = $1 AND active",
        )
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MarketingStore for PgStore {
    async fn is_suppressed(&self, org_id: &str, email: &str) -> Result<bool, StoreError> {
        let suppressed = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM email_suppressions \
             WHERE org_id = $1 AND email = lower($2))",
        )
        .bind(org_id)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        Ok(suppressed)
    }

    async fn update_campaign_recipient(
        &self,
        org_id: &str,
        recipient_id: &str,
        outcome: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE campaign_recipients SET status = $3, updated_at = now() \
             WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(recipient_id)
        .bind(outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn birthday_automation_enabled(&self, org_id: &str) -> Result<bool, StoreError> {
        let enabled = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM org_automations \
             WHERE org_id = $1 AND kind = 'birthday' AND enabled)",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(enabled)
    }

    async fn orgs_with_birthday_automation(&self) -> Result<Vec<String>, StoreError> {
        let orgs = sqlx::query_scalar::<_, String>(
            "SELECT a.org_id FROM org_automations a \
             JOIN organizations o ON o.id = a.org_id AND o.active \
             WHERE a.kind = 'birthday' AND a.enabled",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(orgs)
    }

    async fn schedule_birthday_campaign(
        &self,
        org_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let campaign_id = sqlx::query_scalar::<_, String>(
            "WITH due AS ( \
                SELECT count(*) AS n FROM contacts \
                WHERE org_id = $1 \
                  AND birthday IS NOT NULL \
                  AND to_char(birthday, 'MM-DD') = to_char(now(), 'MM-DD') \
             ) \
             INSERT INTO campaigns (id, org_id, kind, status, scheduled_at) \
             SELECT $2, $1, 'birthday', 'scheduled', now() FROM due WHERE due.n > 0 \
             RETURNING id",
        )
        .bind(org_id)
        .bind(Uuid::new_v4().to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(campaign_id)
    }
}

#[async_trait]
impl ContentStore for PgStore {
    async fn complete_asset(
        &self,
        asset_id: &str,
        url: &str,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE content_assets \
             SET url = $2, metadata = $3, status = 'ready', updated_at = now() \
             WHERE id = $1",
        )
        .bind(asset_id)
        .bind(url)
        .bind(sqlx::types::Json(metadata))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "content_asset",
                id: asset_id.to_string(),
            });
        }
        Ok(())
    }

    async fn source_post(&self, post_id: &str) -> Result<Option<SourcePost>, StoreError> {
        let row = sqlx::query("SELECT id, org_id, title, body FROM posts WHERE id = $1")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| SourcePost {
            post_id: row.get("id"),
            org_id: row.get("org_id"),
            title: row.get("title"),
            body: row.get("body"),
        }))
    }

    async fn insert_derivative(
        &self,
        org_id: &str,
        source_post_id: &str,
        mode: &str,
        body: &str,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO derivative_posts (id, org_id, source_post_id, mode, body, created_at) \
             VALUES ($1, $2, $3, $4, $5, now())",
        )
        .bind(&id)
        .bind(org_id)
        .bind(source_post_id)
        .bind(mode)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn finish_repurpose_job(
        &self,
        post_id: &str,
        completed: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE repurpose_jobs \
             SET status = CASE WHEN $2 THEN 'completed' ELSE 'not_found' END, \
                 finished_at = now() \
             WHERE post_id = $1",
        )
        .bind(post_id)
        .bind(completed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn record_event(
        &self,
        org_id: &str,
        source: &str,
        kind: &str,
        payload: &Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO integration_events (id, org_id, source, kind, payload, received_at) \
             VALUES ($1, $2, $3, $4, $5, now())",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(org_id)
        .bind(source)
        .bind(kind)
        .bind(sqlx::types::Json(payload))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
