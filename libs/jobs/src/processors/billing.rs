//! `billing:renewals` queue: daily dunning tick.
//!
//! Pure read-then-branch-then-write per invoice row; the per-step dunning
//! record makes the whole tick idempotent, so a retried or double-enqueued
//! tick never double-notifies.

use std::sync::Arc;

use async_trait::async_trait;
use obx_store::{BillingStore, DunningStep};
use tracing::info;

use crate::{processors::EmailProvider, Job, JobError, JobProcessor};

const OVERDUE_NOTICE_DAYS: i64 = 2;
const DEACTIVATE_DAYS: i64 = 8;

pub struct BillingRenewalsProcessor {
    billing: Arc<dyn BillingStore>,
    email: Arc<dyn EmailProvider>,
}

impl BillingRenewalsProcessor {
    pub fn new(billing: Arc<dyn BillingStore>, email: Arc<dyn EmailProvider>) -> Self {
        Self { billing, email }
    }
}

#[async_trait]
impl JobProcessor for BillingRenewalsProcessor {
    async fn process(&self, _job: &Job) -> Result<(), JobError> {
        let invoices = self.billing.overdue_invoices().await?;
        info!(count = invoices.len(), "billing renewals tick");

        for invoice in invoices {
            if invoice.days_overdue >= DEACTIVATE_DAYS {
                if self
                    .billing
                    .record_dunning_step(&invoice.invoice_id, DunningStep::Deactivated)
                    .await?
                {
                    self.billing.deactivate_org(&invoice.org_id).await?;
                    info!(
                        org = %invoice.org_id,
                        invoice = %invoice.invoice_id,
                        days = invoice.days_overdue,
                        "organization deactivated for non-payment"
                    );
                }
            } else if invoice.days_overdue >= OVERDUE_NOTICE_DAYS {
                if self
                    .billing
                    .record_dunning_step(&invoice.invoice_id, DunningStep::OverdueNotice)
                    .await?
                {
                    self.email
                        .send(
                            &invoice.customer_email,
                            "Your invoice is overdue",
                            &notice_html(&invoice.invoice_id, invoice.amount_cents),
                        )
                        .await?;
                }
            } else if self
                .billing
                .record_dunning_step(&invoice.invoice_id, DunningStep::DueReminder)
                .await?
            {
                self.email
                    .send(
                        &invoice.customer_email,
                        "Payment reminder",
                        &reminder_html(&invoice.invoice_id, invoice.amount_cents),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

fn reminder_html(invoice_id: &str, amount_cents: i64) -> String {
    format!(
        "<p>Invoice {invoice_id} for {} is due. Please settle it to keep your account active.</p>",
        format_amount(amount_cents)
    )
}

fn notice_html(invoice_id: &str, amount_cents: i64) -> String {
    format!(
        "<p>Invoice {invoice_id} for {} is overdue. Your account will be deactivated if it stays unpaid.</p>",
        format_amount(amount_cents)
    )
}

fn format_amount(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use obx_store::{InMemoryStore, MemInvoice};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::{Duration, OffsetDateTime};

    struct CountingProvider {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl EmailProvider for CountingProvider {
        async fn send(&self, _to: &str, _subject: &str, _html: &str) -> Result<(), JobError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn invoice(id: &str, org: &str, days_overdue: i64) -> MemInvoice {
        MemInvoice {
            id: id.into(),
            org_id: org.into(),
            customer_email: "billing@example.com".into(),
            amount_cents: 4900,
            status: "pending".into(),
            due_at: OffsetDateTime::now_utc() - Duration::days(days_overdue) - Duration::minutes(5),
        }
    }

    fn tick() -> Job {
        Job {
            id: "j-1".into(),
            queue: crate::QueueName::BillingRenewals,
            payload: json!({}),
            enqueued_at: OffsetDateTime::UNIX_EPOCH,
            run_at: None,
        }
    }

    #[tokio::test]
    async fn branches_by_days_overdue() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_invoice(invoice("inv-due", "org-a", 0)).await;
        store.seed_invoice(invoice("inv-late", "org-b", 3)).await;
        store.seed_invoice(invoice("inv-dead", "org-c", 10)).await;
        let email = Arc::new(CountingProvider {
            sent: AtomicUsize::new(0),
        });
        let processor = BillingRenewalsProcessor::new(store.clone(), email.clone());

        processor.process(&tick()).await.unwrap();

        // Reminder + notice, no mail for the deactivation step.
        assert_eq!(email.sent.load(Ordering::SeqCst), 2);
        assert!(!store.org_active("org-c").await);
        assert!(store.org_active("org-a").await);
        assert!(store.org_active("org-b").await);
    }

    #[tokio::test]
    async fn second_tick_is_a_noop() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_invoice(invoice("inv-late", "org-b", 3)).await;
        let email = Arc::new(CountingProvider {
            sent: AtomicUsize::new(0),
        });
        let processor = BillingRenewalsProcessor::new(store.clone(), email.clone());

        processor.process(&tick()).await.unwrap();
        processor.process(&tick()).await.unwrap();

        assert_eq!(email.sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn amounts_format_as_dollars() {
        assert_eq!(format_amount(4900), "$49.00");
        assert_eq!(format_amount(105), "$1.05");
    }
}
