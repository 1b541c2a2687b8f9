//! Interval scheduler for cron-equivalent work: the daily billing tick, the
//! per-organization calendar tick, and the calendar sweeps.
//!
//! Ticks are enqueued with a date-scoped dedup id, so overlapping scheduler
//! processes (or a restart) collapse to one job per period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use obx_store::{InboxStore, MarketingStore};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{EnqueueOptions, JobQueue, NoShowSweep, QueueName, ReminderDispatch};

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub daily_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_interval: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

pub struct Scheduler<S: InboxStore> {
    queue: JobQueue,
    marketing: Arc<dyn MarketingStore>,
    no_show: NoShowSweep,
    reminders: ReminderDispatch<S>,
    config: ScheduleConfig,
}

impl<S: InboxStore> Scheduler<S> {
    pub fn new(
        queue: JobQueue,
        marketing: Arc<dyn MarketingStore>,
        no_show: NoShowSweep,
        reminders: ReminderDispatch<S>,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            queue,
            marketing,
            no_show,
            reminders,
            config,
        }
    }

    /// Runs the tickers until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut daily = tokio::time::interval(self.config.daily_interval);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler stopping");
                        return Ok(());
                    }
                }
                _ = daily.tick() => {
                    if let Err(err) = self.daily_tick().await {
                        warn!(error = %err, "daily tick failed");
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_tick().await;
                }
            }
        }
    }

    async fn daily_tick(&self) -> Result<()> {
        let today = OffsetDateTime::now_utc().date();

        self.queue
            .enqueue(
                QueueName::BillingRenewals,
                json!({}),
                EnqueueOptions {
                    delay: None,
                    dedup_id: Some(format!("billing:renewals:{today}")),
                },
            )
            .await?;

        for org_id in self.marketing.orgs_with_birthday_automation().await? {
            self.queue
                .enqueue(
                    QueueName::CalendarTick,
                    json!({ "orgId": org_id }),
                    EnqueueOptions {
                        delay: None,
                        dedup_id: Some(format!("calendar:tick:{org_id}:{today}")),
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn sweep_tick(&self) {
        if let Err(err) = self.no_show.run().await {
            warn!(error = %err, "no-show sweep failed");
        }
        match self.reminders.run().await {
            Ok(sent) if sent > 0 => info!(sent, "reminders dispatched"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "reminder dispatch failed"),
        }
    }
}
