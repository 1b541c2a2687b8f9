//! Queue worker process.
//!
//! Runs one harness per queue plus the interval scheduler. On SIGTERM or
//! ctrl-c the workers stop pulling, in-flight jobs get a bounded drain
//! window, then the pool and queue connection are closed; a drain that
//! cannot finish in time force-exits non-zero and leaves redelivery to the
//! stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use obx_core::{IdempotencyGuard, InMemoryIdemStore};
use obx_jobs::processors::{
    AlertsProcessor, BillingRenewalsProcessor, CalendarTickProcessor, ContentRenderProcessor,
    EmailProvider, EmailSendProcessor, GenerationProvider, RenderedAsset, RepurposeProcessor,
    RestEmailProvider, RestGenerationProvider,
};
use obx_jobs::{
    DlqPublisher, JobError, JobProcessor, JobQueue, NoShowSweep, QueueName, ReminderDispatch,
    Scheduler, SweepConfig, WorkerHarness,
};
use obx_store::{resolve_conventions, PgStore};
use obx_telemetry::install as init_telemetry;
use obx_transport::{TransportRegistry, TransportRouter};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Degraded email path when no provider is configured: the job still
/// completes and the outcome stays auditable, nothing actually leaves.
struct NullEmailProvider;

#[async_trait]
impl EmailProvider for NullEmailProvider {
    async fn send(&self, to: &str, subject: &str, _html: &str) -> Result<(), JobError> {
        warn!(to = %to, subject = %subject, "email provider not configured, delivery skipped");
        Ok(())
    }
}

/// Render jobs cannot degrade gracefully: without a provider there is no
/// asset URL to write back, so they dead-letter with a clear reason.
struct DisabledGenerationProvider;

#[async_trait]
impl GenerationProvider for DisabledGenerationProvider {
    async fn render(&self, _prompt: &str) -> Result<RenderedAsset, JobError> {
        Err(JobError::permanent(
            "E_CONFIG",
            "content generation provider not configured",
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("obx-worker")?;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL required")?;
    let nats_url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://127.0.0.1:4222".into());
    let drain_timeout = Duration::from_secs(
        std::env::var("OBX_DRAIN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10),
    );

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("connect postgres")?;
    let conventions = resolve_conventions(&pool).await;
    let store = Arc::new(PgStore::new(pool.clone(), conventions));

    let nats = async_nats::connect(&nats_url)
        .await
        .with_context(|| format!("connect NATS at {nats_url}"))?;
    let js = async_nats::jetstream::new(nats.clone());
    let queue = JobQueue::new(js.clone()).await?;
    let dlq = DlqPublisher::new(js.clone()).await?;

    let http = reqwest::Client::new();
    let registry = Arc::new(TransportRegistry::from_env(&http));
    let guard = IdempotencyGuard::new(Arc::new(InMemoryIdemStore::new()), 24);
    let router = Arc::new(TransportRouter::new(registry, store.clone(), guard));

    let email: Arc<dyn EmailProvider> = match RestEmailProvider::from_env(&http) {
        Some(provider) => Arc::new(provider),
        None => {
            warn!("EMAIL_API_URL unset, using null email provider");
            Arc::new(NullEmailProvider)
        }
    };
    let generator: Arc<dyn GenerationProvider> = match RestGenerationProvider::from_env(&http) {
        Some(provider) => Arc::new(provider),
        None => {
            warn!("CONTENT_API_URL unset, render jobs will dead-letter");
            Arc::new(DisabledGenerationProvider)
        }
    };

    let enabled = enabled_queues()?;
    let processors: Vec<(QueueName, Arc<dyn JobProcessor>)> = vec![
        (
            QueueName::EmailSend,
            Arc::new(EmailSendProcessor::new(
                store.clone(),
                store.clone(),
                email.clone(),
            )),
        ),
        (
            QueueName::ContentRender,
            Arc::new(ContentRenderProcessor::new(store.clone(), generator)),
        ),
        (
            QueueName::BillingRenewals,
            Arc::new(BillingRenewalsProcessor::new(store.clone(), email)),
        ),
        (
            QueueName::CalendarTick,
            Arc::new(CalendarTickProcessor::new(store.clone())),
        ),
        (
            QueueName::Repurpose,
            Arc::new(RepurposeProcessor::new(store.clone())),
        ),
        (
            QueueName::Alerts,
            Arc::new(AlertsProcessor::new(store.clone())),
        ),
    ];

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx)?;

    let mut tasks: JoinSet<Result<bool>> = JoinSet::new();
    let mut running = 0;
    for (queue_name, processor) in processors {
        if !enabled.contains(&queue_name) {
            continue;
        }
        let harness = WorkerHarness::new(js.clone(), queue_name.spec(), processor, dlq.clone());
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { harness.run(rx, drain_timeout).await });
        running += 1;
    }

    // Per-queue deployments typically run the scheduler in exactly one
    // process; the dedup ids and conditional sweeps keep extras harmless.
    let scheduler_enabled = std::env::var("OBX_SCHEDULER")
        .map(|v| !v.eq_ignore_ascii_case("false"))
        .unwrap_or(true);
    if scheduler_enabled {
        let sweep_config = SweepConfig::from_env();
        let scheduler = Scheduler::new(
            queue,
            store.clone(),
            NoShowSweep::new(store.clone(), sweep_config.grace_minutes),
            ReminderDispatch::new(store.clone(), router, sweep_config),
            scheduler_config_from_env(),
        );
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            scheduler.run(rx).await?;
            Ok(true)
        });
    }

    info!("worker running {running} of {} queues", QueueName::ALL.len());

    // The hard deadline only starts counting once shutdown is requested;
    // until then the worker runs indefinitely.
    let deadline = drain_timeout + Duration::from_secs(5);
    let mut deadline_rx = shutdown_rx.clone();
    let drain_all = async move {
        let mut clean = true;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(drained)) => clean &= drained,
                Ok(Err(err)) => {
                    error!(error = %err, "worker task failed");
                    clean = false;
                }
                Err(err) => {
                    error!(error = %err, "worker task panicked");
                    clean = false;
                }
            }
        }
        clean
    };
    let outcome = tokio::select! {
        clean = drain_all => Some(clean),
        _ = async {
            while !*deadline_rx.borrow() {
                if deadline_rx.changed().await.is_err() {
                    break;
                }
            }
            tokio::time::sleep(deadline).await;
        } => None,
    };

    pool.close().await;
    if let Err(err) = nats.flush().await {
        warn!(error = %err, "NATS flush on shutdown failed");
    }

    match outcome {
        None => {
            error!("shutdown deadline elapsed with jobs still running, forcing exit");
            std::process::exit(1);
        }
        Some(false) => {
            error!("shutdown was not clean, exiting non-zero");
            std::process::exit(1);
        }
        Some(true) => {
            info!("worker stopped cleanly");
            Ok(())
        }
    }
}

/// Queues this process should run. `OBX_QUEUES=email-send,repurpose` lets a
/// deployment dedicate one process per queue; unset means all six.
fn enabled_queues() -> Result<Vec<QueueName>> {
    let Ok(raw) = std::env::var("OBX_QUEUES") else {
        return Ok(QueueName::ALL.to_vec());
    };
    let mut queues = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let queue = QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == token)
            .with_context(|| format!("unknown queue in OBX_QUEUES: {token}"))?;
        queues.push(queue);
    }
    anyhow::ensure!(!queues.is_empty(), "OBX_QUEUES selected no queues");
    Ok(queues)
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) -> Result<()> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("install SIGTERM handler")?;

    tokio::spawn(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;

        info!("termination signal received, draining");
        let _ = shutdown_tx.send(true);
    });
    Ok(())
}

fn scheduler_config_from_env() -> obx_jobs::scheduler::ScheduleConfig {
    let mut config = obx_jobs::scheduler::ScheduleConfig::default();
    if let Some(secs) = std::env::var("OBX_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config.sweep_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = std::env::var("OBX_DAILY_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config.daily_interval = Duration::from_secs(secs);
    }
    config
}
