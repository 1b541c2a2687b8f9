//! Gateway entry point: wires Postgres, the transport registry, and the
//! webhook routes.

use std::sync::Arc;

use anyhow::{Context, Result};
use obx_core::{IdempotencyGuard, InMemoryIdemStore};
use obx_gateway::{app, AppState, WebhookSecrets};
use obx_store::{resolve_conventions, PgStore};
use obx_telemetry::install as init_telemetry;
use obx_transport::{TransportRegistry, TransportRouter};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("obx-gateway")?;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL required")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("connect postgres")?;

    let conventions = resolve_conventions(&pool).await;
    let store = Arc::new(PgStore::new(pool, conventions));

    let http = reqwest::Client::new();
    let registry = Arc::new(TransportRegistry::from_env(&http));
    let guard = IdempotencyGuard::new(Arc::new(InMemoryIdemStore::new()), 24);
    let router = Arc::new(TransportRouter::new(registry, store.clone(), guard));

    let state = AppState {
        store,
        router,
        secrets: Arc::new(WebhookSecrets::from_env()?),
    };

    let addr: std::net::SocketAddr = std::env::var("BIND")
        .unwrap_or_else(|_| "0.0.0.0:8080".into())
        .parse()
        .context("parse BIND")?;
    tracing::info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state).into_make_service()).await?;
    Ok(())
}
