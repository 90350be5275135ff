//! Tierledger background worker
//!
//! Runs scheduled billing maintenance against the shared ledger.

mod jobs;

use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::JobScheduler;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tierledger_billing::{BillingService, PgLedgerStore, PlanCatalog, StripeConfig};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tierledger_worker=debug,tierledger_billing=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    let schedule = std::env::var("LAPSE_SWEEP_SCHEDULE")
        .unwrap_or_else(|_| jobs::DEFAULT_LAPSE_SWEEP_SCHEDULE.to_string());

    let pool = tierledger_shared::create_pool(&database_url, max_connections)
        .await
        .context("failed to connect to the database")?;
    let billing = BillingService::with_stripe(
        Arc::new(PgLedgerStore::new(pool)),
        Arc::new(PlanCatalog::from_env()?),
        StripeConfig::from_env()?,
    );

    // Catch up on anything that lapsed while the worker was down
    jobs::run_lapse_sweep(&billing.reconciliation).await;

    let mut scheduler = JobScheduler::new().await?;
    scheduler
        .add(jobs::lapse_sweep_job(&schedule, billing.reconciliation.clone())?)
        .await?;
    scheduler.start().await?;
    tracing::info!(schedule = %schedule, "Tierledger worker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutting down worker");
    scheduler.shutdown().await?;
    Ok(())
}
