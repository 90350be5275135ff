//! Tierledger API server

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tierledger_api::{create_router, AppState, Config, LedgerBackend};
use tierledger_billing::{
    BillingService, LedgerStore, MemoryLedgerStore, PgLedgerStore, PlanCatalog, StripeConfig,
};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tierledger_api=debug,tierledger_billing=debug,tower_http=info")
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match config.ledger_backend {
        LedgerBackend::Memory => {
            tracing::warn!("Using the in-memory ledger; state is lost on restart");
            Ok(Arc::new(MemoryLedgerStore::new()))
        }
        LedgerBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres ledger")?;
            let pool = tierledger_shared::create_pool(url, config.database_max_connections)
                .await
                .context("failed to connect to the database")?;

            if config.run_migrations {
                let migration_pool = tierledger_shared::create_migration_pool(url)
                    .await
                    .context("failed to open the migration connection")?;
                tierledger_shared::run_migrations(&migration_pool)
                    .await
                    .context("failed to run migrations")?;
                tracing::info!("Database migrations applied");
            }

            Ok(Arc::new(PgLedgerStore::new(pool)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_json);

    let stripe = StripeConfig::from_env()?;
    let catalog = Arc::new(PlanCatalog::from_env()?);
    let store = build_store(&config).await?;
    let billing = BillingService::with_stripe(store, catalog, stripe)
        .with_webhook_deadline(config.webhook_deadline);

    let bind_address = config.bind_address.clone();
    let app = create_router(AppState::new(config, billing));

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "Tierledger API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Tierledger API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
