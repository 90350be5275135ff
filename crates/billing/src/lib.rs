//! Tierledger Billing
//!
//! Subscription reconciliation and usage metering:
//! - Webhook ingestion with signature verification and event deduplication
//! - Subscription state machine deriving each user's plan and access
//! - Append-only billing ledger (subscriptions, payments, audit log)
//! - Atomic usage quota enforcement
//! - Status, history and revenue reporting

pub mod client;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod ledger;
pub mod payments;
pub mod plans;
pub mod provider_event;
pub mod reconciliation;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;

use std::sync::Arc;
use std::time::Duration;

pub use client::{BillingProvider, StripeClient, StripeConfig};
pub use entitlement::{derive_entitlement, Entitlement, EntitlementState};
pub use error::{BillingError, BillingResult};
pub use events::SubscriptionLogBuilder;
pub use ledger::{LedgerStore, LedgerTx, MemoryLedgerStore, PgLedgerStore};
pub use plans::{PlanCatalog, PlanLimits, UNLIMITED};
pub use provider_event::{BillingEvent, ProviderEvent};
pub use reconciliation::{BillingStatus, ReconciliationService};
pub use subscriptions::{AppliedTransition, EventContext, SubscriptionStateMachine};
pub use usage::{QuotaDecision, UsageMeter, UsageStatus};
pub use webhooks::{IngestOutcome, WebhookIngester};

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: Arc<dyn LedgerStore>,
    pub catalog: Arc<PlanCatalog>,
    pub usage: UsageMeter,
    pub webhooks: Arc<WebhookIngester>,
    pub reconciliation: Arc<ReconciliationService>,
}

impl BillingService {
    /// Wire the services around one store and one provider
    pub fn new(
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn BillingProvider>,
        catalog: Arc<PlanCatalog>,
        webhook_secret: impl Into<String>,
        signature_tolerance: Duration,
    ) -> Self {
        let machine = Arc::new(SubscriptionStateMachine::new(catalog.clone()));
        let webhooks = WebhookIngester::new(store.clone(), machine.clone(), webhook_secret)
            .with_tolerance(signature_tolerance);
        let reconciliation =
            ReconciliationService::new(store.clone(), provider, machine, catalog.clone());

        Self {
            usage: UsageMeter::new(store.clone(), catalog.clone()),
            webhooks: Arc::new(webhooks),
            reconciliation: Arc::new(reconciliation),
            store,
            catalog,
        }
    }

    /// Build from a Stripe configuration, using the Stripe API as provider
    pub fn with_stripe(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<PlanCatalog>,
        config: StripeConfig,
    ) -> Self {
        let webhook_secret = config.webhook_secret.clone();
        let tolerance = config.signature_tolerance;
        let provider = Arc::new(StripeClient::new(config));
        Self::new(store, provider, catalog, webhook_secret, tolerance)
    }

    /// Bound each webhook unit of work by `deadline`
    pub fn with_webhook_deadline(mut self, deadline: Duration) -> Self {
        let ingester = self.webhooks.as_ref().clone().with_deadline(deadline);
        self.webhooks = Arc::new(ingester);
        self
    }
}
