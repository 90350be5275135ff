//! Shared fixtures: ledger harnesses, a scripted provider and event builders

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use time::OffsetDateTime;

use tierledger_billing::ledger::{LedgerStore, MemoryLedgerStore, NewUser, PgLedgerStore, User};
use tierledger_billing::provider_event::SubscriptionSnapshot;
use tierledger_billing::webhooks::compute_signature_header;
use tierledger_billing::{
    BillingError, BillingProvider, BillingResult, BillingService, IngestOutcome, PlanCatalog,
};
use tierledger_shared::{Plan, UserId};
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_integration_secret";
pub const PRICE_BASIC: &str = "price_basic";
pub const PRICE_PRO: &str = "price_pro";
pub const PRICE_ENTERPRISE: &str = "price_enterprise";

pub const DAY: i64 = 86_400;

pub fn catalog() -> Arc<PlanCatalog> {
    Arc::new(PlanCatalog::with_price_ids(
        Some(PRICE_BASIC.into()),
        Some(PRICE_PRO.into()),
        Some(PRICE_ENTERPRISE.into()),
    ))
}

pub fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Provider double: keeps the provider-side subscription state and can be
/// told to fail the next call
#[derive(Default)]
pub struct FakeProvider {
    subscriptions: Mutex<HashMap<String, SubscriptionSnapshot>>,
    fail_with_timeout: Mutex<bool>,
    calls: Mutex<u32>,
}

impl FakeProvider {
    pub fn seed(&self, snapshot: SubscriptionSnapshot) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(snapshot.external_id.clone(), snapshot);
    }

    pub fn fail_next_with_timeout(&self) {
        *self.fail_with_timeout.lock().unwrap() = true;
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    fn update<F>(&self, subscription_id: &str, f: F) -> BillingResult<SubscriptionSnapshot>
    where
        F: FnOnce(&mut SubscriptionSnapshot),
    {
        *self.calls.lock().unwrap() += 1;
        let mut fail = self.fail_with_timeout.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(BillingError::Timeout("stripe fake".into()));
        }
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let snapshot = subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::Provider(format!("No such subscription: {}", subscription_id)))?;
        f(snapshot);
        Ok(snapshot.clone())
    }
}

#[async_trait]
impl BillingProvider for FakeProvider {
    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        plan: Plan,
        price_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        self.update(subscription_id, |s| {
            s.price_id = Some(price_id.to_string());
            s.metadata.insert("plan", plan.as_str());
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<SubscriptionSnapshot> {
        self.update(subscription_id, |s| {
            if at_period_end {
                s.cancel_at_period_end = true;
            } else {
                s.status = tierledger_shared::SubscriptionStatus::Canceled;
                s.canceled_at = Some(OffsetDateTime::now_utc());
            }
        })
    }

    async fn resume_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        self.update(subscription_id, |s| s.cancel_at_period_end = false)
    }
}

pub struct Harness {
    pub store: Arc<dyn LedgerStore>,
    pub provider: Arc<FakeProvider>,
    pub billing: BillingService,
    run_id: String,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryLedgerStore::new()))
    }

    pub fn with_store(store: Arc<dyn LedgerStore>) -> Self {
        let provider = Arc::new(FakeProvider::default());
        let billing = BillingService::new(
            store.clone(),
            provider.clone(),
            catalog(),
            WEBHOOK_SECRET,
            Duration::from_secs(300),
        );
        Self {
            store,
            provider,
            billing,
            run_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Harness over Postgres, or `None` when `DATABASE_URL` is not set
    pub async fn postgres() -> Option<Self> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set; skipping Postgres ledger run");
            return None;
        };
        let migration_pool = tierledger_shared::create_migration_pool(&url)
            .await
            .expect("Failed to create migration pool");
        tierledger_shared::run_migrations(&migration_pool)
            .await
            .expect("Failed to run migrations");
        let pool = tierledger_shared::create_pool(&url, 16)
            .await
            .expect("Failed to create pool");
        Some(Self::with_store(Arc::new(PgLedgerStore::new(pool))))
    }

    /// `base` suffixed with this harness's run id. Scenarios that also run
    /// against a shared database name customers, subscriptions and events
    /// through this so repeated runs never collide.
    pub fn id(&self, base: &str) -> String {
        format!("{}_{}", base, self.run_id)
    }

    pub async fn user(&self, customer_id: &str) -> User {
        self.store
            .create_user(NewUser {
                id: UserId::new(),
                email: format!("{}@example.com", customer_id),
                stripe_customer_id: Some(customer_id.to_string()),
                free_trials: 100,
            })
            .await
            .unwrap()
    }

    pub async fn reload(&self, user_id: UserId) -> User {
        self.store.get_user(user_id).await.unwrap().unwrap()
    }

    pub async fn deliver(&self, body: &str) -> BillingResult<IngestOutcome> {
        let header = sign(body);
        self.billing.webhooks.ingest(body, &header).await
    }
}

/// Run an `async fn(Arc<Harness>)` scenario on the in-memory ledger, and on
/// Postgres when `DATABASE_URL` is set
macro_rules! on_every_ledger {
    ($scenario:ident) => {
        mod $scenario {
            #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
            async fn memory() {
                super::$scenario(std::sync::Arc::new(crate::support::Harness::new())).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
            async fn postgres() {
                if let Some(harness) = crate::support::Harness::postgres().await {
                    super::$scenario(std::sync::Arc::new(harness)).await;
                }
            }
        }
    };
}
pub(crate) use on_every_ledger;

pub fn sign(body: &str) -> String {
    compute_signature_header(body, WEBHOOK_SECRET, now_ts()).unwrap()
}

pub fn envelope(event_id: &str, event_type: &str, created: i64, object: Value) -> String {
    json!({
        "id": event_id,
        "object": "event",
        "type": event_type,
        "created": created,
        "data": {"object": object}
    })
    .to_string()
}

/// Provider-shaped subscription object
pub fn subscription_object(
    subscription_id: &str,
    customer_id: &str,
    status: &str,
    price_id: &str,
    period_start: i64,
    period_end: i64,
    cancel_at_period_end: bool,
) -> Value {
    json!({
        "id": subscription_id,
        "object": "subscription",
        "customer": customer_id,
        "status": status,
        "current_period_start": period_start,
        "current_period_end": period_end,
        "cancel_at_period_end": cancel_at_period_end,
        "currency": "usd",
        "items": {"object": "list", "data": [{
            "id": "si_1",
            "quantity": 1,
            "price": {
                "id": price_id,
                "unit_amount": 2900,
                "currency": "usd",
                "recurring": {"interval": "month", "interval_count": 1}
            }
        }]},
        "metadata": {}
    })
}

pub fn invoice_object(
    invoice_id: &str,
    customer_id: &str,
    payment_intent: &str,
    amount: i64,
    currency: &str,
) -> Value {
    json!({
        "id": invoice_id,
        "object": "invoice",
        "customer": customer_id,
        "payment_intent": payment_intent,
        "amount_due": amount,
        "amount_paid": amount,
        "currency": currency,
        "status_transitions": {"paid_at": now_ts()},
        "lines": {"data": [{"price": {"id": PRICE_PRO}}]}
    })
}

pub fn charge_object(payment_intent: &str, amount: i64, refunded: i64) -> Value {
    json!({
        "id": format!("ch_{}", payment_intent),
        "object": "charge",
        "amount": amount,
        "amount_refunded": refunded,
        "currency": "usd",
        "payment_intent": payment_intent,
        "refunds": {"data": [{"reason": "requested_by_customer"}]}
    })
}

/// Deliver a `customer.subscription.created` for a fresh month-long period
pub async fn subscribe(harness: &Harness, event_id: &str, customer_id: &str, price_id: &str) {
    let now = now_ts();
    let object = subscription_object(
        &format!("sub_{}", customer_id),
        customer_id,
        "active",
        price_id,
        now - DAY,
        now + 29 * DAY,
        false,
    );
    let outcome = harness
        .deliver(&envelope(event_id, "customer.subscription.created", now, object.clone()))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Applied { .. }), "{:?}", outcome);

    harness
        .provider
        .seed(SubscriptionSnapshot::from_object(&object).unwrap());
}
