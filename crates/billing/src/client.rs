//! Stripe client configuration and the provider seam

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    CancelSubscription, Client, Subscription, SubscriptionId, UpdateSubscription,
    UpdateSubscriptionItems,
};

use tierledger_shared::Plan;

use crate::error::{BillingError, BillingResult};
use crate::provider_event::{SubscriptionSnapshot, PLAN_METADATA_KEY};
use crate::webhooks::DEFAULT_SIGNATURE_TOLERANCE;

/// Default bound on a single provider API operation
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Accepted clock skew for webhook signatures
    pub signature_tolerance: Duration,
    /// Upper bound for one provider API operation
    pub request_timeout: Duration,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: webhook_secret.into(),
            signature_tolerance: DEFAULT_SIGNATURE_TOLERANCE,
            request_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let mut config = Self::new(secret_key, webhook_secret);
        if let Some(secs) = env_secs("STRIPE_WEBHOOK_TOLERANCE_SECS")? {
            config.signature_tolerance = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("STRIPE_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn env_secs(var: &str) -> BillingResult<Option<u64>> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| BillingError::Config(format!("{} must be a whole number of seconds", var))),
        Err(_) => Ok(None),
    }
}

/// Outbound calls to the payment provider.
///
/// Every method returns the provider's view of the subscription after the
/// call so the caller can apply it through the state machine.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Move the subscription's first item to `price_id` with proration
    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        plan: Plan,
        price_id: &str,
    ) -> BillingResult<SubscriptionSnapshot>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<SubscriptionSnapshot>;

    /// Clear a pending cancel-at-period-end
    async fn resume_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionSnapshot>;
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> BillingResult<T>
    where
        F: Future<Output = BillingResult<T>> + Send,
    {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    operation = operation,
                    timeout_ms = self.config.request_timeout.as_millis() as u64,
                    "Stripe call timed out"
                );
                Err(BillingError::Timeout(format!("stripe {}", operation)))
            }
        }
    }
}

fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
    subscription_id
        .parse::<SubscriptionId>()
        .map_err(|e| BillingError::Validation(format!("Invalid subscription ID: {}", e)))
}

fn to_snapshot(subscription: &Subscription) -> BillingResult<SubscriptionSnapshot> {
    let value = serde_json::to_value(subscription)
        .map_err(|e| BillingError::Provider(format!("unreadable subscription: {}", e)))?;
    SubscriptionSnapshot::from_object(&value)
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        plan: Plan,
        price_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let subscription = self
            .bounded("change_subscription_price", async {
                let current = Subscription::retrieve(self.inner(), &sub_id, &[]).await?;
                let item_id = current
                    .items
                    .data
                    .first()
                    .map(|item| item.id.to_string())
                    .ok_or_else(|| {
                        BillingError::Provider(format!(
                            "subscription {} has no items",
                            subscription_id
                        ))
                    })?;

                let mut metadata = std::collections::HashMap::new();
                metadata.insert(PLAN_METADATA_KEY.to_string(), plan.as_str().to_string());

                let params = UpdateSubscription {
                    items: Some(vec![UpdateSubscriptionItems {
                        id: Some(item_id),
                        price: Some(price_id.to_string()),
                        ..Default::default()
                    }]),
                    metadata: Some(metadata),
                    proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
                    ..Default::default()
                };
                Ok::<_, BillingError>(Subscription::update(self.inner(), &sub_id, params).await?)
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            plan = %plan,
            price_id = %price_id,
            "Changed subscription price"
        );
        to_snapshot(&subscription)
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<SubscriptionSnapshot> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let subscription = self
            .bounded("cancel_subscription", async {
                if at_period_end {
                    let params = UpdateSubscription {
                        cancel_at_period_end: Some(true),
                        ..Default::default()
                    };
                    Ok::<_, BillingError>(Subscription::update(self.inner(), &sub_id, params).await?)
                } else {
                    let params = CancelSubscription {
                        cancellation_details: None,
                        invoice_now: None,
                        prorate: None,
                    };
                    Ok::<_, BillingError>(Subscription::cancel(self.inner(), &sub_id, params).await?)
                }
            })
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            at_period_end = at_period_end,
            "Cancelled subscription"
        );
        to_snapshot(&subscription)
    }

    async fn resume_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let subscription = self
            .bounded("resume_subscription", async {
                let params = UpdateSubscription {
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                };
                Ok::<_, BillingError>(Subscription::update(self.inner(), &sub_id, params).await?)
            })
            .await?;

        tracing::info!(subscription_id = %subscription.id, "Resumed subscription");
        to_snapshot(&subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StripeConfig::new("sk_test_123", "whsec_123");
        assert_eq!(config.request_timeout, DEFAULT_PROVIDER_TIMEOUT);
        assert_eq!(config.signature_tolerance, Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_subscription_id() {
        assert!(matches!(
            parse_subscription_id("not-a-sub"),
            Err(BillingError::Validation(_))
        ));
        assert!(parse_subscription_id("sub_123").is_ok());
    }
}
