//! Usage metering service
//!
//! Enforces per-plan usage limits over the user's metered counter. The check
//! and the increment are a single conditional write in the ledger, so
//! concurrent requests can never push the counter past the plan limit.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use tierledger_shared::{Plan, UserId};

use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerStore, LedgerTx, UsageCharge, User};
use crate::plans::{PlanCatalog, UNLIMITED};

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Operations left this period (`-1` = unlimited)
    pub remaining: i64,
}

/// Current period usage for dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatus {
    pub plan: Plan,
    /// Operations used this period
    pub used: i64,
    /// Lifetime operations
    pub total: i64,
    pub limit: i64,
    pub remaining: i64,
    pub percentage: f64,
    pub free_trials_remaining: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
}

/// Remaining allowance for a counter value (`-1` when unlimited)
pub fn remaining_for(max_usage: i64, used: i64) -> i64 {
    if max_usage == UNLIMITED {
        UNLIMITED
    } else {
        (max_usage - used).max(0)
    }
}

/// Share of the allowance used, 0-100
pub fn percentage_used(max_usage: i64, used: i64) -> f64 {
    if max_usage == UNLIMITED {
        return 0.0;
    }
    if max_usage == 0 {
        return if used > 0 { 100.0 } else { 0.0 };
    }
    ((used as f64 / max_usage as f64) * 100.0).min(100.0)
}

/// Usage metering service
#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PlanCatalog>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: Arc<PlanCatalog>) -> Self {
        Self { store, catalog }
    }

    fn validate_request(requested: i64) -> BillingResult<()> {
        if requested <= 0 {
            return Err(BillingError::Validation(format!(
                "requested usage must be positive, got {}",
                requested
            )));
        }
        Ok(())
    }

    async fn load_user(&self, user_id: UserId) -> BillingResult<User> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))
    }

    /// Atomically check the plan limit and consume `requested` operations
    pub async fn check_and_consume(
        &self,
        user_id: UserId,
        plan: Plan,
        requested: i64,
    ) -> BillingResult<QuotaDecision> {
        Self::validate_request(requested)?;
        let max_usage = self.catalog.max_usage(plan);

        let charge = UsageCharge {
            requested,
            max_usage,
            consumes_free_trials: plan == Plan::Free,
        };

        if let Some(user) = self.store.consume_usage(user_id, charge).await? {
            tracing::debug!(
                user_id = %user_id,
                plan = %plan,
                requested = requested,
                period_usage = user.period_usage,
                "Usage consumed"
            );
            return Ok(QuotaDecision {
                allowed: true,
                remaining: remaining_for(max_usage, user.period_usage),
            });
        }

        // Denied, or the user does not exist
        let user = self.load_user(user_id).await?;
        let remaining = remaining_for(max_usage, user.period_usage);
        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            requested = requested,
            period_usage = user.period_usage,
            max_usage = max_usage,
            "Usage quota exceeded"
        );
        Ok(QuotaDecision {
            allowed: false,
            remaining,
        })
    }

    /// Consume against the user's current plan
    pub async fn check_and_consume_for_user(
        &self,
        user_id: UserId,
        requested: i64,
    ) -> BillingResult<QuotaDecision> {
        Self::validate_request(requested)?;
        let user = self.load_user(user_id).await?;
        self.check_and_consume(user_id, user.plan, requested).await
    }

    /// Answer the same question as [`Self::check_and_consume`] without consuming
    pub async fn preflight(&self, user_id: UserId, requested: i64) -> BillingResult<QuotaDecision> {
        Self::validate_request(requested)?;
        let user = self.load_user(user_id).await?;
        let max_usage = self.catalog.max_usage(user.plan);
        let allowed = max_usage == UNLIMITED || user.period_usage + requested <= max_usage;
        Ok(QuotaDecision {
            allowed,
            remaining: remaining_for(max_usage, user.period_usage),
        })
    }

    /// Read-only usage snapshot
    pub async fn status(&self, user_id: UserId) -> BillingResult<UsageStatus> {
        let user = self.load_user(user_id).await?;
        Ok(self.status_for(&user))
    }

    pub fn status_for(&self, user: &User) -> UsageStatus {
        let limit = self.catalog.max_usage(user.plan);
        UsageStatus {
            plan: user.plan,
            used: user.period_usage,
            total: user.total_transformations,
            limit,
            remaining: remaining_for(limit, user.period_usage),
            percentage: percentage_used(limit, user.period_usage),
            free_trials_remaining: user.free_trials_remaining,
            period_start: user.usage_period_start,
        }
    }

    /// Start a new usage period inside an open unit of work. Free-plan usage
    /// is lifetime and never reset.
    pub async fn refresh_period(
        tx: &mut dyn LedgerTx,
        user_id: UserId,
        period_start: OffsetDateTime,
    ) -> BillingResult<bool> {
        let reset = tx.reset_period_usage(user_id, period_start).await?;
        if reset {
            tracing::info!(
                user_id = %user_id,
                period_start = %period_start,
                "Usage period reset"
            );
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryLedgerStore, NewUser};

    async fn meter_with_user() -> (UsageMeter, UserId) {
        let store = Arc::new(MemoryLedgerStore::new());
        let user = store
            .create_user(NewUser {
                id: UserId::new(),
                email: "meter@example.com".into(),
                stripe_customer_id: None,
                free_trials: 100,
            })
            .await
            .unwrap();
        (
            UsageMeter::new(store, Arc::new(PlanCatalog::default())),
            user.id,
        )
    }

    #[test]
    fn test_remaining_math() {
        assert_eq!(remaining_for(100, 40), 60);
        assert_eq!(remaining_for(100, 140), 0);
        assert_eq!(remaining_for(UNLIMITED, 5_000), UNLIMITED);
        assert_eq!(percentage_used(100, 25), 25.0);
        assert_eq!(percentage_used(UNLIMITED, 25), 0.0);
        assert_eq!(percentage_used(10, 30), 100.0);
    }

    #[tokio::test]
    async fn test_consume_until_limit() {
        let (meter, user_id) = meter_with_user().await;

        let decision = meter.check_and_consume(user_id, Plan::Free, 99).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);

        let decision = meter.check_and_consume(user_id, Plan::Free, 2).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 1);

        let decision = meter.check_and_consume(user_id, Plan::Free, 1).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);

        let status = meter.status(user_id).await.unwrap();
        assert_eq!(status.used, 100);
        assert_eq!(status.free_trials_remaining, 0);
        assert_eq!(status.percentage, 100.0);
    }

    #[tokio::test]
    async fn test_unlimited_plan_reports_sentinel() {
        let (meter, user_id) = meter_with_user().await;
        let decision = meter
            .check_and_consume(user_id, Plan::Enterprise, 10_000)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, UNLIMITED);
    }

    #[tokio::test]
    async fn test_invalid_and_unknown_requests() {
        let (meter, user_id) = meter_with_user().await;
        assert!(matches!(
            meter.check_and_consume(user_id, Plan::Free, 0).await,
            Err(BillingError::Validation(_))
        ));
        assert!(matches!(
            meter.check_and_consume(UserId::new(), Plan::Free, 1).await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_preflight_does_not_consume() {
        let (meter, user_id) = meter_with_user().await;
        let decision = meter.preflight(user_id, 100).await.unwrap();
        assert!(decision.allowed);
        let decision = meter.preflight(user_id, 101).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(meter.status(user_id).await.unwrap().used, 0);
    }
}
