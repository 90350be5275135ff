//! Reconciliation and stats service
//!
//! Read side: per-user status, ledger history and admin aggregates.
//! Write side: user-initiated plan changes, cancellations and reactivations.
//! Those call the provider first and only then apply the provider's answer
//! through the state machine, so a failed or timed-out call leaves the ledger
//! untouched.

use std::sync::Arc;

use serde::Serialize;
use time::{Date, Month, OffsetDateTime};

use tierledger_shared::{to_major_units, Plan, UserId};

use crate::client::BillingProvider;
use crate::entitlement::{entitlement_for_user, EntitlementState};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{
    HistoryEntry, HistoryKind, LedgerStore, Page, PageRequest, PlanCount, SubscriptionLog,
    SubscriptionRecord, MAX_PAGE_LIMIT,
};
use crate::plans::PlanCatalog;
use crate::provider_event::{BillingEvent, SubscriptionChange, SubscriptionSnapshot};
use crate::subscriptions::{AppliedTransition, EventContext, SubscriptionStateMachine};
use crate::usage::{UsageMeter, UsageStatus};

/// Longest monthly revenue window
pub const MAX_REVENUE_MONTHS: u32 = 24;

/// What the status endpoint shows a user
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingStatus {
    pub plan: Plan,
    pub is_active: bool,
    pub state: EntitlementState,
    pub subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub usage: UsageStatus,
}

/// Revenue for one currency, in minor and major units
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueSummary {
    pub currency: String,
    pub payment_count: i64,
    pub gross_minor: i64,
    pub refunded_minor: i64,
    pub net_minor: i64,
    pub gross: f64,
    pub refunded: f64,
    pub net: f64,
}

impl RevenueSummary {
    fn new(currency: String, gross_minor: i64, refunded_minor: i64, payment_count: i64) -> Self {
        let net_minor = gross_minor - refunded_minor;
        Self {
            gross: to_major_units(gross_minor, &currency),
            refunded: to_major_units(refunded_minor, &currency),
            net: to_major_units(net_minor, &currency),
            currency,
            payment_count,
            gross_minor,
            refunded_minor,
            net_minor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub active_subscriptions: i64,
    pub revenue: Vec<RevenueSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyRevenue {
    /// `YYYY-MM`, UTC
    pub month: String,
    #[serde(flatten)]
    pub revenue: RevenueSummary,
}

/// First instant of the month `months - 1` months before `now`'s month
pub fn window_start(now: OffsetDateTime, months: u32) -> BillingResult<OffsetDateTime> {
    let months = months.clamp(1, MAX_REVENUE_MONTHS) as i32;
    let index = now.year() * 12 + i32::from(u8::from(now.month())) - 1 - (months - 1);
    let year = index.div_euclid(12);
    let month = Month::try_from((index.rem_euclid(12) + 1) as u8)
        .map_err(|e| BillingError::Validation(format!("invalid month: {}", e)))?;
    let date = Date::from_calendar_date(year, month, 1)
        .map_err(|e| BillingError::Validation(format!("invalid date: {}", e)))?;
    Ok(date.midnight().assume_utc())
}

pub struct ReconciliationService {
    store: Arc<dyn LedgerStore>,
    provider: Arc<dyn BillingProvider>,
    machine: Arc<SubscriptionStateMachine>,
    meter: UsageMeter,
    catalog: Arc<PlanCatalog>,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn BillingProvider>,
        machine: Arc<SubscriptionStateMachine>,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        let meter = UsageMeter::new(store.clone(), catalog.clone());
        Self {
            store,
            provider,
            machine,
            meter,
            catalog,
        }
    }

    // =========================================================================
    // Read side
    // =========================================================================

    pub async fn status(&self, user_id: UserId) -> BillingResult<BillingStatus> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;
        let subscription = self.store.current_subscription(user_id).await?;
        let entitlement =
            entitlement_for_user(&user, subscription.as_ref(), OffsetDateTime::now_utc());

        Ok(BillingStatus {
            plan: user.plan,
            is_active: user.is_active,
            state: entitlement.state,
            subscription_id: subscription.as_ref().map(|s| s.external_id.clone()),
            current_period_end: subscription.as_ref().map(|s| s.current_period_end),
            cancel_at_period_end: subscription.as_ref().is_some_and(|s| s.cancel_at_period_end),
            usage: self.meter.status_for(&user),
        })
    }

    pub async fn overview(&self) -> BillingResult<Overview> {
        let totals = self.store.ledger_totals().await?;
        Ok(Overview {
            active_subscriptions: totals.active_subscriptions,
            revenue: totals
                .revenue
                .into_iter()
                .map(|r| {
                    RevenueSummary::new(r.currency, r.gross_minor, r.refunded_minor, r.payment_count)
                })
                .collect(),
        })
    }

    /// Users per plan; plans without users are reported with zero counts
    pub async fn plan_distribution(&self) -> BillingResult<Vec<PlanCount>> {
        let counts = self.store.plan_distribution().await?;
        Ok(Plan::ALL
            .iter()
            .map(|plan| {
                counts
                    .iter()
                    .find(|c| c.plan == *plan)
                    .cloned()
                    .unwrap_or(PlanCount {
                        plan: *plan,
                        active_users: 0,
                        inactive_users: 0,
                    })
            })
            .collect())
    }

    pub async fn monthly_revenue(&self, months: u32) -> BillingResult<Vec<MonthlyRevenue>> {
        let since = window_start(OffsetDateTime::now_utc(), months)?;
        let rows = self.store.monthly_revenue(since).await?;
        Ok(rows
            .into_iter()
            .map(|row| MonthlyRevenue {
                month: row.month,
                revenue: RevenueSummary::new(
                    row.currency,
                    row.gross_minor,
                    row.refunded_minor,
                    row.payment_count,
                ),
            })
            .collect())
    }

    pub async fn history(
        &self,
        user_id: UserId,
        kind: Option<HistoryKind>,
        page: PageRequest,
    ) -> BillingResult<Page<HistoryEntry>> {
        self.store.list_history(user_id, kind, page).await
    }

    pub async fn recent_logs(
        &self,
        user_id: Option<UserId>,
        limit: u32,
    ) -> BillingResult<Vec<SubscriptionLog>> {
        self.store
            .recent_logs(user_id, limit.clamp(1, MAX_PAGE_LIMIT))
            .await
    }

    // =========================================================================
    // Write side
    // =========================================================================

    async fn current_subscription(&self, user_id: UserId) -> BillingResult<SubscriptionRecord> {
        self.store
            .current_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription for user {}", user_id)))
    }

    /// Move the user's subscription to another paid plan
    pub async fn change_plan(&self, user_id: UserId, plan: Plan) -> BillingResult<AppliedTransition> {
        if !plan.is_paid() {
            return Err(BillingError::Validation(
                "cancel the subscription to move to the free plan".into(),
            ));
        }
        let subscription = self.current_subscription(user_id).await?;
        if !subscription.status.is_entitled() {
            return Err(BillingError::Validation(format!(
                "subscription is {} and cannot change plans",
                subscription.status
            )));
        }
        if subscription.plan == plan {
            return Err(BillingError::Validation(format!("already on the {} plan", plan)));
        }
        let price_id = self
            .catalog
            .price_id(plan)
            .ok_or_else(|| BillingError::Config(format!("no price configured for plan {}", plan)))?;

        let requested_at = OffsetDateTime::now_utc();
        let snapshot = self
            .provider
            .change_subscription_price(&subscription.external_id, plan, price_id)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.external_id,
            from_plan = %subscription.plan,
            to_plan = %plan,
            "Plan change accepted by provider"
        );
        self.apply_user_change(SubscriptionChange::Updated, snapshot, requested_at)
            .await
    }

    pub async fn cancel(
        &self,
        user_id: UserId,
        at_period_end: bool,
    ) -> BillingResult<AppliedTransition> {
        let subscription = self.current_subscription(user_id).await?;
        if subscription.status.is_terminal() {
            return Err(BillingError::Validation(format!(
                "subscription is already {}",
                subscription.status
            )));
        }
        if at_period_end && subscription.cancel_at_period_end {
            return Err(BillingError::Validation(
                "subscription is already set to cancel at period end".into(),
            ));
        }

        let requested_at = OffsetDateTime::now_utc();
        let snapshot = self
            .provider
            .cancel_subscription(&subscription.external_id, at_period_end)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.external_id,
            at_period_end = at_period_end,
            "Cancellation accepted by provider"
        );
        self.apply_user_change(
            SubscriptionChange::Cancelled { at_period_end },
            snapshot,
            requested_at,
        )
        .await
    }

    /// Undo a pending cancel-at-period-end
    pub async fn reactivate(&self, user_id: UserId) -> BillingResult<AppliedTransition> {
        let subscription = self.current_subscription(user_id).await?;
        if !subscription.cancel_at_period_end || !subscription.status.is_entitled() {
            return Err(BillingError::Validation(
                "subscription is not pending cancellation".into(),
            ));
        }
        if subscription.current_period_end <= OffsetDateTime::now_utc() {
            return Err(BillingError::Validation(
                "billing period has already ended".into(),
            ));
        }

        let requested_at = OffsetDateTime::now_utc();
        let snapshot = self
            .provider
            .resume_subscription(&subscription.external_id)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.external_id,
            "Reactivation accepted by provider"
        );
        self.apply_user_change(SubscriptionChange::Updated, snapshot, requested_at)
            .await
    }

    async fn apply_user_change(
        &self,
        change: SubscriptionChange,
        snapshot: SubscriptionSnapshot,
        requested_at: OffsetDateTime,
    ) -> BillingResult<AppliedTransition> {
        let ctx = EventContext::user_initiated(requested_at, OffsetDateTime::now_utc());
        let event = BillingEvent::Subscription { change, snapshot };

        let mut tx = self.store.begin().await?;
        let applied = self.machine.apply(tx.as_mut(), &event, &ctx).await?;
        tx.commit().await?;

        if applied.stale {
            tracing::warn!(
                log_id = %applied.log.id,
                "Provider answer was older than the recorded state"
            );
        }
        Ok(applied)
    }

    /// Move owners of lapsed cancel-at-period-end subscriptions to free.
    /// Returns how many users were expired.
    pub async fn expire_lapsed(&self, now: OffsetDateTime) -> BillingResult<usize> {
        let candidates = self.store.lapsed_subscriptions(now).await?;
        let mut expired = 0;

        for record in candidates {
            let mut tx = self.store.begin().await?;
            match self.machine.expire(tx.as_mut(), &record.external_id, now).await {
                Ok(Some(_)) => {
                    tx.commit().await?;
                    expired += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        subscription_id = %record.external_id,
                        error = %e,
                        "Failed to expire lapsed subscription"
                    );
                }
            }
        }

        if expired > 0 {
            tracing::info!(expired = expired, "Expired lapsed subscriptions");
        }
        Ok(expired)
    }
}
