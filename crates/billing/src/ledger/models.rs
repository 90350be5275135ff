//! Ledger record types
//!
//! Explicit, statically-typed rows for the billing ledger. Every mutation of
//! these records happens through [`super::LedgerTx`], which sets `updated_at`
//! as part of the same write.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use tierledger_shared::{
    ActorType, BillingInterval, LogAction, LogOutcome, Metadata, PaymentStatus, Plan,
    SubscriptionStatus, UserId,
};

/// Billing view of a user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub plan: Plan,
    pub is_active: bool,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    /// Lifetime metered operations
    pub total_transformations: i64,
    pub free_trials_remaining: i64,
    /// Metered operations in the current billing period
    pub period_usage: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub usage_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Input for registering a user with the billing core
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: UserId,
    pub email: String,
    pub stripe_customer_id: Option<String>,
    pub free_trials: i64,
}

/// A single conditional usage increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCharge {
    pub requested: i64,
    /// Plan limit for the period (`-1` = unlimited)
    pub max_usage: i64,
    /// Free plan usage also draws down the lifetime free-trial allowance
    pub consumes_free_trials: bool,
}

/// Plan/active fields derived by the state machine and written onto the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedUserFields {
    pub plan: Plan,
    pub is_active: bool,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    /// Provider subscription id (globally unique)
    pub external_id: String,
    pub user_id: UserId,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    pub price_id: Option<String>,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub interval_count: i32,
    pub quantity: i32,
    pub metadata: Metadata,
    /// Business time of the last applied provider event
    #[serde(with = "time::serde::rfc3339")]
    pub last_event_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_synced_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Whether this snapshot may overwrite `stored`: its period end is newer,
    /// or equal with an event time that is not older
    pub fn supersedes(&self, stored: &SubscriptionRecord) -> bool {
        self.current_period_end > stored.current_period_end
            || (self.current_period_end == stored.current_period_end
                && self.last_event_at >= stored.last_event_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodSummary {
    /// e.g. `card`, `sepa_debit`
    pub kind: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAddress {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentInfo {
    pub id: Uuid,
    pub user_id: UserId,
    pub payment_intent_id: Option<String>,
    pub invoice_id: Option<String>,
    pub subscription_external_id: Option<String>,
    /// Plan recorded when the payment was made; never inferred from amount
    pub plan: Option<Plan>,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub payment_method: PaymentMethodSummary,
    pub billing_address: Option<BillingAddress>,
    pub receipt_url: Option<String>,
    pub refunded_amount: i64,
    pub refund_reason: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub description: Option<String>,
    pub metadata: Metadata,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Lookup keys for a payment row
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PaymentKey {
    pub payment_intent_id: Option<String>,
    pub invoice_id: Option<String>,
}

impl PaymentKey {
    pub fn is_empty(&self) -> bool {
        self.payment_intent_id.is_none() && self.invoice_id.is_none()
    }

    pub fn matches(&self, payment: &PaymentInfo) -> bool {
        let by_intent = self.payment_intent_id.is_some()
            && self.payment_intent_id == payment.payment_intent_id;
        let by_invoice = self.invoice_id.is_some() && self.invoice_id == payment.invoice_id;
        by_intent || by_invoice
    }
}

/// Immutable audit row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionLog {
    pub id: Uuid,
    pub user_id: Option<UserId>,
    pub action: LogAction,
    pub from_plan: Option<Plan>,
    pub to_plan: Option<Plan>,
    /// Provider event id; the idempotency key when present
    pub external_event_id: Option<String>,
    pub subscription_external_id: Option<String>,
    pub actor: ActorType,
    pub outcome: LogOutcome,
    pub error_message: Option<String>,
    pub metadata: Metadata,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Log row waiting to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubscriptionLog {
    pub user_id: Option<UserId>,
    pub action: LogAction,
    pub from_plan: Option<Plan>,
    pub to_plan: Option<Plan>,
    pub external_event_id: Option<String>,
    pub subscription_external_id: Option<String>,
    pub actor: ActorType,
    pub outcome: LogOutcome,
    pub error_message: Option<String>,
    pub metadata: Metadata,
}

impl NewSubscriptionLog {
    pub fn into_log(self, id: Uuid, created_at: OffsetDateTime) -> SubscriptionLog {
        SubscriptionLog {
            id,
            user_id: self.user_id,
            action: self.action,
            from_plan: self.from_plan,
            to_plan: self.to_plan,
            external_event_id: self.external_event_id,
            subscription_external_id: self.subscription_external_id,
            actor: self.actor,
            outcome: self.outcome,
            error_message: self.error_message,
            metadata: self.metadata,
            created_at,
        }
    }
}

// =============================================================================
// Read-side shapes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Subscription,
    Payment,
}

impl std::str::FromStr for HistoryKind {
    type Err = tierledger_shared::SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(Self::Subscription),
            "payment" => Ok(Self::Payment),
            _ => Err(tierledger_shared::SharedError::Validation(format!(
                "Invalid history kind: {}",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HistoryEntry {
    Subscription(SubscriptionRecord),
    Payment(PaymentInfo),
}

impl HistoryEntry {
    pub fn created_at(&self) -> OffsetDateTime {
        match self {
            HistoryEntry::Subscription(s) => s.created_at,
            HistoryEntry::Payment(p) => p.created_at,
        }
    }
}

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// 1-based page request with a clamped limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.limit as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: i64) -> Self {
        let limit = request.limit as i64;
        Self {
            items,
            page: request.page,
            limit: request.limit,
            total,
            total_pages: (total + limit - 1) / limit,
        }
    }
}

/// Captured revenue for one currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrencyRevenue {
    pub currency: String,
    pub gross_minor: i64,
    pub refunded_minor: i64,
    pub payment_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerTotals {
    pub active_subscriptions: i64,
    pub revenue: Vec<CurrencyRevenue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanCount {
    pub plan: Plan,
    pub active_users: i64,
    pub inactive_users: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyRevenueRow {
    /// `YYYY-MM`
    pub month: String,
    pub currency: String,
    pub gross_minor: i64,
    pub refunded_minor: i64,
    pub payment_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_clamps() {
        let req = PageRequest::new(Some(0), Some(500));
        assert_eq!(req.page, 1);
        assert_eq!(req.limit, MAX_PAGE_LIMIT);
        assert_eq!(req.offset(), 0);

        let req = PageRequest::new(Some(3), Some(0));
        assert_eq!(req.limit, 1);
        assert_eq!(req.offset(), 2);
    }

    #[test]
    fn test_page_total_pages() {
        let page: Page<u8> = Page::new(vec![], PageRequest::new(Some(1), Some(20)), 41);
        assert_eq!(page.total_pages, 3);
        let empty: Page<u8> = Page::new(vec![], PageRequest::default(), 0);
        assert_eq!(empty.total_pages, 0);
    }

    #[test]
    fn test_payment_key_matching() {
        let key = PaymentKey {
            payment_intent_id: Some("pi_1".into()),
            invoice_id: None,
        };
        assert!(!key.is_empty());
        let none = PaymentKey {
            payment_intent_id: None,
            invoice_id: None,
        };
        assert!(none.is_empty());
    }
}
