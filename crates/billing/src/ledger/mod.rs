//! Billing ledger storage
//!
//! The ledger is the single source of truth for users' billing fields,
//! subscriptions, payments and the audit log. Storage is split into two
//! traits:
//!
//! - [`LedgerStore`]: pool-level reads, the atomic quota update and the entry
//!   point for units of work.
//! - [`LedgerTx`]: a unit of work. Everything written through one `LedgerTx`
//!   becomes visible together on [`LedgerTx::commit`]; dropping it without
//!   committing discards every write.
//!
//! Per-entity serialization happens inside the unit of work: `lock_event`,
//! `lock_subscription` and `lock_payment` block concurrent units of work
//! touching the same key until the holder commits or rolls back.

mod memory;
mod models;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use models::*;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use time::OffsetDateTime;

use tierledger_shared::UserId;

use crate::error::BillingResult;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a unit of work
    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>>;

    /// Cheap liveness probe for readiness checks
    async fn ping(&self) -> BillingResult<()>;

    // Users

    async fn create_user(&self, user: NewUser) -> BillingResult<User>;

    async fn get_user(&self, user_id: UserId) -> BillingResult<Option<User>>;

    /// Apply a usage charge in one conditional write.
    ///
    /// Returns the updated user when the charge fits under the limit, `None`
    /// when it was denied (or the user does not exist). Nothing is written on
    /// denial.
    async fn consume_usage(&self, user_id: UserId, charge: UsageCharge)
        -> BillingResult<Option<User>>;

    // Subscriptions

    async fn get_subscription(&self, external_id: &str)
        -> BillingResult<Option<SubscriptionRecord>>;

    /// The user's current subscription: the one their pointer names, else the
    /// most recently created one
    async fn current_subscription(&self, user_id: UserId)
        -> BillingResult<Option<SubscriptionRecord>>;

    /// Subscriptions flagged cancel-at-period-end whose period has ended while
    /// their owner still points at them and is active
    async fn lapsed_subscriptions(&self, now: OffsetDateTime)
        -> BillingResult<Vec<SubscriptionRecord>>;

    // Payments

    async fn find_payment(&self, key: &PaymentKey) -> BillingResult<Option<PaymentInfo>>;

    // Logs

    async fn find_log_by_event(&self, event_id: &str) -> BillingResult<Option<SubscriptionLog>>;

    /// Newest first
    async fn recent_logs(&self, user_id: Option<UserId>, limit: u32)
        -> BillingResult<Vec<SubscriptionLog>>;

    // Read models

    /// Subscription and/or payment rows for a user, newest first
    async fn list_history(
        &self,
        user_id: UserId,
        kind: Option<HistoryKind>,
        page: PageRequest,
    ) -> BillingResult<Page<HistoryEntry>>;

    async fn ledger_totals(&self) -> BillingResult<LedgerTotals>;

    async fn plan_distribution(&self) -> BillingResult<Vec<PlanCount>>;

    /// Captured revenue bucketed by `YYYY-MM` (UTC) and currency, oldest first
    async fn monthly_revenue(&self, since: OffsetDateTime)
        -> BillingResult<Vec<MonthlyRevenueRow>>;
}

#[async_trait]
pub trait LedgerTx: Send {
    /// Serialize on a provider event id and report whether it was already
    /// recorded in the log
    async fn lock_event(&mut self, event_id: &str) -> BillingResult<bool>;

    async fn get_user(&mut self, user_id: UserId) -> BillingResult<Option<User>>;

    async fn find_user_by_customer(&mut self, customer_id: &str) -> BillingResult<Option<User>>;

    /// Serialize on a subscription and load its current row
    async fn lock_subscription(&mut self, external_id: &str)
        -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert or update by `external_id`.
    ///
    /// The update only lands when the incoming period end is not older than
    /// the stored one (and, on an equal period end, the incoming event time is
    /// not older). A blocked update returns [`crate::BillingError::StaleEvent`].
    async fn upsert_subscription(&mut self, record: &SubscriptionRecord)
        -> BillingResult<SubscriptionRecord>;

    async fn update_user_billing(
        &mut self,
        user_id: UserId,
        fields: &DerivedUserFields,
    ) -> BillingResult<User>;

    /// Reset the period counter when `period_start` is newer than the stored
    /// period start. Free-plan users are never reset. Returns whether a reset
    /// happened.
    async fn reset_period_usage(
        &mut self,
        user_id: UserId,
        period_start: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Serialize on a payment's keys and load the existing row
    async fn lock_payment(&mut self, key: &PaymentKey) -> BillingResult<Option<PaymentInfo>>;

    /// Insert or update by `id`. Refunded amounts never decrease.
    async fn save_payment(&mut self, payment: &PaymentInfo) -> BillingResult<PaymentInfo>;

    /// Append an audit row. A duplicate event id surfaces as
    /// [`crate::BillingError::AlreadyApplied`].
    async fn append_log(&mut self, log: NewSubscriptionLog) -> BillingResult<SubscriptionLog>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;
}
