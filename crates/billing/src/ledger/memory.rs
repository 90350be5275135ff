//! In-memory ledger
//!
//! Used by tests and local runs without a database. A unit of work holds the
//! store-wide lock and mutates a staged copy of the state, so concurrent
//! units of work are fully serialized and an uncommitted one leaves no trace.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use tierledger_shared::{Plan, UserId};

use super::{
    CurrencyRevenue, DerivedUserFields, HistoryEntry, HistoryKind, LedgerStore, LedgerTotals,
    LedgerTx, MonthlyRevenueRow, NewSubscriptionLog, NewUser, Page, PageRequest, PaymentInfo,
    PaymentKey, PlanCount, SubscriptionLog, SubscriptionRecord, UsageCharge, User,
};
use crate::error::{BillingError, BillingResult};
use crate::plans::UNLIMITED;

#[derive(Debug, Clone, Default)]
struct LedgerState {
    users: BTreeMap<UserId, User>,
    subscriptions: BTreeMap<String, SubscriptionRecord>,
    payments: Vec<PaymentInfo>,
    logs: Vec<SubscriptionLog>,
}

impl LedgerState {
    fn user_mut(&mut self, user_id: UserId) -> BillingResult<&mut User> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))
    }

    fn find_payment(&self, key: &PaymentKey) -> Option<&PaymentInfo> {
        self.payments.iter().find(|p| key.matches(p))
    }

    fn upsert_subscription(
        &mut self,
        record: &SubscriptionRecord,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord> {
        if let Some(existing) = self.subscriptions.get_mut(&record.external_id) {
            if !record.supersedes(existing) {
                return Err(BillingError::StaleEvent(format!(
                    "subscription {} already reflects a newer state",
                    record.external_id
                )));
            }
            *existing = SubscriptionRecord {
                id: existing.id,
                user_id: existing.user_id,
                created_at: existing.created_at,
                updated_at: now,
                ..record.clone()
            };
            return Ok(existing.clone());
        }

        let inserted = SubscriptionRecord {
            created_at: now,
            updated_at: now,
            ..record.clone()
        };
        self.subscriptions
            .insert(inserted.external_id.clone(), inserted.clone());
        Ok(inserted)
    }

    fn save_payment(
        &mut self,
        payment: &PaymentInfo,
        now: OffsetDateTime,
    ) -> BillingResult<PaymentInfo> {
        // Mirrors the partial unique indexes on the payment keys
        let clash = self.payments.iter().any(|p| {
            p.id != payment.id
                && ((payment.payment_intent_id.is_some()
                    && p.payment_intent_id == payment.payment_intent_id)
                    || (payment.invoice_id.is_some() && p.invoice_id == payment.invoice_id))
        });
        if clash {
            return Err(BillingError::Storage(
                "duplicate payment key on another payment row".into(),
            ));
        }

        if let Some(existing) = self.payments.iter_mut().find(|p| p.id == payment.id) {
            let refunded = existing
                .refunded_amount
                .max(payment.refunded_amount.min(existing.amount));
            *existing = PaymentInfo {
                amount: existing.amount,
                currency: existing.currency.clone(),
                refunded_amount: refunded,
                created_at: existing.created_at,
                updated_at: now,
                ..payment.clone()
            };
            return Ok(existing.clone());
        }

        if payment.refunded_amount < 0 || payment.refunded_amount > payment.amount {
            return Err(BillingError::Validation(
                "refunded amount must be between 0 and the payment amount".into(),
            ));
        }
        let inserted = PaymentInfo {
            created_at: now,
            updated_at: now,
            ..payment.clone()
        };
        self.payments.push(inserted.clone());
        Ok(inserted)
    }

    fn append_log(
        &mut self,
        log: NewSubscriptionLog,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionLog> {
        if let Some(event_id) = &log.external_event_id {
            if self
                .logs
                .iter()
                .any(|l| l.external_event_id.as_ref() == Some(event_id))
            {
                return Err(BillingError::AlreadyApplied);
            }
        }
        let row = log.into_log(Uuid::new_v4(), now);
        self.logs.push(row.clone());
        Ok(row)
    }
}

fn month_bucket(at: OffsetDateTime) -> String {
    format!("{:04}-{:02}", at.year(), u8::from(at.month()))
}

/// Process-local ledger backed by a single mutex
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryLedgerTx { guard, staged }))
    }

    async fn ping(&self) -> BillingResult<()> {
        Ok(())
    }

    async fn create_user(&self, user: NewUser) -> BillingResult<User> {
        let mut state = self.state.lock().await;
        let email = user.email.trim().to_lowercase();
        if state.users.values().any(|u| u.email.to_lowercase() == email) {
            return Err(BillingError::Validation(format!(
                "email {} is already registered",
                user.email
            )));
        }
        if state.users.contains_key(&user.id) {
            return Err(BillingError::Validation(format!(
                "user {} already exists",
                user.id
            )));
        }
        let now = OffsetDateTime::now_utc();
        let created = User {
            id: user.id,
            email: user.email,
            plan: Plan::Free,
            is_active: false,
            stripe_customer_id: user.stripe_customer_id,
            stripe_subscription_id: None,
            total_transformations: 0,
            free_trials_remaining: user.free_trials.max(0),
            period_usage: 0,
            usage_period_start: None,
            created_at: now,
            updated_at: now,
        };
        state.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_user(&self, user_id: UserId) -> BillingResult<Option<User>> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn consume_usage(
        &self,
        user_id: UserId,
        charge: UsageCharge,
    ) -> BillingResult<Option<User>> {
        let mut state = self.state.lock().await;
        let Some(user) = state.users.get_mut(&user_id) else {
            return Ok(None);
        };
        if charge.max_usage != UNLIMITED && user.period_usage + charge.requested > charge.max_usage
        {
            return Ok(None);
        }
        user.period_usage += charge.requested;
        user.total_transformations += charge.requested;
        if charge.consumes_free_trials {
            user.free_trials_remaining = (user.free_trials_remaining - charge.requested).max(0);
        }
        user.updated_at = OffsetDateTime::now_utc();
        Ok(Some(user.clone()))
    }

    async fn get_subscription(
        &self,
        external_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .get(external_id)
            .cloned())
    }

    async fn current_subscription(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let state = self.state.lock().await;
        let pointer = state
            .users
            .get(&user_id)
            .and_then(|u| u.stripe_subscription_id.clone());
        if let Some(current) = pointer.and_then(|id| state.subscriptions.get(&id)) {
            return Ok(Some(current.clone()));
        }
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn lapsed_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.cancel_at_period_end && s.current_period_end <= now)
            .filter(|s| {
                state.users.get(&s.user_id).is_some_and(|u| {
                    u.is_active && u.stripe_subscription_id.as_deref() == Some(s.external_id.as_str())
                })
            })
            .cloned()
            .collect())
    }

    async fn find_payment(&self, key: &PaymentKey) -> BillingResult<Option<PaymentInfo>> {
        Ok(self.state.lock().await.find_payment(key).cloned())
    }

    async fn find_log_by_event(&self, event_id: &str) -> BillingResult<Option<SubscriptionLog>> {
        Ok(self
            .state
            .lock()
            .await
            .logs
            .iter()
            .find(|l| l.external_event_id.as_deref() == Some(event_id))
            .cloned())
    }

    async fn recent_logs(
        &self,
        user_id: Option<UserId>,
        limit: u32,
    ) -> BillingResult<Vec<SubscriptionLog>> {
        let state = self.state.lock().await;
        let mut logs: Vec<SubscriptionLog> = state
            .logs
            .iter()
            .rev()
            .filter(|l| user_id.is_none() || l.user_id == user_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit as usize);
        Ok(logs)
    }

    async fn list_history(
        &self,
        user_id: UserId,
        kind: Option<HistoryKind>,
        page: PageRequest,
    ) -> BillingResult<Page<HistoryEntry>> {
        let state = self.state.lock().await;
        let mut entries = Vec::new();
        if kind.is_none() || kind == Some(HistoryKind::Subscription) {
            entries.extend(
                state
                    .subscriptions
                    .values()
                    .filter(|s| s.user_id == user_id)
                    .cloned()
                    .map(HistoryEntry::Subscription),
            );
        }
        if kind.is_none() || kind == Some(HistoryKind::Payment) {
            entries.extend(
                state
                    .payments
                    .iter()
                    .filter(|p| p.user_id == user_id)
                    .cloned()
                    .map(HistoryEntry::Payment),
            );
        }
        entries.sort_by(|a, b| b.created_at().cmp(&a.created_at()));

        let total = entries.len() as i64;
        let items = entries
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect();
        Ok(Page::new(items, page, total))
    }

    async fn ledger_totals(&self) -> BillingResult<LedgerTotals> {
        let state = self.state.lock().await;
        let active_subscriptions = state
            .subscriptions
            .values()
            .filter(|s| s.status.is_entitled())
            .count() as i64;

        let mut by_currency: BTreeMap<String, CurrencyRevenue> = BTreeMap::new();
        for payment in state.payments.iter().filter(|p| p.status.is_captured()) {
            let entry = by_currency
                .entry(payment.currency.clone())
                .or_insert_with(|| CurrencyRevenue {
                    currency: payment.currency.clone(),
                    gross_minor: 0,
                    refunded_minor: 0,
                    payment_count: 0,
                });
            entry.gross_minor += payment.amount;
            entry.refunded_minor += payment.refunded_amount;
            entry.payment_count += 1;
        }

        Ok(LedgerTotals {
            active_subscriptions,
            revenue: by_currency.into_values().collect(),
        })
    }

    async fn plan_distribution(&self) -> BillingResult<Vec<PlanCount>> {
        let state = self.state.lock().await;
        Ok(Plan::ALL
            .iter()
            .map(|plan| {
                let users = state.users.values().filter(|u| u.plan == *plan);
                let (active, inactive): (Vec<&User>, Vec<&User>) =
                    users.partition(|u| u.is_active);
                PlanCount {
                    plan: *plan,
                    active_users: active.len() as i64,
                    inactive_users: inactive.len() as i64,
                }
            })
            .collect())
    }

    async fn monthly_revenue(
        &self,
        since: OffsetDateTime,
    ) -> BillingResult<Vec<MonthlyRevenueRow>> {
        let state = self.state.lock().await;
        let mut buckets: BTreeMap<(String, String), MonthlyRevenueRow> = BTreeMap::new();
        for payment in state.payments.iter().filter(|p| p.status.is_captured()) {
            let at = payment.paid_at.unwrap_or(payment.created_at);
            if at < since {
                continue;
            }
            let month = month_bucket(at.to_offset(time::UtcOffset::UTC));
            let row = buckets
                .entry((month.clone(), payment.currency.clone()))
                .or_insert_with(|| MonthlyRevenueRow {
                    month,
                    currency: payment.currency.clone(),
                    gross_minor: 0,
                    refunded_minor: 0,
                    payment_count: 0,
                });
            row.gross_minor += payment.amount;
            row.refunded_minor += payment.refunded_amount;
            row.payment_count += 1;
        }
        Ok(buckets.into_values().collect())
    }
}

struct MemoryLedgerTx {
    guard: OwnedMutexGuard<LedgerState>,
    staged: LedgerState,
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_event(&mut self, event_id: &str) -> BillingResult<bool> {
        // The whole store is already locked for this unit of work
        Ok(self
            .staged
            .logs
            .iter()
            .any(|l| l.external_event_id.as_deref() == Some(event_id)))
    }

    async fn get_user(&mut self, user_id: UserId) -> BillingResult<Option<User>> {
        Ok(self.staged.users.get(&user_id).cloned())
    }

    async fn find_user_by_customer(&mut self, customer_id: &str) -> BillingResult<Option<User>> {
        Ok(self
            .staged
            .users
            .values()
            .find(|u| u.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn lock_subscription(
        &mut self,
        external_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.staged.subscriptions.get(external_id).cloned())
    }

    async fn upsert_subscription(
        &mut self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord> {
        self.staged
            .upsert_subscription(record, OffsetDateTime::now_utc())
    }

    async fn update_user_billing(
        &mut self,
        user_id: UserId,
        fields: &DerivedUserFields,
    ) -> BillingResult<User> {
        let user = self.staged.user_mut(user_id)?;
        user.plan = fields.plan;
        user.is_active = fields.is_active;
        if fields.stripe_customer_id.is_some() {
            user.stripe_customer_id = fields.stripe_customer_id.clone();
        }
        if fields.stripe_subscription_id.is_some() {
            user.stripe_subscription_id = fields.stripe_subscription_id.clone();
        }
        user.updated_at = OffsetDateTime::now_utc();
        Ok(user.clone())
    }

    async fn reset_period_usage(
        &mut self,
        user_id: UserId,
        period_start: OffsetDateTime,
    ) -> BillingResult<bool> {
        let user = self.staged.user_mut(user_id)?;
        let newer = user
            .usage_period_start
            .map_or(true, |current| current < period_start);
        if user.plan == Plan::Free || !newer {
            return Ok(false);
        }
        user.period_usage = 0;
        user.usage_period_start = Some(period_start);
        user.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn lock_payment(&mut self, key: &PaymentKey) -> BillingResult<Option<PaymentInfo>> {
        Ok(self.staged.find_payment(key).cloned())
    }

    async fn save_payment(&mut self, payment: &PaymentInfo) -> BillingResult<PaymentInfo> {
        self.staged.save_payment(payment, OffsetDateTime::now_utc())
    }

    async fn append_log(&mut self, log: NewSubscriptionLog) -> BillingResult<SubscriptionLog> {
        self.staged.append_log(log, OffsetDateTime::now_utc())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let MemoryLedgerTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierledger_shared::{ActorType, LogAction, LogOutcome, Metadata};

    fn new_user(email: &str) -> NewUser {
        NewUser {
            id: UserId::new(),
            email: email.to_string(),
            stripe_customer_id: None,
            free_trials: 100,
        }
    }

    fn log_for(user_id: UserId, event_id: &str) -> NewSubscriptionLog {
        NewSubscriptionLog {
            user_id: Some(user_id),
            action: LogAction::Created,
            from_plan: None,
            to_plan: Some(Plan::Pro),
            external_event_id: Some(event_id.to_string()),
            subscription_external_id: None,
            actor: ActorType::Provider,
            outcome: LogOutcome::Success,
            error_message: None,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_uncommitted_unit_of_work_is_discarded() {
        let store = MemoryLedgerStore::new();
        let user = store.create_user(new_user("a@example.com")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.append_log(log_for(user.id, "evt_1")).await.unwrap();
        drop(tx);

        assert!(store.find_log_by_event("evt_1").await.unwrap().is_none());

        let mut tx = store.begin().await.unwrap();
        tx.append_log(log_for(user.id, "evt_1")).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.find_log_by_event("evt_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_already_applied() {
        let store = MemoryLedgerStore::new();
        let user = store.create_user(new_user("b@example.com")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.append_log(log_for(user.id, "evt_dup")).await.unwrap();
        let second = tx.append_log(log_for(user.id, "evt_dup")).await;
        assert!(matches!(second, Err(BillingError::AlreadyApplied)));
    }

    #[tokio::test]
    async fn test_consume_usage_respects_limit() {
        let store = MemoryLedgerStore::new();
        let user = store.create_user(new_user("c@example.com")).await.unwrap();
        let charge = UsageCharge {
            requested: 3,
            max_usage: 5,
            consumes_free_trials: true,
        };

        let updated = store.consume_usage(user.id, charge).await.unwrap().unwrap();
        assert_eq!(updated.period_usage, 3);
        assert_eq!(updated.free_trials_remaining, 97);

        assert!(store.consume_usage(user.id, charge).await.unwrap().is_none());
        let unchanged = store.get_user(user.id).await.unwrap().unwrap();
        assert_eq!(unchanged.period_usage, 3);
    }

    #[tokio::test]
    async fn test_duplicate_email_rejected() {
        let store = MemoryLedgerStore::new();
        store.create_user(new_user("dup@example.com")).await.unwrap();
        let err = store
            .create_user(new_user("DUP@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[test]
    fn test_month_bucket_format() {
        let at = time::macros::datetime!(2025-03-09 12:00 UTC);
        assert_eq!(month_bucket(at), "2025-03");
    }
}
