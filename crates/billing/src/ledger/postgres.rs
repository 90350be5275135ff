//! PostgreSQL ledger
//!
//! Units of work map onto database transactions. Per-entity serialization
//! uses transaction-scoped advisory locks, and the unique indexes on
//! `external_id`, `external_event_id`, `payment_intent_id` and `invoice_id`
//! back them up.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use tierledger_shared::{Metadata, Plan, SharedError, UserId};

use super::{
    BillingAddress, CurrencyRevenue, DerivedUserFields, HistoryEntry, HistoryKind, LedgerStore,
    LedgerTotals, LedgerTx, MonthlyRevenueRow, NewSubscriptionLog, NewUser, Page, PageRequest,
    PaymentInfo, PaymentKey, PaymentMethodSummary, PlanCount, SubscriptionLog,
    SubscriptionRecord, UsageCharge, User,
};
use crate::error::{BillingError, BillingResult};

/// Ledger backed by the `users`, `subscriptions`, `payments` and
/// `subscription_logs` tables
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr<Err = SharedError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: SharedError| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn parse_optional_column<T>(row: &PgRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: std::str::FromStr<Err = SharedError>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        value.parse().map_err(|e: SharedError| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
    })
    .transpose()
}

impl<'r> sqlx::FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: UserId(row.try_get("id")?),
            email: row.try_get("email")?,
            plan: parse_column(row, "plan")?,
            is_active: row.try_get("is_active")?,
            stripe_customer_id: row.try_get("stripe_customer_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            total_transformations: row.try_get("total_transformations")?,
            free_trials_remaining: row.try_get("free_trials_remaining")?,
            period_usage: row.try_get("period_usage")?,
            usage_period_start: row.try_get("usage_period_start")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for SubscriptionRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let metadata: Json<Metadata> = row.try_get("metadata")?;
        Ok(Self {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            user_id: UserId(row.try_get("user_id")?),
            plan: parse_column(row, "plan")?,
            status: parse_column(row, "status")?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            trial_start: row.try_get("trial_start")?,
            trial_end: row.try_get("trial_end")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
            canceled_at: row.try_get("canceled_at")?,
            price_id: row.try_get("price_id")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            interval: parse_column(row, "billing_interval")?,
            interval_count: row.try_get("interval_count")?,
            quantity: row.try_get("quantity")?,
            metadata: metadata.0,
            last_event_at: row.try_get("last_event_at")?,
            last_synced_at: row.try_get("last_synced_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for PaymentInfo {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let metadata: Json<Metadata> = row.try_get("metadata")?;
        let billing_address: Option<Json<BillingAddress>> = row.try_get("billing_address")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: UserId(row.try_get("user_id")?),
            payment_intent_id: row.try_get("payment_intent_id")?,
            invoice_id: row.try_get("invoice_id")?,
            subscription_external_id: row.try_get("subscription_external_id")?,
            plan: parse_optional_column(row, "plan")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            status: parse_column(row, "status")?,
            payment_method: PaymentMethodSummary {
                kind: row.try_get("payment_method_type")?,
                card_brand: row.try_get("card_brand")?,
                card_last4: row.try_get("card_last4")?,
            },
            billing_address: billing_address.map(|a| a.0),
            receipt_url: row.try_get("receipt_url")?,
            refunded_amount: row.try_get("refunded_amount")?,
            refund_reason: row.try_get("refund_reason")?,
            failure_code: row.try_get("failure_code")?,
            failure_message: row.try_get("failure_message")?,
            description: row.try_get("description")?,
            metadata: metadata.0,
            paid_at: row.try_get("paid_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for SubscriptionLog {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let user_id: Option<Uuid> = row.try_get("user_id")?;
        let metadata: Json<Metadata> = row.try_get("metadata")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: user_id.map(UserId),
            action: parse_column(row, "action")?,
            from_plan: parse_optional_column(row, "from_plan")?,
            to_plan: parse_optional_column(row, "to_plan")?,
            external_event_id: row.try_get("external_event_id")?,
            subscription_external_id: row.try_get("subscription_external_id")?,
            actor: parse_column(row, "actor")?,
            outcome: parse_column(row, "outcome")?,
            error_message: row.try_get("error_message")?,
            metadata: metadata.0,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn ping(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_user(&self, user: NewUser) -> BillingResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (
                id, email, plan, is_active, stripe_customer_id, free_trials_remaining,
                created_at, updated_at
            ) VALUES ($1, $2, 'free', FALSE, $3, GREATEST($4, 0), NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(user.id.0)
        .bind(&user.email)
        .bind(&user.stripe_customer_id)
        .bind(user.free_trials)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::Validation(format!("user {} is already registered", user.email))
            } else {
                e.into()
            }
        })
    }

    async fn get_user(&self, user_id: UserId) -> BillingResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn consume_usage(
        &self,
        user_id: UserId,
        charge: UsageCharge,
    ) -> BillingResult<Option<User>> {
        // Check and increment in one statement; concurrent callers serialize
        // on the row lock and re-evaluate the predicate
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET period_usage = period_usage + $2,
                total_transformations = total_transformations + $2,
                free_trials_remaining = CASE
                    WHEN $4 THEN GREATEST(free_trials_remaining - $2, 0)
                    ELSE free_trials_remaining
                END,
                updated_at = NOW()
            WHERE id = $1
              AND ($3 = -1 OR period_usage + $2 <= $3)
            RETURNING *
            "#,
        )
        .bind(user_id.0)
        .bind(charge.requested)
        .bind(charge.max_usage)
        .bind(charge.consumes_free_trials)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_subscription(
        &self,
        external_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "SELECT * FROM subscriptions WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn current_subscription(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1
            ORDER BY (external_id = (SELECT stripe_subscription_id FROM users WHERE id = $1)) IS TRUE DESC,
                     created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn lapsed_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let records = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT * FROM subscriptions s
            WHERE s.cancel_at_period_end
              AND s.current_period_end <= $1
              AND EXISTS (
                  SELECT 1 FROM users u
                  WHERE u.id = s.user_id
                    AND u.is_active
                    AND u.stripe_subscription_id = s.external_id
              )
            ORDER BY s.current_period_end
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn find_payment(&self, key: &PaymentKey) -> BillingResult<Option<PaymentInfo>> {
        let payment = sqlx::query_as::<_, PaymentInfo>(
            r#"
            SELECT * FROM payments
            WHERE payment_intent_id = $1 OR invoice_id = $2
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(&key.payment_intent_id)
        .bind(&key.invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn find_log_by_event(&self, event_id: &str) -> BillingResult<Option<SubscriptionLog>> {
        let log = sqlx::query_as::<_, SubscriptionLog>(
            "SELECT * FROM subscription_logs WHERE external_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(log)
    }

    async fn recent_logs(
        &self,
        user_id: Option<UserId>,
        limit: u32,
    ) -> BillingResult<Vec<SubscriptionLog>> {
        let logs = sqlx::query_as::<_, SubscriptionLog>(
            r#"
            SELECT * FROM subscription_logs
            WHERE $1::uuid IS NULL OR user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id.map(|id| id.0))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    async fn list_history(
        &self,
        user_id: UserId,
        kind: Option<HistoryKind>,
        page: PageRequest,
    ) -> BillingResult<Page<HistoryEntry>> {
        let include_subscriptions = kind.is_none() || kind == Some(HistoryKind::Subscription);
        let include_payments = kind.is_none() || kind == Some(HistoryKind::Payment);

        // A merged page needs the first offset+limit rows of each table
        let window = page.offset() + page.limit as i64;
        let mut entries = Vec::new();
        let mut total = 0i64;

        if include_subscriptions {
            total += sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM subscriptions WHERE user_id = $1",
            )
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;

            let rows = sqlx::query_as::<_, SubscriptionRecord>(
                "SELECT * FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            )
            .bind(user_id.0)
            .bind(window)
            .fetch_all(&self.pool)
            .await?;
            entries.extend(rows.into_iter().map(HistoryEntry::Subscription));
        }

        if include_payments {
            total += sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM payments WHERE user_id = $1")
                .bind(user_id.0)
                .fetch_one(&self.pool)
                .await?;

            let rows = sqlx::query_as::<_, PaymentInfo>(
                "SELECT * FROM payments WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            )
            .bind(user_id.0)
            .bind(window)
            .fetch_all(&self.pool)
            .await?;
            entries.extend(rows.into_iter().map(HistoryEntry::Payment));
        }

        entries.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        let items = entries
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect();
        Ok(Page::new(items, page, total))
    }

    async fn ledger_totals(&self) -> BillingResult<LedgerTotals> {
        let active_subscriptions = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM subscriptions WHERE status IN ('active', 'trialing')",
        )
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT currency,
                   COALESCE(SUM(amount), 0)::BIGINT AS gross_minor,
                   COALESCE(SUM(refunded_amount), 0)::BIGINT AS refunded_minor,
                   COUNT(*) AS payment_count
            FROM payments
            WHERE status IN ('succeeded', 'refunded', 'partially_refunded')
            GROUP BY currency
            ORDER BY currency
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let revenue = rows
            .iter()
            .map(|row| -> Result<CurrencyRevenue, sqlx::Error> {
                Ok(CurrencyRevenue {
                    currency: row.try_get("currency")?,
                    gross_minor: row.try_get("gross_minor")?,
                    refunded_minor: row.try_get("refunded_minor")?,
                    payment_count: row.try_get("payment_count")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(LedgerTotals {
            active_subscriptions,
            revenue,
        })
    }

    async fn plan_distribution(&self) -> BillingResult<Vec<PlanCount>> {
        let rows = sqlx::query(
            r#"
            SELECT plan,
                   COUNT(*) FILTER (WHERE is_active) AS active_users,
                   COUNT(*) FILTER (WHERE NOT is_active) AS inactive_users
            FROM users
            GROUP BY plan
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts: Vec<PlanCount> = Plan::ALL
            .iter()
            .map(|plan| PlanCount {
                plan: *plan,
                active_users: 0,
                inactive_users: 0,
            })
            .collect();

        for row in &rows {
            let plan: Plan = parse_column(row, "plan")?;
            if let Some(count) = counts.iter_mut().find(|c| c.plan == plan) {
                count.active_users = row.try_get("active_users")?;
                count.inactive_users = row.try_get("inactive_users")?;
            }
        }
        Ok(counts)
    }

    async fn monthly_revenue(
        &self,
        since: OffsetDateTime,
    ) -> BillingResult<Vec<MonthlyRevenueRow>> {
        let rows = sqlx::query(
            r#"
            SELECT to_char(COALESCE(paid_at, created_at) AT TIME ZONE 'UTC', 'YYYY-MM') AS month,
                   currency,
                   COALESCE(SUM(amount), 0)::BIGINT AS gross_minor,
                   COALESCE(SUM(refunded_amount), 0)::BIGINT AS refunded_minor,
                   COUNT(*) AS payment_count
            FROM payments
            WHERE status IN ('succeeded', 'refunded', 'partially_refunded')
              AND COALESCE(paid_at, created_at) >= $1
            GROUP BY 1, 2
            ORDER BY 1, 2
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let months = rows
            .iter()
            .map(|row| -> Result<MonthlyRevenueRow, sqlx::Error> {
                Ok(MonthlyRevenueRow {
                    month: row.try_get("month")?,
                    currency: row.try_get("currency")?,
                    gross_minor: row.try_get("gross_minor")?,
                    refunded_minor: row.try_get("refunded_minor")?,
                    payment_count: row.try_get("payment_count")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(months)
    }
}

struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

impl PgLedgerTx {
    async fn advisory_lock(&mut self, key: &str) -> BillingResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_event(&mut self, event_id: &str) -> BillingResult<bool> {
        self.advisory_lock(&format!("event:{}", event_id)).await?;
        let seen = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM subscription_logs WHERE external_event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(seen)
    }

    async fn get_user(&mut self, user_id: UserId) -> BillingResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id.0)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn find_user_by_customer(&mut self, customer_id: &str) -> BillingResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE stripe_customer_id = $1 FOR UPDATE",
        )
        .bind(customer_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(user)
    }

    async fn lock_subscription(
        &mut self,
        external_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.advisory_lock(&format!("subscription:{}", external_id))
            .await?;
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            "SELECT * FROM subscriptions WHERE external_id = $1 FOR UPDATE",
        )
        .bind(external_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(record)
    }

    async fn upsert_subscription(
        &mut self,
        record: &SubscriptionRecord,
    ) -> BillingResult<SubscriptionRecord> {
        let stored = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            INSERT INTO subscriptions (
                id, external_id, user_id, plan, status,
                current_period_start, current_period_end, trial_start, trial_end,
                cancel_at_period_end, canceled_at, price_id, amount, currency,
                billing_interval, interval_count, quantity, metadata,
                last_event_at, last_synced_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, NOW(), NOW()
            )
            ON CONFLICT (external_id) DO UPDATE SET
                plan = EXCLUDED.plan,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                trial_start = EXCLUDED.trial_start,
                trial_end = EXCLUDED.trial_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                price_id = EXCLUDED.price_id,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                billing_interval = EXCLUDED.billing_interval,
                interval_count = EXCLUDED.interval_count,
                quantity = EXCLUDED.quantity,
                metadata = EXCLUDED.metadata,
                last_event_at = EXCLUDED.last_event_at,
                last_synced_at = EXCLUDED.last_synced_at,
                updated_at = NOW()
            WHERE subscriptions.current_period_end < EXCLUDED.current_period_end
               OR (subscriptions.current_period_end = EXCLUDED.current_period_end
                   AND subscriptions.last_event_at <= EXCLUDED.last_event_at)
            RETURNING *
            "#,
        )
        .bind(record.id)
        .bind(&record.external_id)
        .bind(record.user_id.0)
        .bind(record.plan.as_str())
        .bind(record.status.as_str())
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.trial_start)
        .bind(record.trial_end)
        .bind(record.cancel_at_period_end)
        .bind(record.canceled_at)
        .bind(&record.price_id)
        .bind(record.amount)
        .bind(&record.currency)
        .bind(record.interval.as_str())
        .bind(record.interval_count)
        .bind(record.quantity)
        .bind(Json(&record.metadata))
        .bind(record.last_event_at)
        .bind(record.last_synced_at)
        .fetch_optional(&mut *self.tx)
        .await?;

        stored.ok_or_else(|| {
            BillingError::StaleEvent(format!(
                "subscription {} already reflects a newer state",
                record.external_id
            ))
        })
    }

    async fn update_user_billing(
        &mut self,
        user_id: UserId,
        fields: &DerivedUserFields,
    ) -> BillingResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET plan = $2,
                is_active = $3,
                stripe_customer_id = COALESCE($4, stripe_customer_id),
                stripe_subscription_id = COALESCE($5, stripe_subscription_id),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(user_id.0)
        .bind(fields.plan.as_str())
        .bind(fields.is_active)
        .bind(&fields.stripe_customer_id)
        .bind(&fields.stripe_subscription_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        user.ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))
    }

    async fn reset_period_usage(
        &mut self,
        user_id: UserId,
        period_start: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET period_usage = 0,
                usage_period_start = $2,
                updated_at = NOW()
            WHERE id = $1
              AND plan <> 'free'
              AND (usage_period_start IS NULL OR usage_period_start < $2)
            "#,
        )
        .bind(user_id.0)
        .bind(period_start)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn lock_payment(&mut self, key: &PaymentKey) -> BillingResult<Option<PaymentInfo>> {
        // Fixed order (intent, then invoice) so two units of work never wait
        // on each other's keys
        if let Some(intent) = &key.payment_intent_id {
            self.advisory_lock(&format!("payment:{}", intent)).await?;
        }
        if let Some(invoice) = &key.invoice_id {
            self.advisory_lock(&format!("payment:{}", invoice)).await?;
        }

        let payment = sqlx::query_as::<_, PaymentInfo>(
            r#"
            SELECT * FROM payments
            WHERE payment_intent_id = $1 OR invoice_id = $2
            ORDER BY created_at
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(&key.payment_intent_id)
        .bind(&key.invoice_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(payment)
    }

    async fn save_payment(&mut self, payment: &PaymentInfo) -> BillingResult<PaymentInfo> {
        let stored = sqlx::query_as::<_, PaymentInfo>(
            r#"
            INSERT INTO payments (
                id, user_id, payment_intent_id, invoice_id, subscription_external_id, plan,
                amount, currency, status, payment_method_type, card_brand, card_last4,
                billing_address, receipt_url, refunded_amount, refund_reason,
                failure_code, failure_message, description, metadata, paid_at,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, NOW(), NOW()
            )
            ON CONFLICT (id) DO UPDATE SET
                payment_intent_id = COALESCE(payments.payment_intent_id, EXCLUDED.payment_intent_id),
                invoice_id = COALESCE(payments.invoice_id, EXCLUDED.invoice_id),
                subscription_external_id = EXCLUDED.subscription_external_id,
                plan = EXCLUDED.plan,
                status = EXCLUDED.status,
                payment_method_type = EXCLUDED.payment_method_type,
                card_brand = EXCLUDED.card_brand,
                card_last4 = EXCLUDED.card_last4,
                billing_address = EXCLUDED.billing_address,
                receipt_url = EXCLUDED.receipt_url,
                refunded_amount = GREATEST(
                    payments.refunded_amount,
                    LEAST(EXCLUDED.refunded_amount, payments.amount)
                ),
                refund_reason = EXCLUDED.refund_reason,
                failure_code = EXCLUDED.failure_code,
                failure_message = EXCLUDED.failure_message,
                description = EXCLUDED.description,
                metadata = EXCLUDED.metadata,
                paid_at = EXCLUDED.paid_at,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(payment.user_id.0)
        .bind(&payment.payment_intent_id)
        .bind(&payment.invoice_id)
        .bind(&payment.subscription_external_id)
        .bind(payment.plan.map(|p| p.as_str()))
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(&payment.payment_method.kind)
        .bind(&payment.payment_method.card_brand)
        .bind(&payment.payment_method.card_last4)
        .bind(payment.billing_address.as_ref().map(Json))
        .bind(&payment.receipt_url)
        .bind(payment.refunded_amount)
        .bind(&payment.refund_reason)
        .bind(&payment.failure_code)
        .bind(&payment.failure_message)
        .bind(&payment.description)
        .bind(Json(&payment.metadata))
        .bind(payment.paid_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(stored)
    }

    async fn append_log(&mut self, log: NewSubscriptionLog) -> BillingResult<SubscriptionLog> {
        sqlx::query_as::<_, SubscriptionLog>(
            r#"
            INSERT INTO subscription_logs (
                id, user_id, action, from_plan, to_plan, external_event_id,
                subscription_external_id, actor, outcome, error_message, metadata, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(log.user_id.map(|id| id.0))
        .bind(log.action.as_str())
        .bind(log.from_plan.map(|p| p.as_str()))
        .bind(log.to_plan.map(|p| p.as_str()))
        .bind(&log.external_event_id)
        .bind(&log.subscription_external_id)
        .bind(log.actor.as_str())
        .bind(log.outcome.as_str())
        .bind(&log.error_message)
        .bind(Json(&log.metadata))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::AlreadyApplied
            } else {
                e.into()
            }
        })
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
