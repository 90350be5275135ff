//! Subscription state machine
//!
//! Applies a translated provider event (or a user-initiated change) to the
//! ledger inside the caller's unit of work. This is the only writer of
//! subscription records, payment records and the user's derived billing
//! fields. Every applied event leaves exactly one log row.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use tierledger_shared::{ActorType, LogAction, Plan, SubscriptionStatus, UserId};

use crate::entitlement::{derive_entitlement, Entitlement};
use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionLogBuilder;
use crate::ledger::{
    DerivedUserFields, LedgerTx, PaymentInfo, SubscriptionLog, SubscriptionRecord, User,
};
use crate::payments::merge_payment;
use crate::plans::PlanCatalog;
use crate::provider_event::{
    BillingEvent, PaymentOutcome, PaymentSnapshot, ProviderEvent, SubscriptionChange,
    SubscriptionSnapshot,
};
use crate::usage::UsageMeter;

/// Prefix of the error message on logs for out-of-order events
pub const STALE_EVENT_MESSAGE: &str = "STALE_EVENT";

/// Who and when, for one application of an event
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Provider event id; `None` for user-initiated changes
    pub event_id: Option<String>,
    /// Business time of the event (provider `created`, or now)
    pub event_time: OffsetDateTime,
    pub actor: ActorType,
    /// Clock used for entitlement derivation
    pub now: OffsetDateTime,
}

impl EventContext {
    pub fn from_provider(event: &ProviderEvent, now: OffsetDateTime) -> Self {
        Self {
            event_id: Some(event.id.clone()),
            event_time: event.created,
            actor: ActorType::Provider,
            now,
        }
    }

    /// A change requested by the user at `requested_at`. The provider stamps
    /// its own events in whole seconds, so the event time is truncated to
    /// match and the provider's confirmation of the same change still applies.
    pub fn user_initiated(requested_at: OffsetDateTime, now: OffsetDateTime) -> Self {
        Self {
            event_id: None,
            event_time: truncate_to_second(requested_at),
            actor: ActorType::User,
            now,
        }
    }
}

fn truncate_to_second(at: OffsetDateTime) -> OffsetDateTime {
    at - time::Duration::nanoseconds(i64::from(at.nanosecond()))
}

/// Result of applying one event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedTransition {
    pub log: SubscriptionLog,
    pub subscription: Option<SubscriptionRecord>,
    pub payment: Option<PaymentInfo>,
    /// The owner after the transition (unchanged when the user was not written)
    pub user: Option<User>,
    pub entitlement: Option<Entitlement>,
    /// The event was older than the stored state and changed nothing
    pub stale: bool,
}

/// Log action for a subscription change
pub fn derive_action(
    change: SubscriptionChange,
    previous: Option<&SubscriptionRecord>,
    next: &SubscriptionRecord,
) -> LogAction {
    let started = if next.status == SubscriptionStatus::Trialing {
        LogAction::TrialStarted
    } else {
        LogAction::Created
    };

    match change {
        SubscriptionChange::Created => started,
        SubscriptionChange::Cancelled { .. } => LogAction::Cancelled,
        SubscriptionChange::Updated => {
            let Some(prev) = previous else {
                return started;
            };
            match next.status {
                SubscriptionStatus::Canceled => LogAction::Cancelled,
                SubscriptionStatus::Unpaid | SubscriptionStatus::IncompleteExpired => {
                    LogAction::Expired
                }
                _ if prev.cancel_at_period_end
                    && !next.cancel_at_period_end
                    && next.status.is_entitled() =>
                {
                    LogAction::Reactivated
                }
                _ if prev.status == SubscriptionStatus::Trialing => LogAction::TrialEnded,
                _ if !prev.cancel_at_period_end && next.cancel_at_period_end => {
                    LogAction::Cancelled
                }
                _ => LogAction::Updated,
            }
        }
    }
}

pub struct SubscriptionStateMachine {
    catalog: Arc<PlanCatalog>,
}

impl SubscriptionStateMachine {
    pub fn new(catalog: Arc<PlanCatalog>) -> Self {
        Self { catalog }
    }

    /// Apply one event inside `tx`. Nothing is committed here.
    pub async fn apply(
        &self,
        tx: &mut dyn LedgerTx,
        event: &BillingEvent,
        ctx: &EventContext,
    ) -> BillingResult<AppliedTransition> {
        match event {
            BillingEvent::Subscription { change, snapshot } => {
                self.apply_subscription(tx, *change, snapshot, ctx).await
            }
            BillingEvent::Payment { outcome, snapshot } => {
                self.apply_payment(tx, *outcome, snapshot, ctx).await
            }
        }
    }

    async fn apply_subscription(
        &self,
        tx: &mut dyn LedgerTx,
        change: SubscriptionChange,
        snapshot: &SubscriptionSnapshot,
        ctx: &EventContext,
    ) -> BillingResult<AppliedTransition> {
        let existing = tx.lock_subscription(&snapshot.external_id).await?;

        let owner = resolve_owner(
            tx,
            snapshot.owner_hint()?,
            snapshot.customer_id.as_deref(),
            existing.as_ref().map(|r| r.user_id),
        )
        .await?
        .ok_or_else(|| {
            BillingError::Validation(format!(
                "cannot resolve owner of subscription {}",
                snapshot.external_id
            ))
        })?;

        if let Some(stored) = &existing {
            if stored.user_id != owner.id {
                tracing::warn!(
                    subscription_id = %snapshot.external_id,
                    stored_owner = %stored.user_id,
                    event_owner = %owner.id,
                    "Subscription event names a different owner; keeping the recorded one"
                );
            }
        }

        let plan = self.resolve_subscription_plan(snapshot, existing.as_ref())?;
        let record = build_record(change, snapshot, existing.as_ref(), owner.id, plan, ctx);

        let stale = match &existing {
            Some(stored) => !record.supersedes(stored),
            None => false,
        };
        let saved = if stale {
            None
        } else {
            match tx.upsert_subscription(&record).await {
                Ok(saved) => Some(saved),
                Err(BillingError::StaleEvent(_)) => None,
                Err(e) => return Err(e),
            }
        };

        let Some(saved) = saved else {
            return self
                .record_stale(tx, &owner, &record, existing.as_ref(), ctx)
                .await;
        };

        let entitlement = derive_entitlement(&saved, ctx.now);
        let points_here = owner
            .stripe_subscription_id
            .as_deref()
            .map_or(true, |current| current == saved.external_id);

        let user = if points_here || entitlement.is_active {
            let fields = DerivedUserFields {
                plan: entitlement.plan,
                is_active: entitlement.is_active,
                stripe_customer_id: snapshot.customer_id.clone(),
                stripe_subscription_id: Some(saved.external_id.clone()),
            };
            let updated = tx.update_user_billing(owner.id, &fields).await?;
            if entitlement.is_active {
                UsageMeter::refresh_period(tx, owner.id, saved.current_period_start).await?;
            }
            updated
        } else {
            tracing::info!(
                user_id = %owner.id,
                subscription_id = %saved.external_id,
                current_subscription = ?owner.stripe_subscription_id,
                "Subscription is not the user's current one; user fields left unchanged"
            );
            owner.clone()
        };

        let action = derive_action(change, existing.as_ref(), &saved);
        let log = tx
            .append_log(
                SubscriptionLogBuilder::new(action)
                    .user(owner.id)
                    .plans(Some(owner.plan), Some(user.plan))
                    .provider_event_opt(ctx.event_id.clone())
                    .subscription(saved.external_id.clone())
                    .actor(ctx.actor)
                    .meta("status", saved.status.as_str())
                    .meta("cancel_at_period_end", saved.cancel_at_period_end.to_string())
                    .meta("entitlement", entitlement.state.to_string())
                    .meta("subscription_plan", saved.plan.as_str())
                    .build(),
            )
            .await?;

        tracing::info!(
            user_id = %owner.id,
            subscription_id = %saved.external_id,
            event_id = ?ctx.event_id,
            action = %action,
            status = %saved.status,
            plan = %user.plan,
            is_active = user.is_active,
            "Subscription transition applied"
        );

        Ok(AppliedTransition {
            log,
            subscription: Some(saved),
            payment: None,
            user: Some(user),
            entitlement: Some(entitlement),
            stale: false,
        })
    }

    /// Log an out-of-order subscription event without touching the record
    async fn record_stale(
        &self,
        tx: &mut dyn LedgerTx,
        owner: &User,
        incoming: &SubscriptionRecord,
        stored: Option<&SubscriptionRecord>,
        ctx: &EventContext,
    ) -> BillingResult<AppliedTransition> {
        let message = match stored {
            Some(stored) if incoming.current_period_end < stored.current_period_end => format!(
                "{}: incoming period end {} is older than stored {}",
                STALE_EVENT_MESSAGE, incoming.current_period_end, stored.current_period_end
            ),
            Some(stored) => format!(
                "{}: incoming event time {} is older than stored {} for the same period",
                STALE_EVENT_MESSAGE, incoming.last_event_at, stored.last_event_at
            ),
            None => format!("{}: a newer state was recorded concurrently", STALE_EVENT_MESSAGE),
        };

        tracing::warn!(
            user_id = %owner.id,
            subscription_id = %incoming.external_id,
            event_id = ?ctx.event_id,
            "Ignoring stale subscription event"
        );

        let log = tx
            .append_log(
                SubscriptionLogBuilder::new(LogAction::Updated)
                    .user(owner.id)
                    .plans(Some(owner.plan), Some(owner.plan))
                    .provider_event_opt(ctx.event_id.clone())
                    .subscription(incoming.external_id.clone())
                    .actor(ctx.actor)
                    .failed(message)
                    .meta("stale", "true")
                    .meta("incoming_status", incoming.status.as_str())
                    .build(),
            )
            .await?;

        Ok(AppliedTransition {
            log,
            subscription: stored.cloned(),
            payment: None,
            user: Some(owner.clone()),
            entitlement: None,
            stale: true,
        })
    }

    async fn apply_payment(
        &self,
        tx: &mut dyn LedgerTx,
        outcome: PaymentOutcome,
        snapshot: &PaymentSnapshot,
        ctx: &EventContext,
    ) -> BillingResult<AppliedTransition> {
        let key = snapshot.key();
        if key.is_empty() {
            return Err(BillingError::Validation(
                "payment event carries neither a payment intent nor an invoice".into(),
            ));
        }

        let existing = tx.lock_payment(&key).await?;
        let subscription = match &snapshot.subscription_external_id {
            Some(external_id) => tx.lock_subscription(external_id).await?,
            None => None,
        };

        let fallback_owner = subscription
            .as_ref()
            .map(|s| s.user_id)
            .or_else(|| existing.as_ref().map(|p| p.user_id));
        let owner = resolve_owner(
            tx,
            snapshot.owner_hint()?,
            snapshot.customer_id.as_deref(),
            fallback_owner,
        )
        .await?
        .ok_or_else(|| {
            BillingError::Validation(format!(
                "cannot resolve owner of payment {}",
                describe_key(snapshot)
            ))
        })?;

        let plan = snapshot
            .price_id
            .as_deref()
            .and_then(|price| self.catalog.plan_for_price_id(price))
            .or(snapshot.plan_hint()?)
            .or_else(|| subscription.as_ref().map(|s| s.plan))
            .or_else(|| existing.as_ref().and_then(|p| p.plan));

        let merged = merge_payment(existing.as_ref(), snapshot, owner.id, plan, ctx.now);
        let saved = tx.save_payment(&merged).await?;

        let action = match outcome {
            PaymentOutcome::Succeeded => LogAction::PaymentSucceeded,
            PaymentOutcome::Failed => LogAction::PaymentFailed,
            PaymentOutcome::Refunded => LogAction::Updated,
        };

        let mut builder = SubscriptionLogBuilder::new(action)
            .user(owner.id)
            .plans(Some(owner.plan), Some(owner.plan))
            .provider_event_opt(ctx.event_id.clone())
            .subscription_opt(saved.subscription_external_id.clone())
            .actor(ctx.actor)
            .meta("payment_id", saved.id.to_string())
            .meta("payment_status", saved.status.as_str())
            .meta("amount", saved.amount.to_string())
            .meta("currency", saved.currency.clone());
        if outcome == PaymentOutcome::Refunded {
            builder = builder
                .meta("refund", "true")
                .meta("refunded_amount", saved.refunded_amount.to_string());
        }
        if let Some(code) = &saved.failure_code {
            builder = builder.meta("failure_code", code.clone());
        }
        let log = tx.append_log(builder.build()).await?;

        tracing::info!(
            user_id = %owner.id,
            payment_id = %saved.id,
            event_id = ?ctx.event_id,
            action = %action,
            status = %saved.status,
            amount = saved.amount,
            refunded_amount = saved.refunded_amount,
            currency = %saved.currency,
            "Payment event applied"
        );

        Ok(AppliedTransition {
            log,
            subscription,
            payment: Some(saved),
            user: Some(owner),
            entitlement: None,
            stale: false,
        })
    }

    /// Recompute the owner's fields for a subscription whose cancelled period
    /// has ended. The record's provider status is left as reported.
    ///
    /// Returns `None` when the subscription no longer qualifies (renewed,
    /// reactivated, or the user moved on).
    pub async fn expire(
        &self,
        tx: &mut dyn LedgerTx,
        external_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<AppliedTransition>> {
        let Some(record) = tx.lock_subscription(external_id).await? else {
            return Ok(None);
        };
        let Some(owner) = tx.get_user(record.user_id).await? else {
            return Ok(None);
        };

        let entitlement = derive_entitlement(&record, now);
        let points_here =
            owner.stripe_subscription_id.as_deref() == Some(record.external_id.as_str());
        if entitlement.is_active || !points_here || !owner.is_active {
            return Ok(None);
        }

        let fields = DerivedUserFields {
            plan: entitlement.plan,
            is_active: false,
            stripe_customer_id: None,
            stripe_subscription_id: Some(record.external_id.clone()),
        };
        let user = tx.update_user_billing(owner.id, &fields).await?;

        let log = tx
            .append_log(
                SubscriptionLogBuilder::new(LogAction::Expired)
                    .user(owner.id)
                    .plans(Some(owner.plan), Some(user.plan))
                    .subscription(record.external_id.clone())
                    .actor(ActorType::System)
                    .meta("reason", "period_ended")
                    .meta("period_end", record.current_period_end.to_string())
                    .build(),
            )
            .await?;

        tracing::info!(
            user_id = %owner.id,
            subscription_id = %record.external_id,
            period_end = %record.current_period_end,
            "Cancelled subscription lapsed; user moved to free"
        );

        Ok(Some(AppliedTransition {
            log,
            subscription: Some(record),
            payment: None,
            user: Some(user),
            entitlement: Some(entitlement),
            stale: false,
        }))
    }

    fn resolve_subscription_plan(
        &self,
        snapshot: &SubscriptionSnapshot,
        existing: Option<&SubscriptionRecord>,
    ) -> BillingResult<Plan> {
        if let Some(price) = snapshot.price_id.as_deref() {
            if let Some(plan) = self.catalog.plan_for_price_id(price) {
                return Ok(plan);
            }
        }
        if let Some(plan) = snapshot.plan_hint()? {
            return Ok(plan);
        }
        match (snapshot.price_id.as_deref(), existing) {
            (None, Some(stored)) => Ok(stored.plan),
            (Some(price), _) => Err(BillingError::Validation(format!(
                "price {} does not belong to any plan",
                price
            ))),
            (None, None) => Err(BillingError::Validation(format!(
                "subscription {} has no price or plan",
                snapshot.external_id
            ))),
        }
    }
}

/// Owner lookup: metadata user id, then the provider customer, then the
/// fallback (subscription or payment owner)
async fn resolve_owner(
    tx: &mut dyn LedgerTx,
    hint: Option<UserId>,
    customer_id: Option<&str>,
    fallback: Option<UserId>,
) -> BillingResult<Option<User>> {
    if let Some(user_id) = hint {
        return match tx.get_user(user_id).await? {
            Some(user) => Ok(Some(user)),
            None => Err(BillingError::Validation(format!(
                "event references unknown user {}",
                user_id
            ))),
        };
    }
    if let Some(customer) = customer_id {
        if let Some(user) = tx.find_user_by_customer(customer).await? {
            return Ok(Some(user));
        }
    }
    match fallback {
        Some(user_id) => tx.get_user(user_id).await,
        None => Ok(None),
    }
}

fn build_record(
    change: SubscriptionChange,
    snapshot: &SubscriptionSnapshot,
    existing: Option<&SubscriptionRecord>,
    owner: UserId,
    plan: Plan,
    ctx: &EventContext,
) -> SubscriptionRecord {
    let mut record = SubscriptionRecord {
        id: existing.map_or_else(Uuid::new_v4, |r| r.id),
        external_id: snapshot.external_id.clone(),
        user_id: existing.map_or(owner, |r| r.user_id),
        plan,
        status: snapshot.status,
        current_period_start: snapshot.current_period_start,
        current_period_end: snapshot.current_period_end,
        trial_start: snapshot.trial_start,
        trial_end: snapshot.trial_end,
        cancel_at_period_end: snapshot.cancel_at_period_end,
        canceled_at: snapshot.canceled_at,
        price_id: snapshot.price_id.clone(),
        amount: snapshot.amount,
        currency: snapshot.currency.clone(),
        interval: snapshot.interval,
        interval_count: snapshot.interval_count,
        quantity: snapshot.quantity,
        metadata: snapshot.metadata.clone(),
        last_event_at: ctx.event_time,
        last_synced_at: ctx.now,
        created_at: existing.map_or(ctx.now, |r| r.created_at),
        updated_at: ctx.now,
    };

    match change {
        SubscriptionChange::Cancelled { at_period_end: true } => {
            record.cancel_at_period_end = true;
        }
        SubscriptionChange::Cancelled { at_period_end: false } => {
            record.status = SubscriptionStatus::Canceled;
            record.canceled_at = record.canceled_at.or(Some(ctx.event_time));
        }
        SubscriptionChange::Created | SubscriptionChange::Updated => {}
    }
    record
}

fn describe_key(snapshot: &PaymentSnapshot) -> String {
    snapshot
        .payment_intent_id
        .clone()
        .or_else(|| snapshot.invoice_id.clone())
        .unwrap_or_default()
}
