//! Payment record merging
//!
//! Provider payment events arrive out of order and repeat. Merging a snapshot
//! into the stored row keeps three rules:
//!
//! - amount and currency are fixed when the row is created
//! - the refunded amount only grows and never exceeds the amount
//! - a captured payment never regresses to failed, pending or cancelled

use time::OffsetDateTime;
use uuid::Uuid;

use tierledger_shared::{PaymentStatus, Plan, UserId};

use crate::ledger::PaymentInfo;
use crate::provider_event::PaymentSnapshot;

/// Status after merging, given the merged refunded amount
fn merge_status(
    stored: Option<PaymentStatus>,
    incoming: PaymentStatus,
    refunded: i64,
    amount: i64,
) -> PaymentStatus {
    if refunded > 0 {
        return if refunded >= amount {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
    }
    match stored {
        Some(current) if current.is_captured() && !incoming.is_captured() => current,
        _ => incoming,
    }
}

/// Fold a provider snapshot into the stored payment (or a new one)
pub fn merge_payment(
    existing: Option<&PaymentInfo>,
    snapshot: &PaymentSnapshot,
    owner: UserId,
    plan: Option<Plan>,
    now: OffsetDateTime,
) -> PaymentInfo {
    let Some(stored) = existing else {
        let refunded = snapshot.refunded_amount.max(0).min(snapshot.amount);
        return PaymentInfo {
            id: Uuid::new_v4(),
            user_id: owner,
            payment_intent_id: snapshot.payment_intent_id.clone(),
            invoice_id: snapshot.invoice_id.clone(),
            subscription_external_id: snapshot.subscription_external_id.clone(),
            plan,
            amount: snapshot.amount,
            currency: snapshot.currency.clone(),
            status: merge_status(None, snapshot.status, refunded, snapshot.amount),
            payment_method: snapshot.payment_method.clone(),
            billing_address: snapshot.billing_address.clone(),
            receipt_url: snapshot.receipt_url.clone(),
            refunded_amount: refunded,
            refund_reason: snapshot.refund_reason.clone(),
            failure_code: snapshot.failure_code.clone(),
            failure_message: snapshot.failure_message.clone(),
            description: snapshot.description.clone(),
            metadata: snapshot.metadata.clone(),
            paid_at: snapshot.paid_at,
            created_at: now,
            updated_at: now,
        };
    };

    if snapshot.currency != stored.currency {
        tracing::warn!(
            payment_id = %stored.id,
            stored_currency = %stored.currency,
            incoming_currency = %snapshot.currency,
            "Payment event currency differs from the recorded currency; keeping the recorded one"
        );
    }

    let refunded = stored
        .refunded_amount
        .max(snapshot.refunded_amount.min(stored.amount));
    let status = merge_status(Some(stored.status), snapshot.status, refunded, stored.amount);

    let (failure_code, failure_message) = if status == PaymentStatus::Failed {
        (
            snapshot.failure_code.clone().or_else(|| stored.failure_code.clone()),
            snapshot
                .failure_message
                .clone()
                .or_else(|| stored.failure_message.clone()),
        )
    } else {
        (stored.failure_code.clone(), stored.failure_message.clone())
    };

    let payment_method = if snapshot.payment_method.kind.is_some() {
        snapshot.payment_method.clone()
    } else {
        stored.payment_method.clone()
    };

    let mut metadata = stored.metadata.clone();
    for (key, value) in snapshot.metadata.iter() {
        metadata.insert(key.clone(), value.clone());
    }

    PaymentInfo {
        id: stored.id,
        user_id: stored.user_id,
        payment_intent_id: stored
            .payment_intent_id
            .clone()
            .or_else(|| snapshot.payment_intent_id.clone()),
        invoice_id: stored.invoice_id.clone().or_else(|| snapshot.invoice_id.clone()),
        subscription_external_id: snapshot
            .subscription_external_id
            .clone()
            .or_else(|| stored.subscription_external_id.clone()),
        plan: stored.plan.or(plan),
        amount: stored.amount,
        currency: stored.currency.clone(),
        status,
        payment_method,
        billing_address: snapshot
            .billing_address
            .clone()
            .or_else(|| stored.billing_address.clone()),
        receipt_url: snapshot.receipt_url.clone().or_else(|| stored.receipt_url.clone()),
        refunded_amount: refunded,
        refund_reason: snapshot
            .refund_reason
            .clone()
            .or_else(|| stored.refund_reason.clone()),
        failure_code,
        failure_message,
        description: snapshot.description.clone().or_else(|| stored.description.clone()),
        metadata,
        paid_at: stored.paid_at.or(snapshot.paid_at),
        created_at: stored.created_at,
        updated_at: now,
    }
}
