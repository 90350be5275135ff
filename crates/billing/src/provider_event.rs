//! Provider event parsing
//!
//! Webhook payloads are parsed into our own serde structs shaped like the
//! provider's objects instead of `stripe::Event`, so API-version drift in
//! fields we never read cannot break ingestion. The same object parsers also
//! read subscriptions returned by the provider API.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use tierledger_shared::{
    normalize_currency, BillingInterval, Metadata, PaymentStatus, Plan, SubscriptionStatus,
    UserId,
};

use crate::error::{BillingError, BillingResult};
use crate::ledger::{BillingAddress, PaymentKey, PaymentMethodSummary};

/// Metadata key carrying our user id on provider objects
pub const USER_ID_METADATA_KEY: &str = "user_id";
/// Metadata key carrying the plan name on provider objects
pub const PLAN_METADATA_KEY: &str = "plan";

// =============================================================================
// Envelope
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(alias = "eventId")]
    id: Option<String>,
    #[serde(rename = "type", alias = "eventType")]
    event_type: Option<String>,
    #[serde(default, alias = "createdAt")]
    created: Option<i64>,
    #[serde(default)]
    data: Option<RawData>,
    #[serde(default)]
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawData {
    object: Value,
}

/// A parsed, not yet interpreted provider event
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    /// Business time of the event
    pub created: OffsetDateTime,
    pub object: Value,
}

impl ProviderEvent {
    /// Parse either the provider's envelope (`id`, `type`, `created`,
    /// `data.object`) or the normalized one (`eventId`, `eventType`,
    /// `payload`). Events without a timestamp take the receipt time.
    pub fn parse(raw: &str, received_at: OffsetDateTime) -> BillingResult<Self> {
        let envelope: RawEnvelope = serde_json::from_str(raw)
            .map_err(|e| BillingError::Validation(format!("malformed event envelope: {}", e)))?;

        let id = envelope
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| BillingError::Validation("event id is missing".into()))?;
        let event_type = envelope
            .event_type
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| BillingError::Validation("event type is missing".into()))?;
        let object = envelope
            .data
            .map(|d| d.object)
            .or(envelope.payload)
            .ok_or_else(|| BillingError::Validation("event payload is missing".into()))?;
        let created = match envelope.created {
            Some(ts) => timestamp(ts)?,
            None => received_at,
        };

        Ok(Self {
            id,
            event_type,
            created,
            object,
        })
    }

    /// Interpret the event. `Ok(None)` means the type is not one we act on.
    pub fn translate(&self) -> BillingResult<Option<BillingEvent>> {
        let event = match self.event_type.as_str() {
            "customer.subscription.created" => BillingEvent::Subscription {
                change: SubscriptionChange::Created,
                snapshot: SubscriptionSnapshot::from_object(&self.object)?,
            },
            "customer.subscription.updated" => BillingEvent::Subscription {
                change: SubscriptionChange::Updated,
                snapshot: SubscriptionSnapshot::from_object(&self.object)?,
            },
            "customer.subscription.deleted" => BillingEvent::Subscription {
                change: SubscriptionChange::Cancelled {
                    at_period_end: false,
                },
                snapshot: SubscriptionSnapshot::from_object(&self.object)?,
            },
            "invoice.paid" | "invoice.payment_succeeded" => BillingEvent::Payment {
                outcome: PaymentOutcome::Succeeded,
                snapshot: PaymentSnapshot::from_invoice(&self.object, PaymentOutcome::Succeeded)?,
            },
            "invoice.payment_failed" => BillingEvent::Payment {
                outcome: PaymentOutcome::Failed,
                snapshot: PaymentSnapshot::from_invoice(&self.object, PaymentOutcome::Failed)?,
            },
            "payment_intent.succeeded" => BillingEvent::Payment {
                outcome: PaymentOutcome::Succeeded,
                snapshot: PaymentSnapshot::from_payment_intent(
                    &self.object,
                    PaymentOutcome::Succeeded,
                    self.created,
                )?,
            },
            "payment_intent.payment_failed" => BillingEvent::Payment {
                outcome: PaymentOutcome::Failed,
                snapshot: PaymentSnapshot::from_payment_intent(
                    &self.object,
                    PaymentOutcome::Failed,
                    self.created,
                )?,
            },
            "charge.refunded" => BillingEvent::Payment {
                outcome: PaymentOutcome::Refunded,
                snapshot: PaymentSnapshot::from_charge(&self.object)?,
            },
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

// =============================================================================
// Domain events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    Created,
    Updated,
    Cancelled { at_period_end: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    Subscription {
        change: SubscriptionChange,
        snapshot: SubscriptionSnapshot,
    },
    Payment {
        outcome: PaymentOutcome,
        snapshot: PaymentSnapshot,
    },
}

/// Provider view of a subscription at the time of an event
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub external_id: String,
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub amount: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub interval_count: i32,
    pub quantity: i32,
    pub metadata: Metadata,
}

impl SubscriptionSnapshot {
    pub fn from_object(object: &Value) -> BillingResult<Self> {
        let raw: RawSubscription = from_value(object, "subscription")?;

        let first_item = raw.items.as_ref().and_then(|list| list.data.first());
        let price = first_item
            .and_then(|item| item.price.as_ref())
            .or(raw.plan.as_ref());
        let quantity = first_item
            .and_then(|item| item.quantity)
            .or(raw.quantity)
            .unwrap_or(1);

        // Newer API versions moved the period bounds onto the items
        let period_start = raw
            .current_period_start
            .or_else(|| first_item.and_then(|item| item.current_period_start))
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "subscription {} has no current_period_start",
                    raw.id
                ))
            })?;
        let period_end = raw
            .current_period_end
            .or_else(|| first_item.and_then(|item| item.current_period_end))
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "subscription {} has no current_period_end",
                    raw.id
                ))
            })?;

        let currency = raw
            .currency
            .as_deref()
            .or_else(|| price.and_then(|p| p.currency.as_deref()))
            .ok_or_else(|| {
                BillingError::Validation(format!("subscription {} has no currency", raw.id))
            })?;

        let (interval, interval_count) = match price.and_then(|p| p.recurring.as_ref()) {
            Some(recurring) => (
                recurring.interval.parse::<BillingInterval>()?,
                recurring.interval_count.unwrap_or(1),
            ),
            None => (BillingInterval::default(), 1),
        };

        let amount = price
            .and_then(|p| p.unit_amount)
            .unwrap_or(0)
            .checked_mul(quantity)
            .filter(|amount| *amount >= 0)
            .ok_or_else(|| {
                BillingError::Validation(format!("subscription {} has an invalid amount", raw.id))
            })?;

        Ok(Self {
            customer_id: raw.customer.map(IdOrObject::into_id),
            status: raw.status.parse()?,
            price_id: price.map(|p| p.id.clone()),
            current_period_start: timestamp(period_start)?,
            current_period_end: timestamp(period_end)?,
            trial_start: raw.trial_start.map(timestamp).transpose()?,
            trial_end: raw.trial_end.map(timestamp).transpose()?,
            cancel_at_period_end: raw.cancel_at_period_end,
            canceled_at: raw.canceled_at.map(timestamp).transpose()?,
            amount,
            currency: normalize_currency(currency)?,
            interval,
            interval_count: to_i32(interval_count, "interval_count")?,
            quantity: to_i32(quantity, "quantity")?,
            metadata: Metadata::from_map(raw.metadata)?,
            external_id: raw.id,
        })
    }

    pub fn owner_hint(&self) -> BillingResult<Option<UserId>> {
        owner_from_metadata(&self.metadata)
    }

    pub fn plan_hint(&self) -> BillingResult<Option<Plan>> {
        plan_from_metadata(&self.metadata)
    }
}

/// Provider view of a payment at the time of an event
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSnapshot {
    pub payment_intent_id: Option<String>,
    pub invoice_id: Option<String>,
    pub subscription_external_id: Option<String>,
    pub customer_id: Option<String>,
    pub price_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub refunded_amount: i64,
    pub refund_reason: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub receipt_url: Option<String>,
    pub description: Option<String>,
    pub payment_method: PaymentMethodSummary,
    pub billing_address: Option<BillingAddress>,
    pub paid_at: Option<OffsetDateTime>,
    pub metadata: Metadata,
}

impl PaymentSnapshot {
    pub fn key(&self) -> PaymentKey {
        PaymentKey {
            payment_intent_id: self.payment_intent_id.clone(),
            invoice_id: self.invoice_id.clone(),
        }
    }

    pub fn owner_hint(&self) -> BillingResult<Option<UserId>> {
        owner_from_metadata(&self.metadata)
    }

    pub fn plan_hint(&self) -> BillingResult<Option<Plan>> {
        plan_from_metadata(&self.metadata)
    }

    pub fn from_invoice(object: &Value, outcome: PaymentOutcome) -> BillingResult<Self> {
        let raw: RawInvoice = from_value(object, "invoice")?;

        // Subscription invoices carry the subscription's metadata in
        // subscription_details; invoice-level keys win
        let mut entries = raw
            .subscription_details
            .as_ref()
            .map(|d| d.metadata.clone())
            .unwrap_or_default();
        entries.extend(raw.metadata.clone());

        let line_price = raw
            .lines
            .as_ref()
            .and_then(|lines| lines.data.first())
            .and_then(|line| line.price.as_ref())
            .map(|p| p.id.clone());

        let (status, amount, paid_at) = match outcome {
            PaymentOutcome::Failed => (PaymentStatus::Failed, raw.amount_due, None),
            _ => {
                let paid_at = raw
                    .status_transitions
                    .as_ref()
                    .and_then(|t| t.paid_at)
                    .or(raw.created)
                    .map(timestamp)
                    .transpose()?;
                (PaymentStatus::Succeeded, raw.amount_paid, paid_at)
            }
        };

        let snapshot = Self {
            payment_intent_id: raw.payment_intent.map(IdOrObject::into_id),
            subscription_external_id: raw.subscription.map(IdOrObject::into_id),
            customer_id: raw.customer.map(IdOrObject::into_id),
            price_id: line_price,
            amount: non_negative(amount, "amount")?,
            currency: normalize_currency(&raw.currency)?,
            status,
            refunded_amount: 0,
            refund_reason: None,
            failure_code: None,
            failure_message: None,
            receipt_url: raw.hosted_invoice_url,
            description: raw.description,
            payment_method: PaymentMethodSummary::default(),
            billing_address: raw.customer_address.map(RawAddress::into_address),
            paid_at,
            metadata: Metadata::from_map(entries)?,
            invoice_id: Some(raw.id),
        };
        Ok(snapshot)
    }

    pub fn from_payment_intent(
        object: &Value,
        outcome: PaymentOutcome,
        event_time: OffsetDateTime,
    ) -> BillingResult<Self> {
        let raw: RawPaymentIntent = from_value(object, "payment intent")?;

        let (status, amount, paid_at) = match outcome {
            PaymentOutcome::Failed => (PaymentStatus::Failed, raw.amount, None),
            _ => (
                PaymentStatus::Succeeded,
                raw.amount_received.unwrap_or(raw.amount),
                Some(event_time),
            ),
        };
        let error = raw.last_payment_error.unwrap_or_default();

        Ok(Self {
            invoice_id: raw.invoice.map(IdOrObject::into_id),
            subscription_external_id: None,
            customer_id: raw.customer.map(IdOrObject::into_id),
            price_id: None,
            amount: non_negative(amount, "amount")?,
            currency: normalize_currency(&raw.currency)?,
            status,
            refunded_amount: 0,
            refund_reason: None,
            failure_code: error.decline_code.or(error.code),
            failure_message: error.message,
            receipt_url: None,
            description: raw.description,
            payment_method: PaymentMethodSummary {
                kind: raw.payment_method_types.into_iter().next(),
                card_brand: None,
                card_last4: None,
            },
            billing_address: None,
            paid_at,
            metadata: Metadata::from_map(raw.metadata)?,
            payment_intent_id: Some(raw.id),
        })
    }

    pub fn from_charge(object: &Value) -> BillingResult<Self> {
        let raw: RawCharge = from_value(object, "charge")?;

        let payment_intent_id = raw.payment_intent.map(IdOrObject::into_id);
        let invoice_id = raw.invoice.map(IdOrObject::into_id);
        if payment_intent_id.is_none() && invoice_id.is_none() {
            return Err(BillingError::Validation(format!(
                "charge {} references neither a payment intent nor an invoice",
                raw.id
            )));
        }

        let amount = non_negative(raw.amount, "amount")?;
        let refunded = non_negative(raw.amount_refunded, "amount_refunded")?.min(amount);
        let status = if refunded >= amount {
            PaymentStatus::Refunded
        } else if refunded > 0 {
            PaymentStatus::PartiallyRefunded
        } else {
            PaymentStatus::Succeeded
        };

        let refund_reason = raw
            .refunds
            .as_ref()
            .and_then(|list| list.data.first())
            .and_then(|refund| refund.reason.clone());

        let payment_method = raw
            .payment_method_details
            .map(|details| {
                let card = details.card.unwrap_or_default();
                PaymentMethodSummary {
                    kind: details.kind,
                    card_brand: card.brand,
                    card_last4: card.last4,
                }
            })
            .unwrap_or_default();

        Ok(Self {
            payment_intent_id,
            invoice_id,
            subscription_external_id: None,
            customer_id: raw.customer.map(IdOrObject::into_id),
            price_id: None,
            amount,
            currency: normalize_currency(&raw.currency)?,
            status,
            refunded_amount: refunded,
            refund_reason,
            failure_code: raw.failure_code,
            failure_message: raw.failure_message,
            receipt_url: raw.receipt_url,
            description: raw.description,
            payment_method,
            billing_address: raw
                .billing_details
                .and_then(|b| b.address)
                .map(RawAddress::into_address),
            paid_at: raw.created.map(timestamp).transpose()?,
            metadata: Metadata::from_map(raw.metadata)?,
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn from_value<T: serde::de::DeserializeOwned>(object: &Value, what: &str) -> BillingResult<T> {
    T::deserialize(object)
        .map_err(|e| BillingError::Validation(format!("malformed {} object: {}", what, e)))
}

fn timestamp(ts: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|_| BillingError::Validation(format!("invalid timestamp {}", ts)))
}

fn to_i32(value: i64, field: &str) -> BillingResult<i32> {
    i32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| BillingError::Validation(format!("{} out of range: {}", field, value)))
}

fn non_negative(value: i64, field: &str) -> BillingResult<i64> {
    if value < 0 {
        return Err(BillingError::Validation(format!(
            "{} must not be negative: {}",
            field, value
        )));
    }
    Ok(value)
}

fn owner_from_metadata(metadata: &Metadata) -> BillingResult<Option<UserId>> {
    metadata
        .get(USER_ID_METADATA_KEY)
        .map(|raw| raw.parse::<UserId>().map_err(BillingError::from))
        .transpose()
}

fn plan_from_metadata(metadata: &Metadata) -> BillingResult<Option<Plan>> {
    metadata
        .get(PLAN_METADATA_KEY)
        .map(|raw| raw.parse::<Plan>().map_err(BillingError::from))
        .transpose()
}

/// Expandable reference: either a bare id or the expanded object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdOrObject {
    Id(String),
    Object { id: String },
}

impl IdOrObject {
    fn into_id(self) -> String {
        match self {
            IdOrObject::Id(id) | IdOrObject::Object { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RawRecurring {
    interval: String,
    interval_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawPrice {
    id: String,
    unit_amount: Option<i64>,
    currency: Option<String>,
    recurring: Option<RawRecurring>,
}

#[derive(Debug, Deserialize)]
struct RawSubscriptionItem {
    price: Option<RawPrice>,
    quantity: Option<i64>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawSubscription {
    id: String,
    customer: Option<IdOrObject>,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    trial_start: Option<i64>,
    trial_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    canceled_at: Option<i64>,
    currency: Option<String>,
    items: Option<RawList<RawSubscriptionItem>>,
    /// Legacy single-plan field
    plan: Option<RawPrice>,
    quantity: Option<i64>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawStatusTransitions {
    paid_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawSubscriptionDetails {
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawInvoiceLine {
    price: Option<RawPrice>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAddress {
    line1: Option<String>,
    line2: Option<String>,
    city: Option<String>,
    state: Option<String>,
    postal_code: Option<String>,
    country: Option<String>,
}

impl RawAddress {
    fn into_address(self) -> BillingAddress {
        BillingAddress {
            line1: self.line1,
            line2: self.line2,
            city: self.city,
            state: self.state,
            postal_code: self.postal_code,
            country: self.country,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawInvoice {
    id: String,
    customer: Option<IdOrObject>,
    subscription: Option<IdOrObject>,
    payment_intent: Option<IdOrObject>,
    #[serde(default)]
    amount_due: i64,
    #[serde(default)]
    amount_paid: i64,
    currency: String,
    created: Option<i64>,
    status_transitions: Option<RawStatusTransitions>,
    subscription_details: Option<RawSubscriptionDetails>,
    lines: Option<RawList<RawInvoiceLine>>,
    hosted_invoice_url: Option<String>,
    description: Option<String>,
    customer_address: Option<RawAddress>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPaymentError {
    code: Option<String>,
    decline_code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPaymentIntent {
    id: String,
    amount: i64,
    amount_received: Option<i64>,
    currency: String,
    customer: Option<IdOrObject>,
    invoice: Option<IdOrObject>,
    description: Option<String>,
    last_payment_error: Option<RawPaymentError>,
    #[serde(default)]
    payment_method_types: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawRefund {
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCard {
    brand: Option<String>,
    last4: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPaymentMethodDetails {
    #[serde(rename = "type")]
    kind: Option<String>,
    card: Option<RawCard>,
}

#[derive(Debug, Deserialize)]
struct RawBillingDetails {
    address: Option<RawAddress>,
}

#[derive(Debug, Deserialize)]
struct RawCharge {
    id: String,
    amount: i64,
    #[serde(default)]
    amount_refunded: i64,
    currency: String,
    customer: Option<IdOrObject>,
    payment_intent: Option<IdOrObject>,
    invoice: Option<IdOrObject>,
    created: Option<i64>,
    receipt_url: Option<String>,
    description: Option<String>,
    failure_code: Option<String>,
    failure_message: Option<String>,
    refunds: Option<RawList<RawRefund>>,
    payment_method_details: Option<RawPaymentMethodDetails>,
    billing_details: Option<RawBillingDetails>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}
