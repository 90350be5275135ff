//! Entitlement Module
//!
//! Answers "what plan does this user have right now, and why?".
//!
//! The user's `plan` and `is_active` fields are always derived from a
//! subscription record by [`derive_entitlement`]; nothing else decides them.
//! The derivation is a pure function of the record and the clock so the state
//! machine, the lapse sweep and the status API agree.

use serde::Serialize;
use time::OffsetDateTime;

use tierledger_shared::{Plan, SubscriptionStatus};

use crate::ledger::{SubscriptionRecord, User};

/// Where the user's access stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    /// No subscription on record
    Free,
    Trialing,
    Active,
    /// Cancelled at period end, period not over yet
    CanceledGrace,
    /// Cancelled at period end and the period is over
    Lapsed,
    PastDue,
    /// Any other non-entitled provider status
    Inactive,
}

impl std::fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitlementState::Free => write!(f, "free"),
            EntitlementState::Trialing => write!(f, "trialing"),
            EntitlementState::Active => write!(f, "active"),
            EntitlementState::CanceledGrace => write!(f, "canceled_grace"),
            EntitlementState::Lapsed => write!(f, "lapsed"),
            EntitlementState::PastDue => write!(f, "past_due"),
            EntitlementState::Inactive => write!(f, "inactive"),
        }
    }
}

/// Entitlement derived from one subscription record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub state: EntitlementState,
    /// Effective plan (`free` unless active)
    pub plan: Plan,
    pub is_active: bool,
    /// When access ends without further action (trial end or cancelled period end)
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl Entitlement {
    pub fn free() -> Self {
        Self {
            state: EntitlementState::Free,
            plan: Plan::Free,
            is_active: false,
            expires_at: None,
        }
    }
}

/// Pure function: derive the entitlement a subscription grants at `now`
pub fn derive_entitlement(record: &SubscriptionRecord, now: OffsetDateTime) -> Entitlement {
    let lapsed = record.cancel_at_period_end && record.current_period_end <= now;
    let is_active = record.status.is_entitled() && !lapsed;

    let (state, expires_at) = match record.status {
        _ if lapsed && record.status.is_entitled() => (EntitlementState::Lapsed, None),
        SubscriptionStatus::Trialing => (
            EntitlementState::Trialing,
            record.trial_end.or(Some(record.current_period_end)),
        ),
        SubscriptionStatus::Active if record.cancel_at_period_end => (
            EntitlementState::CanceledGrace,
            Some(record.current_period_end),
        ),
        SubscriptionStatus::Active => (EntitlementState::Active, None),
        SubscriptionStatus::PastDue => (EntitlementState::PastDue, None),
        _ => (EntitlementState::Inactive, None),
    };

    Entitlement {
        state,
        plan: if is_active { record.plan } else { Plan::Free },
        is_active,
        expires_at,
    }
}

/// Entitlement for a user given their current subscription, if any
pub fn entitlement_for_user(
    user: &User,
    subscription: Option<&SubscriptionRecord>,
    now: OffsetDateTime,
) -> Entitlement {
    match subscription {
        Some(record) if user.stripe_subscription_id.is_none()
            || user.stripe_subscription_id.as_deref() == Some(record.external_id.as_str()) =>
        {
            derive_entitlement(record, now)
        }
        _ => Entitlement {
            plan: user.plan,
            is_active: user.is_active,
            ..Entitlement::free()
        },
    }
}
