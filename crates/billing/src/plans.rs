//! Plan catalog
//!
//! Static table mapping each plan to its usage limit, file size limit,
//! feature list and provider price id. Loaded once at startup from
//! deployment configuration and shared read-only afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tierledger_shared::Plan;

use crate::error::{BillingError, BillingResult};

/// Sentinel for "no limit"
pub const UNLIMITED: i64 = -1;

/// Limits and pricing for a single plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    /// Metered operations per billing period (`-1` = unlimited)
    pub max_usage: i64,
    /// Largest accepted upload in bytes
    pub max_file_size: u64,
    pub features: Vec<String>,
    /// Provider price id (absent for the free plan)
    #[serde(default)]
    pub price_id: Option<String>,
}

impl PlanLimits {
    pub fn is_unlimited(&self) -> bool {
        self.max_usage == UNLIMITED
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCatalog {
    plans: BTreeMap<Plan, PlanLimits>,
}

impl PlanCatalog {
    /// Build a catalog, requiring an entry for every plan
    pub fn new(plans: BTreeMap<Plan, PlanLimits>) -> BillingResult<Self> {
        for plan in Plan::ALL {
            let limits = plans
                .get(&plan)
                .ok_or_else(|| BillingError::Config(format!("plan '{}' is not configured", plan)))?;
            if limits.max_usage < UNLIMITED {
                return Err(BillingError::Config(format!(
                    "plan '{}' has invalid maxUsage {}",
                    plan, limits.max_usage
                )));
            }
            if plan.is_paid() && limits.price_id.as_deref().map_or(true, str::is_empty) {
                tracing::warn!(plan = %plan, "Paid plan has no provider price id configured");
            }
        }
        Ok(Self { plans })
    }

    /// Default catalog with the given provider price ids
    pub fn with_price_ids(
        basic: Option<String>,
        pro: Option<String>,
        enterprise: Option<String>,
    ) -> Self {
        const MB: u64 = 1024 * 1024;
        let features = |list: &[&str]| list.iter().map(|f| f.to_string()).collect::<Vec<_>>();

        let mut plans = BTreeMap::new();
        plans.insert(
            Plan::Free,
            PlanLimits {
                max_usage: 100,
                max_file_size: 5 * MB,
                features: features(&["basic_transformations"]),
                price_id: None,
            },
        );
        plans.insert(
            Plan::Basic,
            PlanLimits {
                max_usage: 1_000,
                max_file_size: 25 * MB,
                features: features(&["basic_transformations", "background_removal"]),
                price_id: basic,
            },
        );
        plans.insert(
            Plan::Pro,
            PlanLimits {
                max_usage: 10_000,
                max_file_size: 100 * MB,
                features: features(&[
                    "basic_transformations",
                    "background_removal",
                    "generative_fill",
                    "priority_queue",
                ]),
                price_id: pro,
            },
        );
        plans.insert(
            Plan::Enterprise,
            PlanLimits {
                max_usage: UNLIMITED,
                max_file_size: 500 * MB,
                features: features(&[
                    "basic_transformations",
                    "background_removal",
                    "generative_fill",
                    "priority_queue",
                    "dedicated_support",
                ]),
                price_id: enterprise,
            },
        );
        Self { plans }
    }

    /// Load from `PLAN_CONFIG_PATH` (JSON object keyed by plan name), falling
    /// back to the default table with `STRIPE_PRICE_*` price ids
    pub fn from_env() -> BillingResult<Self> {
        if let Ok(path) = std::env::var("PLAN_CONFIG_PATH") {
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                BillingError::Config(format!("failed to read plan config {}: {}", path, e))
            })?;
            return Self::from_json(&raw);
        }

        let price = |var: &str| std::env::var(var).ok().filter(|v| !v.is_empty());
        Ok(Self::with_price_ids(
            price("STRIPE_PRICE_BASIC"),
            price("STRIPE_PRICE_PRO"),
            price("STRIPE_PRICE_ENTERPRISE"),
        ))
    }

    pub fn from_json(raw: &str) -> BillingResult<Self> {
        let plans: BTreeMap<Plan, PlanLimits> = serde_json::from_str(raw)
            .map_err(|e| BillingError::Config(format!("invalid plan config: {}", e)))?;
        Self::new(plans)
    }

    pub fn limits(&self, plan: Plan) -> &PlanLimits {
        // Construction guarantees every plan is present
        match self.plans.get(&plan) {
            Some(limits) => limits,
            None => unreachable!("plan catalog is missing {}", plan),
        }
    }

    pub fn max_usage(&self, plan: Plan) -> i64 {
        self.limits(plan).max_usage
    }

    pub fn price_id(&self, plan: Plan) -> Option<&str> {
        self.limits(plan).price_id.as_deref()
    }

    /// Resolve the plan a provider price belongs to
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<Plan> {
        self.plans
            .iter()
            .find(|(_, limits)| limits.price_id.as_deref() == Some(price_id))
            .map(|(plan, _)| *plan)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Plan, &PlanLimits)> {
        self.plans.iter()
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::with_price_ids(None, None, None)
    }
}
