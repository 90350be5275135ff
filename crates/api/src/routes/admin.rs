//! Admin billing statistics (admin role only)

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::Deserialize;

use tierledger_billing::ledger::PlanCount;
use tierledger_billing::reconciliation::{MonthlyRevenue, Overview};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

const DEFAULT_REVENUE_MONTHS: u32 = 12;

pub async fn get_overview(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<Overview>, ApiError> {
    auth_user.require_admin()?;
    Ok(Json(state.billing.reconciliation.overview().await?))
}

pub async fn get_plan_distribution(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<Vec<PlanCount>>, ApiError> {
    auth_user.require_admin()?;
    Ok(Json(state.billing.reconciliation.plan_distribution().await?))
}

#[derive(Debug, Deserialize)]
pub struct MonthlyQuery {
    pub months: Option<u32>,
}

pub async fn get_monthly_revenue(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<MonthlyQuery>,
) -> Result<Json<Vec<MonthlyRevenue>>, ApiError> {
    auth_user.require_admin()?;
    let months = query.months.unwrap_or(DEFAULT_REVENUE_MONTHS);
    Ok(Json(
        state.billing.reconciliation.monthly_revenue(months).await?,
    ))
}
