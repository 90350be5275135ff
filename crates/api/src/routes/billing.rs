//! Billing routes: provider webhooks and the caller's subscription

use axum::{
    extract::{Extension, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use tierledger_billing::ledger::{HistoryEntry, HistoryKind, Page, PageRequest, SubscriptionLog};
use tierledger_billing::{AppliedTransition, BillingError, BillingStatus, IngestOutcome};
use tierledger_shared::Plan;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

const SIGNATURE_HEADER: &str = "stripe-signature";
const DEFAULT_LOG_LIMIT: u32 = 20;

/// Acknowledgement returned to the provider
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    #[serde(flatten)]
    pub outcome: IngestOutcome,
}

/// Receive a provider webhook.
///
/// Anything the provider should not redeliver is acknowledged with 200;
/// 400 covers bad signatures and rejected events, 500 storage faults and 503
/// an exceeded deadline.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let outcome = state
        .billing
        .webhooks
        .ingest(&body, signature)
        .await
        .map_err(|e| {
            if let BillingError::AuthenticationFailed = e {
                tracing::warn!("Stripe webhook signature verification failed");
            }
            ApiError::from(e)
        })?;

    if let IngestOutcome::Rejected { reason } = &outcome {
        return Err(ApiError::Validation(reason.clone()));
    }

    tracing::info!(outcome = outcome.as_str(), "Stripe webhook processed");
    Ok(Json(WebhookResponse {
        received: true,
        outcome,
    }))
}

/// Current plan, access and usage for the caller
pub async fn get_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<BillingStatus>, ApiError> {
    let status = state.billing.reconciliation.status(auth_user.user_id).await?;
    Ok(Json(status))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub kind: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn get_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Page<HistoryEntry>>, ApiError> {
    let kind = query
        .kind
        .as_deref()
        .map(str::parse::<HistoryKind>)
        .transpose()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let page = state
        .billing
        .reconciliation
        .history(auth_user.user_id, kind, PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<u32>,
}

/// Most recent audit rows for the caller
pub async fn get_logs(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<SubscriptionLog>>, ApiError> {
    let logs = state
        .billing
        .reconciliation
        .recent_logs(
            Some(auth_user.user_id),
            query.limit.unwrap_or(DEFAULT_LOG_LIMIT),
        )
        .await?;
    Ok(Json(logs))
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan: String,
}

pub async fn change_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ChangePlanRequest>,
) -> Result<Json<AppliedTransition>, ApiError> {
    let plan: Plan = req
        .plan
        .parse()
        .map_err(|e: tierledger_shared::SharedError| ApiError::Validation(e.to_string()))?;

    tracing::info!(user_id = %auth_user.user_id, plan = %plan, "Plan change requested");
    let applied = state
        .billing
        .reconciliation
        .change_plan(auth_user.user_id, plan)
        .await?;
    Ok(Json(applied))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    #[serde(default = "default_at_period_end")]
    pub at_period_end: bool,
}

fn default_at_period_end() -> bool {
    true
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<AppliedTransition>, ApiError> {
    tracing::info!(
        user_id = %auth_user.user_id,
        at_period_end = req.at_period_end,
        "Cancellation requested"
    );
    let applied = state
        .billing
        .reconciliation
        .cancel(auth_user.user_id, req.at_period_end)
        .await?;
    Ok(Json(applied))
}

pub async fn reactivate(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<AppliedTransition>, ApiError> {
    tracing::info!(user_id = %auth_user.user_id, "Reactivation requested");
    let applied = state
        .billing
        .reconciliation
        .reactivate(auth_user.user_id)
        .await?;
    Ok(Json(applied))
}
