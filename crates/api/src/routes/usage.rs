//! Usage metering routes

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Deserialize;

use tierledger_billing::{QuotaDecision, UsageStatus};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    /// Free-form operation name, recorded in logs only
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default = "default_count")]
    pub count: i64,
}

fn default_count() -> i64 {
    1
}

/// Consume usage against the caller's plan; denial is a 403
pub async fn consume(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<UsageRequest>,
) -> Result<Json<QuotaDecision>, ApiError> {
    let decision = state
        .billing
        .usage
        .check_and_consume_for_user(auth_user.user_id, req.count)
        .await?;

    if !decision.allowed {
        tracing::info!(
            user_id = %auth_user.user_id,
            operation = req.operation.as_deref().unwrap_or("unspecified"),
            count = req.count,
            remaining = decision.remaining,
            "Usage request denied"
        );
        return Err(ApiError::QuotaExceeded {
            remaining: decision.remaining,
        });
    }
    Ok(Json(decision))
}

/// Pre-flight check, nothing is consumed
pub async fn check(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<UsageRequest>,
) -> Result<Json<QuotaDecision>, ApiError> {
    let decision = state
        .billing
        .usage
        .preflight(auth_user.user_id, req.count)
        .await?;
    Ok(Json(decision))
}

pub async fn get_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<UsageStatus>, ApiError> {
    let status = state.billing.usage.status(auth_user.user_id).await?;
    Ok(Json(status))
}
