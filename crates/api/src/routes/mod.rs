//! API routes

pub mod admin;
pub mod billing;
pub mod health;
pub mod usage;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{auth::require_auth, state::AppState};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Provider webhook (public, uses signature verification)
    let public_api_routes = Router::new().route("/billing/webhook", post(billing::webhook));

    let protected_api_routes = Router::new()
        // Billing routes
        .route("/billing/status", get(billing::get_status))
        .route("/billing/history", get(billing::get_history))
        .route("/billing/logs", get(billing::get_logs))
        .route("/billing/plan", post(billing::change_plan))
        .route("/billing/cancel", post(billing::cancel))
        .route("/billing/reactivate", post(billing::reactivate))
        // Usage routes
        .route("/usage", get(usage::get_usage))
        .route("/usage/consume", post(usage::consume))
        .route("/usage/check", post(usage::check))
        // Admin stats routes (role check inside handlers)
        .route("/admin/stats/overview", get(admin::get_overview))
        .route("/admin/stats/plans", get(admin::get_plan_distribution))
        .route("/admin/stats/monthly", get(admin::get_monthly_revenue))
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(protected_api_routes);

    let router = Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(state.config.max_request_body_bytes))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    let router = match cors_layer(&state.config.cors_allowed_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    };

    router.with_state(state)
}

/// CORS for browser callers; `None` when no origins are configured
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
    )
}
