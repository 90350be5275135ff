//! Tierledger API Library
//!
//! HTTP surface for the billing core: provider webhooks, usage metering,
//! subscription management and admin statistics.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, LedgerBackend};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
