//! Shared application state

use std::sync::Arc;

use tierledger_billing::BillingService;

use crate::{auth::AuthState, config::Config};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub billing: BillingService,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService) -> Self {
        Self {
            config: Arc::new(config),
            billing,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState::new(&self.config.gateway_token)
    }
}
