//! Application state

use std::sync::Arc;

use rewritely_billing::BillingService;

use crate::{
    auth::{AuthState, IdentityVerifier},
    rewrite::Rewriter,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub rewriter: Arc<dyn Rewriter>,
    pub identity: IdentityVerifier,
}

impl AppState {
    pub fn new(
        billing: Arc<BillingService>,
        rewriter: Arc<dyn Rewriter>,
        identity: IdentityVerifier,
    ) -> Self {
        Self {
            billing,
            rewriter,
            identity,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            verifier: self.identity.clone(),
        }
    }
}
