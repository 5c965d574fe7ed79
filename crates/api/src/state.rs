//! Application state

use std::sync::Arc;

use atasura_billing::BillingService;

use crate::{
    auth::{AuthState, SupabaseJwtVerifier},
    generation::GenerationService,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub generation: Arc<dyn GenerationService>,
    pub auth: AuthState,
}

impl AppState {
    pub fn new(
        billing: Arc<BillingService>,
        generation: Arc<dyn GenerationService>,
        supabase_jwt_secret: &str,
    ) -> Self {
        Self {
            billing,
            generation,
            auth: AuthState {
                verifier: SupabaseJwtVerifier::new(supabase_jwt_secret),
            },
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        self.auth.clone()
    }
}
