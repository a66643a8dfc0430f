//! Application state

use std::sync::Arc;

use ideakit_billing::BillingService;

use crate::{auth::SupabaseJwtVerifier, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
    pub jwt_verifier: SupabaseJwtVerifier,
}

impl AppState {
    pub fn new(config: Config, billing: Arc<BillingService>) -> Self {
        let jwt_verifier = SupabaseJwtVerifier::new(&config.supabase_jwt_secret);

        if config.internal_api_key.is_none() {
            tracing::warn!("INTERNAL_API_KEY not set - internal routes will answer 503");
        }

        Self {
            config,
            billing,
            jwt_verifier,
        }
    }
}
