//! HTTP routes

pub mod checkout;
pub mod credits;
pub mod internal;
pub mod kits;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{optional_auth, require_auth, require_internal_key},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    // Signed-in users
    let user_routes = Router::new()
        .route("/api/v1/credits/balance", get(credits::get_balance))
        .route("/api/v1/credits/transactions", get(credits::list_transactions))
        .route("/api/v1/credits/spend", post(credits::spend_credits))
        .route("/api/v1/kits", post(kits::create_kit))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // Guests may check out too
    let checkout_routes = Router::new()
        .route("/api/v1/checkout", post(checkout::create_checkout))
        .route_layer(middleware::from_fn_with_state(state.clone(), optional_auth));

    let internal_routes = Router::new()
        .route("/internal/credits/earn", post(internal::earn_credits))
        .route("/internal/billing/invariants", get(internal::run_invariants))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_key,
        ));

    Router::new()
        .route("/health", get(health))
        // Authenticated by the Stripe signature, not a user token
        .route("/api/v1/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(user_routes)
        .merge(checkout_routes)
        .merge(internal_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
