//! Checkout session creation for kits

use axum::{
    extract::{Extension, State},
    Json,
};
use ideakit_billing::CheckoutResponse;
use serde::Deserialize;
use uuid::Uuid;

use crate::{auth::MaybeAuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub kit_id: Uuid,
    /// `oneoff` or `subscription`
    pub plan_type: String,
}

/// Create a checkout session; guests check out without a user id
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(caller): Extension<MaybeAuthUser>,
    Json(req): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let checkout = state.billing.checkout()?;

    let response = checkout
        .create_checkout(req.kit_id, &req.plan_type, caller.user_id())
        .await
        .map_err(|e| {
            tracing::error!(
                kit_id = %req.kit_id,
                plan_type = %req.plan_type,
                user_id = ?caller.user_id(),
                error = %e,
                "create_checkout failed"
            );
            e
        })?;

    Ok(Json(response))
}
