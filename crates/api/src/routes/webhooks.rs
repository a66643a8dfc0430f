//! Stripe webhook endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Handle Stripe webhook events
///
/// Duplicates and no-ops answer 200 so Stripe stops retrying them; any
/// processing error answers 400 so it retries later.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let webhooks = state.billing.webhooks()?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = ?e, "Stripe webhook verification failed");
        ApiError::from(e)
    })?;

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    let outcome = webhooks.handle_event(&event).await.map_err(|e| {
        tracing::error!(event_id = %event.id, error = %e, "Webhook handling error");
        ApiError::BadRequest("Webhook processing failed".to_string())
    })?;

    tracing::info!(event_id = %event.id, outcome = ?outcome, "Stripe webhook processed");

    Ok(StatusCode::OK)
}
