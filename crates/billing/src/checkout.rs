//! Checkout orchestration
//!
//! Creates a provider-hosted checkout session for a kit and records a
//! pending order keyed by the session id. The order id is generated first so
//! it can travel in the session metadata; webhook handlers use it to find the
//! order when subscription events arrive before the session completes.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::client::checkout_metadata;
use crate::error::{BillingError, BillingResult};
use crate::models::NewOrder;
use crate::pricing::{PlanType, PricingConfig, CURRENCY};
use crate::provider::{CheckoutSessionRequest, PaymentProvider};
use crate::store::{KitStore, OrderStore};

/// Returned to the caller, who redirects the browser to `url`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    orders: Arc<dyn OrderStore>,
    kits: Arc<dyn KitStore>,
    provider: Arc<dyn PaymentProvider>,
    pricing: PricingConfig,
    app_base_url: String,
}

impl CheckoutService {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        kits: Arc<dyn KitStore>,
        provider: Arc<dyn PaymentProvider>,
        pricing: PricingConfig,
        app_base_url: impl Into<String>,
    ) -> Self {
        Self {
            orders,
            kits,
            provider,
            pricing,
            app_base_url: app_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Open a checkout session for `kit_id` and record the pending order
    ///
    /// `user_id` is `None` for guest checkout. A kit that already belongs to
    /// a user can only be bought by that user.
    pub async fn create_checkout(
        &self,
        kit_id: Uuid,
        plan_type: &str,
        user_id: Option<Uuid>,
    ) -> BillingResult<CheckoutResponse> {
        let plan_type: PlanType = plan_type.parse()?;

        let kit = self
            .kits
            .find(kit_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("kit {}", kit_id)))?;

        if kit.has_access {
            return Err(BillingError::InvalidInput(
                "kit is already unlocked".to_string(),
            ));
        }
        if let Some(owner) = kit.user_id {
            if user_id != Some(owner) {
                tracing::warn!(
                    kit_id = %kit_id,
                    caller = ?user_id,
                    "Checkout attempted for a kit owned by another user"
                );
                return Err(BillingError::InvalidInput(
                    "kit does not belong to the caller".to_string(),
                ));
            }
        }

        let order_id = Uuid::new_v4();
        let amount = self.pricing.checkout_amount(plan_type);
        let product_name = match plan_type {
            PlanType::OneOff => format!("IdeaKit: {}", kit.name),
            PlanType::Subscription => format!("IdeaKit: {} (daily)", kit.name),
        };

        let request = CheckoutSessionRequest {
            plan_type,
            unit_amount_cents: amount,
            product_name,
            client_reference_id: order_id.to_string(),
            success_url: format!(
                "{}/kits/{}?payment=success&session_id={{CHECKOUT_SESSION_ID}}",
                self.app_base_url, kit_id
            ),
            cancel_url: format!("{}/kits/{}?payment=cancelled", self.app_base_url, kit_id),
            metadata: checkout_metadata(order_id, kit_id, user_id, plan_type),
        };

        // Not retried: a retry after a lost response would open a second session
        let session = self.provider.create_checkout_session(request).await?;

        let new_order = NewOrder {
            id: order_id,
            user_id,
            kit_id,
            provider_session_id: session.session_id.clone(),
            plan_type,
            amount,
            currency: CURRENCY.to_string(),
        };

        if let Err(e) = self.orders.insert(new_order).await {
            tracing::error!(
                order_id = %order_id,
                kit_id = %kit_id,
                session_id = %session.session_id,
                error = %e,
                "Checkout session abandoned: pending order could not be recorded"
            );
            return Err(BillingError::Database(format!(
                "checkout could not be recorded, start a new checkout: {}",
                e
            )));
        }

        tracing::info!(
            order_id = %order_id,
            kit_id = %kit_id,
            user_id = ?user_id,
            plan_type = %plan_type,
            amount = amount,
            session_id = %session.session_id,
            "Checkout session created"
        );

        Ok(CheckoutResponse {
            session_id: session.session_id,
            url: session.url,
        })
    }
}
