//! Payment provider seam
//!
//! The engine talks to the payment processor only through this trait so the
//! webhook and checkout flows can be exercised without network access.
//! [`crate::client::StripeClient`] is the production implementation.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::pricing::PlanType;

/// Everything needed to open a provider-hosted checkout page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub plan_type: PlanType,
    /// Per-charge amount in cents (full price for one-off, daily price for subscription)
    pub unit_amount_cents: i64,
    pub product_name: String,
    pub client_reference_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Attached to the session, and to the subscription for recurring plans
    pub metadata: HashMap<String, String>,
}

/// A created checkout session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSession {
    pub session_id: String,
    pub url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a hosted checkout session
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<ProviderSession>;

    /// Count every paid invoice for a subscription
    ///
    /// The provider is the source of truth for payment count; this is never cached.
    async fn count_paid_invoices(&self, subscription_id: &str) -> BillingResult<u64>;

    /// Cancel a subscription immediately; cancelling an already-cancelled
    /// subscription succeeds without a second provider call
    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()>;
}
