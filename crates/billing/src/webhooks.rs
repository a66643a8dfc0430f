//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header, claims the event id so each event
//! is applied once, and dispatches to the handler for the event type. Every
//! handler is also idempotent on its own natural key (session id,
//! subscription id), so a redelivery that slips past the claim is harmless.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use ideakit_shared::PlanStatus;
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::metadata_keys;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutSessionObject, EventKind, InvoiceObject, SubscriptionObject, WebhookEvent,
};
use crate::models::{Order, OrderStatus};
use crate::pricing::{PlanType, PricingConfig};
use crate::provider::PaymentProvider;
use crate::store::{
    EventClaim, KitStore, OrderStore, ProfileStore, Stores, WebhookEventStore,
};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (either direction) of a signed webhook timestamp
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// What processing an event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// State changed
    Applied,
    /// Recognized event with nothing to change
    NoOp(&'static str),
    /// Event type not handled
    Ignored,
    /// Event id already processed or being processed
    Duplicate,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    webhook_secret: String,
    provider: Arc<dyn PaymentProvider>,
    orders: Arc<dyn OrderStore>,
    kits: Arc<dyn KitStore>,
    profiles: Arc<dyn ProfileStore>,
    events: Arc<dyn WebhookEventStore>,
    pricing: PricingConfig,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: impl Into<String>,
        provider: Arc<dyn PaymentProvider>,
        stores: &Stores,
        pricing: PricingConfig,
    ) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            provider,
            orders: stores.orders.clone(),
            kits: stores.kits.clone(),
            profiles: stores.profiles.clone(),
            events: stores.webhook_events.clone(),
            pricing,
        }
    }

    /// Verify and parse a Stripe webhook event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// [`Self::verify_event`] against an explicit clock
    pub fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        verify_signature(&self.webhook_secret, payload, signature, now)?;

        WebhookEvent::parse(payload).map_err(|e| {
            tracing::error!(error = %e, "Signed webhook payload could not be decoded");
            e
        })
    }

    /// Handle a verified event
    ///
    /// Claims the event id first; a duplicate delivery is acknowledged without
    /// running handlers. The outcome is recorded on the event record either way.
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let claim = self
            .events
            .claim(&event.id, &event.event_type, event.created)
            .await?;

        if claim != EventClaim::Claimed {
            let reason = match claim {
                EventClaim::AlreadyProcessed => "already processed successfully",
                _ => "currently being processed by another worker",
            };
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                reason = %reason,
                "Duplicate webhook event"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(event).await;

        let error_message = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self
            .events
            .record_result(&event.id, error_message.as_deref())
            .await
        {
            tracing::warn!(
                event_id = %event.id,
                error = %e,
                "First attempt to update webhook event failed, retrying"
            );
            if let Err(retry_err) = self
                .events
                .record_result(&event.id, error_message.as_deref())
                .await
            {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error_message = ?error_message,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to record webhook outcome; event stays in 'processing' until the claim times out"
                );
            }
        }

        match &result {
            Ok(outcome) => tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                outcome = ?outcome,
                "Webhook event processed"
            ),
            Err(e) => tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook event processing failed"
            ),
        }

        result
    }

    /// Dispatch without the event-id claim
    pub async fn process_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match &event.kind {
            EventKind::CheckoutCompleted(session) => {
                if !session.is_paid() {
                    tracing::info!(
                        session_id = %session.id,
                        "Checkout completed with payment still outstanding; waiting for async payment"
                    );
                    return Ok(WebhookOutcome::NoOp("payment not yet captured"));
                }
                self.handle_checkout_completed(session).await
            }
            EventKind::CheckoutAsyncPaymentSucceeded(session) => {
                self.handle_checkout_completed(session).await
            }
            EventKind::CheckoutFailed(session) => self.handle_checkout_failed(session).await,
            EventKind::InvoicePaymentSucceeded(invoice) => {
                self.handle_invoice_payment_succeeded(invoice).await
            }
            EventKind::InvoicePaymentFailed(invoice) => {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    subscription_id = ?invoice.subscription,
                    "Invoice payment failed; the provider retries collection"
                );
                Ok(WebhookOutcome::NoOp("invoice payment failure logged"))
            }
            EventKind::SubscriptionDeleted(subscription) => {
                self.handle_subscription_deleted(subscription).await
            }
            EventKind::Unknown => {
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn handle_checkout_completed(
        &self,
        session: &CheckoutSessionObject,
    ) -> BillingResult<WebhookOutcome> {
        let Some(order) = self.orders.find_by_session(&session.id).await? else {
            tracing::warn!(
                session_id = %session.id,
                "Checkout completed for unknown session - no order recorded"
            );
            return Ok(WebhookOutcome::NoOp("no order for session"));
        };

        match order.status {
            OrderStatus::Pending => {
                let completed = self
                    .orders
                    .complete_pending(order.id, session.subscription.as_deref())
                    .await?;

                match completed {
                    Some(completed) => {
                        self.grant_entitlement(&completed).await?;
                        self.apply_plan_status(&completed).await?;
                        tracing::info!(
                            order_id = %completed.id,
                            kit_id = %completed.kit_id,
                            user_id = ?completed.user_id,
                            session_id = %session.id,
                            subscription_id = ?completed.subscription_id,
                            "Order completed and access granted"
                        );
                        Ok(WebhookOutcome::Applied)
                    }
                    None => {
                        // Another delivery moved the order first
                        let current = self.orders.find_by_id(order.id).await?.unwrap_or(order);
                        self.grant_entitlement(&current).await?;
                        self.apply_plan_status(&current).await?;
                        Ok(WebhookOutcome::NoOp("order completed concurrently"))
                    }
                }
            }
            OrderStatus::Completed => {
                // Heals a failure between completing the order and granting
                // access or updating the profile
                self.grant_entitlement(&order).await?;
                self.apply_plan_status(&order).await?;
                tracing::info!(
                    order_id = %order.id,
                    session_id = %session.id,
                    "Checkout already completed - no-op"
                );
                Ok(WebhookOutcome::NoOp("order already completed"))
            }
            OrderStatus::Failed => {
                tracing::warn!(
                    order_id = %order.id,
                    session_id = %session.id,
                    "Checkout completion received for a failed order - ignoring"
                );
                Ok(WebhookOutcome::NoOp("order already failed"))
            }
        }
    }

    async fn grant_entitlement(&self, order: &Order) -> BillingResult<()> {
        let granted = self.kits.grant_access(order.kit_id).await.map_err(|e| {
            tracing::error!(
                order_id = %order.id,
                kit_id = %order.kit_id,
                error = %e,
                "RECONCILIATION NEEDED: order completed but kit access could not be granted"
            );
            e
        })?;

        if granted && order.status == OrderStatus::Completed {
            tracing::warn!(
                order_id = %order.id,
                kit_id = %order.kit_id,
                "Kit access was missing for a completed order - granted on redelivery"
            );
        }
        Ok(())
    }

    async fn apply_plan_status(&self, order: &Order) -> BillingResult<()> {
        let Some(user_id) = order.user_id else {
            tracing::debug!(order_id = %order.id, "Guest order - no profile to update");
            return Ok(());
        };

        let status = match order.plan_type {
            PlanType::OneOff => PlanStatus::Paid,
            PlanType::Subscription if order.subscription_cancelled_at.is_some() => {
                tracing::info!(
                    order_id = %order.id,
                    user_id = %user_id,
                    "Subscription was cancelled before checkout completion - profile left unchanged"
                );
                return Ok(());
            }
            PlanType::Subscription => PlanStatus::Subscriber,
        };

        self.profiles.set_plan_status(user_id, status).await
    }

    async fn handle_checkout_failed(
        &self,
        session: &CheckoutSessionObject,
    ) -> BillingResult<WebhookOutcome> {
        let Some(order) = self.orders.find_by_session(&session.id).await? else {
            return Ok(WebhookOutcome::NoOp("no order for session"));
        };

        match self.orders.fail_pending(order.id).await? {
            Some(failed) => {
                tracing::info!(
                    order_id = %failed.id,
                    session_id = %session.id,
                    "Checkout expired or payment failed - order marked failed"
                );
                Ok(WebhookOutcome::Applied)
            }
            None => Ok(WebhookOutcome::NoOp("order not pending")),
        }
    }

    /// Cancel the subscription once the cap of paid invoices is reached
    ///
    /// The count comes from the provider on every event. The order does not
    /// need to exist locally: renewals can arrive before the checkout
    /// completion event.
    async fn handle_invoice_payment_succeeded(
        &self,
        invoice: &InvoiceObject,
    ) -> BillingResult<WebhookOutcome> {
        let Some(subscription_id) = invoice.subscription.as_deref() else {
            return Ok(WebhookOutcome::NoOp("invoice has no subscription"));
        };

        let paid = self
            .provider
            .count_paid_invoices(subscription_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    subscription_id = %subscription_id,
                    invoice_id = %invoice.id,
                    error = %e,
                    "Failed to count paid invoices"
                );
                e
            })?;

        let cap = self.pricing.subscription_cycle_cap;
        if !self.pricing.subscription_cap_reached(paid) {
            tracing::info!(
                subscription_id = %subscription_id,
                paid_invoices = paid,
                cap = cap,
                "Subscription payment recorded, below cap"
            );
            return Ok(WebhookOutcome::NoOp("subscription below payment cap"));
        }

        tracing::info!(
            subscription_id = %subscription_id,
            paid_invoices = paid,
            cap = cap,
            "Subscription reached payment cap - cancelling"
        );
        self.provider
            .cancel_subscription(subscription_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    subscription_id = %subscription_id,
                    paid_invoices = paid,
                    error = %e,
                    "Failed to cancel capped subscription"
                );
                e
            })?;

        Ok(WebhookOutcome::Applied)
    }

    /// Entitlements are kept; only the profile plan status is reset
    async fn handle_subscription_deleted(
        &self,
        subscription: &SubscriptionObject,
    ) -> BillingResult<WebhookOutcome> {
        let order = match self.orders.find_by_subscription(&subscription.id).await? {
            Some(order) => Some(order),
            None => match order_id_from_metadata(subscription) {
                Some(order_id) => self.orders.find_by_id(order_id).await?,
                None => None,
            },
        };

        let Some(order) = order else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Subscription deleted but no matching order found"
            );
            return Ok(WebhookOutcome::NoOp("no order for subscription"));
        };

        self.orders
            .mark_subscription_cancelled(order.id, &subscription.id)
            .await?;

        match order.user_id {
            Some(user_id) => {
                self.profiles
                    .set_plan_status(user_id, PlanStatus::Free)
                    .await?;
                tracing::info!(
                    order_id = %order.id,
                    user_id = %user_id,
                    subscription_id = %subscription.id,
                    "Subscription cancelled - profile reset to free, kit access kept"
                );
            }
            None => {
                tracing::info!(
                    order_id = %order.id,
                    subscription_id = %subscription.id,
                    "Subscription cancelled for a guest order - no profile to reset"
                );
            }
        }

        Ok(WebhookOutcome::Applied)
    }
}

fn order_id_from_metadata(subscription: &SubscriptionObject) -> Option<Uuid> {
    subscription
        .metadata
        .get(metadata_keys::ORDER_ID)
        .and_then(|raw| raw.parse().ok())
}

/// Check a `Stripe-Signature` header (`t=...,v1=...[,v1=...]`) against the payload
///
/// Any `v1` entry may match; the HMAC key is the endpoint secret as issued
/// (including its `whsec_` prefix).
pub fn verify_signature(
    webhook_secret: &str,
    payload: &str,
    header: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Webhook signature header has no timestamp");
        BillingError::WebhookSignatureInvalid
    })?;

    if candidates.is_empty() {
        tracing::warn!("Webhook signature header has no v1 signature");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if now.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());

    // verify_slice compares in constant time
    if candidates
        .iter()
        .any(|candidate| mac.clone().verify_slice(candidate).is_ok())
    {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}
