//! Stripe client wrapper
//!
//! Built from an explicit [`StripeConfig`]. A missing variable is reported as
//! [`BillingError::NotConfigured`] at construction time instead of surfacing on
//! the first API call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    CancelSubscription, CheckoutSession, CheckoutSessionMode, Client, CreateCheckoutSession,
    CreateCheckoutSessionLineItems, CreateCheckoutSessionLineItemsPriceData,
    CreateCheckoutSessionLineItemsPriceDataProductData,
    CreateCheckoutSessionLineItemsPriceDataRecurring,
    CreateCheckoutSessionLineItemsPriceDataRecurringInterval,
    CreateCheckoutSessionSubscriptionData, Currency, Invoice, InvoiceId, InvoiceStatus,
    ListInvoices, Subscription, SubscriptionId, SubscriptionStatus,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};
use crate::pricing::PlanType;
use crate::provider::{CheckoutSessionRequest, PaymentProvider, ProviderSession};

/// Page size used when listing invoices
const INVOICE_PAGE_SIZE: u64 = 100;

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Public base URL of the web app, used for checkout redirect URLs
    pub app_base_url: String,
}

impl StripeConfig {
    /// Read `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET` and `APP_BASE_URL`
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = required_env("STRIPE_SECRET_KEY")?;
        let webhook_secret = required_env("STRIPE_WEBHOOK_SECRET")?;
        let app_base_url = required_env("APP_BASE_URL")?
            .trim_end_matches('/')
            .to_string();

        if !secret_key.starts_with("sk_") && !secret_key.starts_with("rk_") {
            return Err(BillingError::Config(
                "STRIPE_SECRET_KEY must be a secret (sk_) or restricted (rk_) key".to_string(),
            ));
        }

        Ok(Self {
            secret_key,
            webhook_secret,
            app_base_url,
        })
    }
}

fn required_env(key: &str) -> BillingResult<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(BillingError::NotConfigured(key.to_string())),
    }
}

/// Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// Backoff used for idempotent provider calls in the webhook path
fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(100)
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(3)
}

fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
    subscription_id.parse::<SubscriptionId>().map_err(|e| {
        BillingError::InvalidInput(format!(
            "invalid subscription id '{}': {}",
            subscription_id, e
        ))
    })
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<ProviderSession> {
        let recurring = match request.plan_type {
            PlanType::OneOff => None,
            PlanType::Subscription => Some(CreateCheckoutSessionLineItemsPriceDataRecurring {
                interval: CreateCheckoutSessionLineItemsPriceDataRecurringInterval::Day,
                interval_count: Some(1),
            }),
        };

        let line_items = vec![CreateCheckoutSessionLineItems {
            price_data: Some(CreateCheckoutSessionLineItemsPriceData {
                currency: Currency::USD,
                unit_amount: Some(request.unit_amount_cents),
                product_data: Some(CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: request.product_name.clone(),
                    ..Default::default()
                }),
                recurring,
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }];

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(match request.plan_type {
            PlanType::OneOff => CheckoutSessionMode::Payment,
            PlanType::Subscription => CheckoutSessionMode::Subscription,
        });
        params.line_items = Some(line_items);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&request.client_reference_id);
        params.metadata = Some(request.metadata.clone());
        if request.plan_type.is_recurring() {
            // Lets subscription events be traced back to the order before
            // checkout.session.completed has been processed
            params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(request.metadata.clone()),
                ..Default::default()
            });
        }

        let session = CheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| {
                tracing::error!(
                    plan_type = %request.plan_type,
                    client_reference_id = %request.client_reference_id,
                    error = %e,
                    "Stripe Checkout Session creation failed"
                );
                BillingError::StripeApi(e.to_string())
            })?;

        let url = session.url.ok_or_else(|| {
            BillingError::StripeApi("Checkout session returned without a URL".to_string())
        })?;

        Ok(ProviderSession {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn count_paid_invoices(&self, subscription_id: &str) -> BillingResult<u64> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let mut cursor: Option<InvoiceId> = None;
        let mut count: u64 = 0;

        loop {
            let page = Retry::spawn(retry_strategy(), || {
                let client = self.client.clone();
                let sub_id = sub_id.clone();
                let cursor = cursor.clone();
                async move {
                    let mut params = ListInvoices::new();
                    params.subscription = Some(sub_id);
                    params.status = Some(InvoiceStatus::Paid);
                    params.limit = Some(INVOICE_PAGE_SIZE);
                    params.starting_after = cursor;
                    Invoice::list(&client, &params).await
                }
            })
            .await
            .map_err(|e| {
                BillingError::StripeApi(format!(
                    "Failed to list paid invoices for subscription {}: {}",
                    subscription_id, e
                ))
            })?;

            count += page.data.len() as u64;

            match (page.has_more, page.data.last()) {
                (true, Some(last)) => cursor = Some(last.id.clone()),
                _ => break,
            }
        }

        Ok(count)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let current = Retry::spawn(retry_strategy(), || {
            let client = self.client.clone();
            let sub_id = sub_id.clone();
            async move { Subscription::retrieve(&client, &sub_id, &[]).await }
        })
        .await?;

        if current.status == SubscriptionStatus::Canceled {
            tracing::info!(
                subscription_id = %subscription_id,
                "Subscription already cancelled at Stripe, nothing to do"
            );
            return Ok(());
        }

        Retry::spawn(retry_strategy(), || {
            let client = self.client.clone();
            let sub_id = sub_id.clone();
            async move {
                Subscription::cancel(&client, &sub_id, CancelSubscription::default()).await
            }
        })
        .await?;

        tracing::info!(subscription_id = %subscription_id, "Subscription cancelled at Stripe");
        Ok(())
    }
}

/// Metadata keys written on sessions and subscriptions
pub mod metadata_keys {
    pub const ORDER_ID: &str = "order_id";
    pub const KIT_ID: &str = "kit_id";
    pub const USER_ID: &str = "user_id";
    pub const PLAN_TYPE: &str = "plan_type";
}

/// Build the metadata map for a checkout
pub fn checkout_metadata(
    order_id: uuid::Uuid,
    kit_id: uuid::Uuid,
    user_id: Option<uuid::Uuid>,
    plan_type: PlanType,
) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert(metadata_keys::ORDER_ID.to_string(), order_id.to_string());
    metadata.insert(metadata_keys::KIT_ID.to_string(), kit_id.to_string());
    metadata.insert(
        metadata_keys::PLAN_TYPE.to_string(),
        plan_type.as_str().to_string(),
    );
    if let Some(user_id) = user_id {
        metadata.insert(metadata_keys::USER_ID.to_string(), user_id.to_string());
    }
    metadata
}
