// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! IdeaKit Billing Module
//!
//! Payment and credit reconciliation for kits.
//!
//! ## Features
//!
//! - **Credit Ledger**: Append-only ledger with a materialized, never-negative balance
//! - **Checkout**: Stripe Checkout sessions for one-off and daily-subscription plans
//! - **Webhooks**: Signature-verified, idempotent Stripe event processing, including
//!   the cap on paid subscription invoices
//! - **Kit Creation Saga**: Credit-funded kit creation with compensation
//! - **Invariants**: Read-only consistency checks for reconciliation

pub mod checkout;
pub mod client;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod models;
pub mod pricing;
pub mod provider;
pub mod saga;
pub mod store;
pub mod webhooks;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventKind, WebhookEvent};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::CreditLedgerService;

// Models
pub use models::{
    BalanceCheck, CreditTransaction, Kit, KitSpec, Order, OrderStatus, SpendResult,
};

// Pricing
pub use pricing::{PlanType, PricingConfig};

// Provider
pub use provider::{CheckoutSessionRequest, PaymentProvider, ProviderSession};

// Saga
pub use saga::{CreditShortfall, KitCreation, KitCreationSaga};

// Store
pub use store::Stores;

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
///
/// The ledger and the kit saga are always available. Checkout and webhooks
/// need a payment provider, and invariant checks need Postgres; their
/// accessors return [`BillingError::NotConfigured`] when those are missing.
pub struct BillingService {
    pub ledger: CreditLedgerService,
    pub kits: KitCreationSaga,
    stores: Stores,
    pricing: PricingConfig,
    checkout: Option<CheckoutService>,
    webhooks: Option<WebhookHandler>,
    invariants: Option<InvariantChecker>,
}

impl BillingService {
    /// Ledger and saga only
    pub fn new(stores: Stores, pricing: PricingConfig) -> Self {
        let ledger = CreditLedgerService::new(stores.ledger.clone());
        let kits = KitCreationSaga::new(ledger.clone(), stores.kits.clone(), pricing.kit_credit_cost);

        Self {
            ledger,
            kits,
            stores,
            pricing,
            checkout: None,
            webhooks: None,
            invariants: None,
        }
    }

    /// Enable checkout and webhook processing against `provider`
    pub fn with_payments(
        mut self,
        provider: Arc<dyn PaymentProvider>,
        webhook_secret: impl Into<String>,
        app_base_url: impl Into<String>,
    ) -> Self {
        self.checkout = Some(CheckoutService::new(
            self.stores.orders.clone(),
            self.stores.kits.clone(),
            provider.clone(),
            self.pricing.clone(),
            app_base_url,
        ));
        self.webhooks = Some(WebhookHandler::new(
            webhook_secret,
            provider,
            &self.stores,
            self.pricing.clone(),
        ));
        self
    }

    pub fn with_invariants(mut self, pool: PgPool) -> Self {
        self.invariants = Some(InvariantChecker::new(pool));
        self
    }

    /// Postgres-backed service with Stripe configured from the environment
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let pricing = PricingConfig::from_env()?;
        let stripe = StripeClient::from_env()?;
        let config = stripe.config().clone();

        Ok(Self::new(Stores::postgres(pool.clone()), pricing)
            .with_payments(Arc::new(stripe), config.webhook_secret, config.app_base_url)
            .with_invariants(pool))
    }

    pub fn checkout(&self) -> BillingResult<&CheckoutService> {
        self.checkout
            .as_ref()
            .ok_or_else(|| BillingError::NotConfigured("Stripe checkout".to_string()))
    }

    pub fn webhooks(&self) -> BillingResult<&WebhookHandler> {
        self.webhooks
            .as_ref()
            .ok_or_else(|| BillingError::NotConfigured("Stripe webhooks".to_string()))
    }

    pub fn invariants(&self) -> BillingResult<&InvariantChecker> {
        self.invariants
            .as_ref()
            .ok_or_else(|| BillingError::NotConfigured("Invariant checker".to_string()))
    }
}
