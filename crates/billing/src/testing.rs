//! Test doubles for the payment provider
//!
//! Compiled for this crate's tests and, with the `test-support` feature, for
//! dependent crates' tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{BillingError, BillingResult};
use crate::provider::{CheckoutSessionRequest, PaymentProvider, ProviderSession};

/// Recording provider with scripted invoice counts
#[derive(Default)]
pub struct MockPaymentProvider {
    next_session: AtomicU64,
    sessions: Mutex<Vec<CheckoutSessionRequest>>,
    paid_invoices: Mutex<HashMap<String, u64>>,
    count_calls: Mutex<Vec<String>>,
    cancelled: Mutex<HashSet<String>>,
    cancel_calls: Mutex<Vec<String>>,
    fail_sessions: AtomicBool,
    fail_invoice_listing: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script how many paid invoices the provider reports for a subscription
    pub fn set_paid_invoices(&self, subscription_id: &str, count: u64) {
        lock(&self.paid_invoices).insert(subscription_id.to_string(), count);
    }

    pub fn fail_session_creation(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_invoice_listing(&self, fail: bool) {
        self.fail_invoice_listing.store(fail, Ordering::SeqCst);
    }

    pub fn created_sessions(&self) -> Vec<CheckoutSessionRequest> {
        lock(&self.sessions).clone()
    }

    /// Subscription ids passed to `count_paid_invoices`, in call order
    pub fn invoice_count_calls(&self) -> Vec<String> {
        lock(&self.count_calls).clone()
    }

    /// Subscription ids actually cancelled (a repeated cancel is not recorded)
    pub fn cancelled_subscriptions(&self) -> Vec<String> {
        lock(&self.cancel_calls).clone()
    }

    pub fn is_cancelled(&self, subscription_id: &str) -> bool {
        lock(&self.cancelled).contains(subscription_id)
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<ProviderSession> {
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(BillingError::StripeApi(
                "simulated provider outage".to_string(),
            ));
        }

        let n = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = format!("cs_test_mock_{}", n);
        lock(&self.sessions).push(request);

        Ok(ProviderSession {
            url: format!("https://checkout.stripe.com/c/pay/{}", session_id),
            session_id,
        })
    }

    async fn count_paid_invoices(&self, subscription_id: &str) -> BillingResult<u64> {
        lock(&self.count_calls).push(subscription_id.to_string());

        if self.fail_invoice_listing.load(Ordering::SeqCst) {
            return Err(BillingError::StripeApi(
                "simulated invoice listing failure".to_string(),
            ));
        }

        Ok(lock(&self.paid_invoices)
            .get(subscription_id)
            .copied()
            .unwrap_or(0))
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        if lock(&self.cancelled).insert(subscription_id.to_string()) {
            lock(&self.cancel_calls).push(subscription_id.to_string());
        }
        Ok(())
    }
}

/// Build a `Stripe-Signature` header for `payload` signed at `timestamp`
pub fn sign_webhook_payload(secret: &str, payload: &str, timestamp: i64) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return format!("t={}", timestamp),
    };
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    )
}
