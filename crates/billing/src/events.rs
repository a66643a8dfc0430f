//! Webhook event envelope
//!
//! Only the fields the processor acts on are decoded. Anything the processor
//! does not handle becomes [`EventKind::Unknown`] and is acknowledged.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED: &str =
    "checkout.session.async_payment_succeeded";
pub const CHECKOUT_SESSION_ASYNC_PAYMENT_FAILED: &str = "checkout.session.async_payment_failed";
pub const CHECKOUT_SESSION_EXPIRED: &str = "checkout.session.expired";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const CUSTOMER_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

/// A verified, decoded webhook event
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: OffsetDateTime,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Session finished; `payment_status` says whether money was captured
    CheckoutCompleted(CheckoutSessionObject),
    /// Delayed payment method settled after the session completed unpaid
    CheckoutAsyncPaymentSucceeded(CheckoutSessionObject),
    /// Session expired or its delayed payment failed
    CheckoutFailed(CheckoutSessionObject),
    InvoicePaymentSucceeded(InvoiceObject),
    InvoicePaymentFailed(InvoiceObject),
    SubscriptionDeleted(SubscriptionObject),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    /// `paid`, `unpaid` or `no_payment_required`
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    /// Sessions completed with a delayed payment method report `unpaid`
    /// until `checkout.session.async_payment_succeeded`
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() != Some("unpaid")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

impl WebhookEvent {
    /// Decode an event body that has already passed signature verification
    pub fn parse(payload: &str) -> BillingResult<Self> {
        let raw: RawEvent = serde_json::from_str(payload)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

        let created = OffsetDateTime::from_unix_timestamp(raw.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let object = raw.data.object;
        let kind = match raw.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => EventKind::CheckoutCompleted(decode(object)?),
            CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED => {
                EventKind::CheckoutAsyncPaymentSucceeded(decode(object)?)
            }
            CHECKOUT_SESSION_EXPIRED | CHECKOUT_SESSION_ASYNC_PAYMENT_FAILED => {
                EventKind::CheckoutFailed(decode(object)?)
            }
            INVOICE_PAYMENT_SUCCEEDED => EventKind::InvoicePaymentSucceeded(decode(object)?),
            INVOICE_PAYMENT_FAILED => EventKind::InvoicePaymentFailed(decode(object)?),
            CUSTOMER_SUBSCRIPTION_DELETED => EventKind::SubscriptionDeleted(decode(object)?),
            _ => EventKind::Unknown,
        };

        Ok(WebhookEvent {
            id: raw.id,
            event_type: raw.event_type,
            created,
            kind,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(object: serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(object).map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))
}

/// Accept either a bare id or an expanded object carrying an `id`
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expandable {
        Id(String),
        Object { id: String },
    }

    Ok(Option::<Expandable>::deserialize(deserializer)?.map(|e| match e {
        Expandable::Id(id) | Expandable::Object { id } => id,
    }))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
