//! Storage seams
//!
//! Each table family sits behind an async trait so the services can run
//! against Postgres in production and against the in-memory store in tests.
//! Every method that changes state is a single atomic operation in the
//! backing store; services never compose read-then-write sequences for
//! balance or status changes.

use std::sync::Arc;

use async_trait::async_trait;
use ideakit_shared::PlanStatus;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    BalanceCheck, CreditTransaction, Kit, KitSpec, NewOrder, Order, SpendResult,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Events stuck in `processing` longer than this may be claimed again
pub const WEBHOOK_PROCESSING_TIMEOUT_MINUTES: i32 = 30;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Current balance; creates an empty account on first use
    async fn balance(&self, user_id: Uuid) -> BillingResult<i64>;

    /// Conditional debit: applied only when `balance >= amount`, together
    /// with its ledger entry
    async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        reference_id: Option<Uuid>,
    ) -> BillingResult<SpendResult>;

    /// Unconditional credit; returns the new balance
    async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        reference_id: Option<Uuid>,
    ) -> BillingResult<i64>;

    /// Newest first
    async fn transactions(&self, user_id: Uuid, limit: i64)
        -> BillingResult<Vec<CreditTransaction>>;

    async fn balance_check(&self, user_id: Uuid) -> BillingResult<BalanceCheck>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: NewOrder) -> BillingResult<Order>;

    async fn find_by_id(&self, order_id: Uuid) -> BillingResult<Option<Order>>;

    async fn find_by_session(&self, session_id: &str) -> BillingResult<Option<Order>>;

    async fn find_by_subscription(&self, subscription_id: &str) -> BillingResult<Option<Order>>;

    /// `pending -> completed`; `None` when the order was not pending
    async fn complete_pending(
        &self,
        order_id: Uuid,
        subscription_id: Option<&str>,
    ) -> BillingResult<Option<Order>>;

    /// `pending -> failed`; `None` when the order was not pending
    async fn fail_pending(&self, order_id: Uuid) -> BillingResult<Option<Order>>;

    /// Stamp `subscription_cancelled_at` (first stamp wins) and fill in the
    /// subscription id if the completion event has not recorded it yet
    async fn mark_subscription_cancelled(
        &self,
        order_id: Uuid,
        subscription_id: &str,
    ) -> BillingResult<Option<Order>>;
}

#[async_trait]
pub trait KitStore: Send + Sync {
    async fn create(
        &self,
        user_id: Option<Uuid>,
        spec: &KitSpec,
        has_access: bool,
    ) -> BillingResult<Kit>;

    async fn find(&self, kit_id: Uuid) -> BillingResult<Option<Kit>>;

    /// Set `has_access`; returns false when it was already set (or the kit is gone)
    async fn grant_access(&self, kit_id: Uuid) -> BillingResult<bool>;

    /// Returns false when there was nothing to delete
    async fn delete(&self, kit_id: Uuid) -> BillingResult<bool>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn set_plan_status(&self, user_id: Uuid, status: PlanStatus) -> BillingResult<()>;

    /// `Free` for users without a profile row
    async fn plan_status(&self, user_id: Uuid) -> BillingResult<PlanStatus>;
}

/// Result of trying to claim a webhook event id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// This caller owns processing of the event
    Claimed,
    /// A previous delivery was processed successfully
    AlreadyProcessed,
    /// Another delivery is being processed right now
    InProgress,
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Atomically claim an event id; failed or stuck ids can be claimed again
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<EventClaim>;

    /// Record the outcome; `error` is `None` on success
    async fn record_result(&self, event_id: &str, error: Option<&str>) -> BillingResult<()>;
}

/// The store set handed to the services
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub orders: Arc<dyn OrderStore>,
    pub kits: Arc<dyn KitStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub webhook_events: Arc<dyn WebhookEventStore>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            ledger: store.clone(),
            orders: store.clone(),
            kits: store.clone(),
            profiles: store.clone(),
            webhook_events: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_memory(Arc::new(MemoryStore::new()))
    }

    /// Share one in-memory store so tests can inspect it afterwards
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            ledger: store.clone(),
            orders: store.clone(),
            kits: store.clone(),
            profiles: store.clone(),
            webhook_events: store,
        }
    }
}
