//! In-memory stores
//!
//! One mutex guards all tables, so every trait method is atomic with respect
//! to every other, like the single-statement Postgres implementations.
//! Foreign-key and uniqueness constraints from the migrations are mirrored
//! so tests hit the same failures production would.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use ideakit_shared::PlanStatus;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    EventClaim, KitStore, LedgerStore, OrderStore, ProfileStore, WebhookEventStore,
    WEBHOOK_PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BalanceCheck, CreditTransaction, Kit, KitSpec, NewOrder, Order, OrderStatus, SpendResult,
    WebhookEventRecord,
};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<Uuid, i64>,
    transactions: Vec<CreditTransaction>,
    orders: HashMap<Uuid, Order>,
    kits: HashMap<Uuid, Kit>,
    profiles: HashMap<Uuid, PlanStatus>,
    webhook_events: HashMap<String, WebhookEventRecord>,
}

impl MemoryState {
    fn append(
        &mut self,
        user_id: Uuid,
        delta: i64,
        balance_after: i64,
        reason: &str,
        reference_id: Option<Uuid>,
    ) {
        self.transactions.push(CreditTransaction {
            id: Uuid::new_v4(),
            user_id,
            delta,
            balance_after,
            reason: reason.to_string(),
            reference_id,
            created_at: OffsetDateTime::now_utc(),
        });
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every ledger entry across all users, oldest first
    pub async fn all_transactions(&self) -> Vec<CreditTransaction> {
        self.state.lock().await.transactions.clone()
    }

    /// Kits owned by `user_id`, locked or not
    pub async fn kit_count(&self, user_id: Uuid) -> usize {
        self.state
            .lock()
            .await
            .kits
            .values()
            .filter(|kit| kit.user_id == Some(user_id))
            .count()
    }

    pub async fn webhook_event(&self, event_id: &str) -> Option<WebhookEventRecord> {
        self.state.lock().await.webhook_events.get(event_id).cloned()
    }

    /// Backdate a webhook claim, for stuck-processing recovery tests
    pub async fn backdate_webhook_claim(&self, event_id: &str, by: Duration) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.webhook_events.get_mut(event_id) {
            record.processing_started_at = record.processing_started_at.map(|t| t - by);
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let mut state = self.state.lock().await;
        Ok(*state.accounts.entry(user_id).or_insert(0))
    }

    async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        reference_id: Option<Uuid>,
    ) -> BillingResult<SpendResult> {
        let mut state = self.state.lock().await;
        let balance = *state.accounts.entry(user_id).or_insert(0);

        if balance < amount {
            return Ok(SpendResult {
                success: false,
                new_balance: balance,
            });
        }

        let new_balance = balance - amount;
        state.accounts.insert(user_id, new_balance);
        state.append(user_id, -amount, new_balance, reason, reference_id);

        Ok(SpendResult {
            success: true,
            new_balance,
        })
    }

    async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        reference_id: Option<Uuid>,
    ) -> BillingResult<i64> {
        let mut state = self.state.lock().await;
        let balance = state.accounts.entry(user_id).or_insert(0);
        *balance += amount;
        let new_balance = *balance;
        state.append(user_id, amount, new_balance, reason, reference_id);
        Ok(new_balance)
    }

    async fn transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn balance_check(&self, user_id: Uuid) -> BillingResult<BalanceCheck> {
        let state = self.state.lock().await;
        Ok(BalanceCheck {
            user_id,
            materialized: state.accounts.get(&user_id).copied().unwrap_or(0),
            ledger_sum: state
                .transactions
                .iter()
                .filter(|t| t.user_id == user_id)
                .map(|t| t.delta)
                .sum(),
        })
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert(&self, order: NewOrder) -> BillingResult<Order> {
        let mut state = self.state.lock().await;

        if !state.kits.contains_key(&order.kit_id) {
            return Err(BillingError::Database(format!(
                "insert order {}: kit {} does not exist",
                order.id, order.kit_id
            )));
        }
        if state
            .orders
            .values()
            .any(|o| o.id == order.id || o.provider_session_id == order.provider_session_id)
        {
            return Err(BillingError::Database(format!(
                "insert order {}: duplicate key (session {})",
                order.id, order.provider_session_id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let stored = Order {
            id: order.id,
            user_id: order.user_id,
            kit_id: order.kit_id,
            provider_session_id: order.provider_session_id,
            plan_type: order.plan_type,
            amount: order.amount,
            currency: order.currency,
            status: OrderStatus::Pending,
            subscription_id: None,
            subscription_cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        state.orders.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }

    async fn find_by_session(&self, session_id: &str) -> BillingResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.provider_session_id == session_id)
            .cloned())
    }

    async fn find_by_subscription(&self, subscription_id: &str) -> BillingResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .filter(|o| o.subscription_id.as_deref() == Some(subscription_id))
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn complete_pending(
        &self,
        order_id: Uuid,
        subscription_id: Option<&str>,
    ) -> BillingResult<Option<Order>> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(&order_id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.status = OrderStatus::Completed;
                if let Some(sub) = subscription_id {
                    order.subscription_id = Some(sub.to_string());
                }
                order.updated_at = OffsetDateTime::now_utc();
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn fail_pending(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(&order_id) {
            Some(order) if order.status == OrderStatus::Pending => {
                order.status = OrderStatus::Failed;
                order.updated_at = OffsetDateTime::now_utc();
                Ok(Some(order.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_subscription_cancelled(
        &self,
        order_id: Uuid,
        subscription_id: &str,
    ) -> BillingResult<Option<Order>> {
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(None);
        };
        let now = OffsetDateTime::now_utc();
        order.subscription_cancelled_at.get_or_insert(now);
        order
            .subscription_id
            .get_or_insert_with(|| subscription_id.to_string());
        order.updated_at = now;
        Ok(Some(order.clone()))
    }
}

#[async_trait]
impl KitStore for MemoryStore {
    async fn create(
        &self,
        user_id: Option<Uuid>,
        spec: &KitSpec,
        has_access: bool,
    ) -> BillingResult<Kit> {
        let kit = Kit {
            id: Uuid::new_v4(),
            user_id,
            name: spec.name.clone(),
            content: spec.content.clone(),
            has_access,
            created_at: OffsetDateTime::now_utc(),
        };
        self.state.lock().await.kits.insert(kit.id, kit.clone());
        Ok(kit)
    }

    async fn find(&self, kit_id: Uuid) -> BillingResult<Option<Kit>> {
        Ok(self.state.lock().await.kits.get(&kit_id).cloned())
    }

    async fn grant_access(&self, kit_id: Uuid) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.kits.get_mut(&kit_id) {
            Some(kit) if !kit.has_access => {
                kit.has_access = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, kit_id: Uuid) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if state.orders.values().any(|o| o.kit_id == kit_id) {
            return Err(BillingError::Database(format!(
                "delete kit {}: still referenced by an order",
                kit_id
            )));
        }
        Ok(state.kits.remove(&kit_id).is_some())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn set_plan_status(&self, user_id: Uuid, status: PlanStatus) -> BillingResult<()> {
        self.state.lock().await.profiles.insert(user_id, status);
        Ok(())
    }

    async fn plan_status(&self, user_id: Uuid) -> BillingResult<PlanStatus> {
        Ok(self
            .state
            .lock()
            .await
            .profiles
            .get(&user_id)
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl WebhookEventStore for MemoryStore {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let stuck_before = now - Duration::minutes(i64::from(WEBHOOK_PROCESSING_TIMEOUT_MINUTES));

        let record = match state.webhook_events.entry(event_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(WebhookEventRecord {
                    id: Uuid::new_v4(),
                    stripe_event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    event_timestamp,
                    processing_result: "processing".to_string(),
                    processing_started_at: Some(now),
                    error_message: None,
                    created_at: now,
                });
                return Ok(EventClaim::Claimed);
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        let stuck = record.processing_result == "processing"
            && record
                .processing_started_at
                .is_some_and(|started| started < stuck_before);

        if record.processing_result == "error" || stuck {
            if stuck {
                record.error_message = Some(format!("Recovered from stuck state at {}", now));
            }
            record.processing_result = "processing".to_string();
            record.processing_started_at = Some(now);
            Ok(EventClaim::Claimed)
        } else if record.processing_result == "success" {
            Ok(EventClaim::AlreadyProcessed)
        } else {
            Ok(EventClaim::InProgress)
        }
    }

    async fn record_result(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.webhook_events.get_mut(event_id) {
            let result = if error.is_some() { "error" } else { "success" };
            record.processing_result = result.to_string();
            record.error_message = error.map(str::to_string);
        }
        Ok(())
    }
}
