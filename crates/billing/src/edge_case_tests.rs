// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests critical boundary conditions and race conditions in:
//! - Credit ledger (BILL-L01 to BILL-L04)
//! - Kit creation saga (BILL-K01 to BILL-K05)
//! - Webhooks (BILL-W01 to BILL-W13)
//! - Checkout (BILL-C01)

#[cfg(test)]
mod support {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use ideakit_shared::PlanStatus;
    use uuid::Uuid;

    use crate::error::{BillingError, BillingResult};
    use crate::events::WebhookEvent;
    use crate::models::{
        BalanceCheck, CreditTransaction, Kit, KitSpec, NewOrder, Order, SpendResult,
    };
    use crate::pricing::PricingConfig;
    use crate::store::{KitStore, LedgerStore, MemoryStore, OrderStore, ProfileStore, Stores};
    use crate::testing::MockPaymentProvider;
    use crate::BillingService;

    pub const SECRET: &str = "whsec_edge_case_secret";

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub provider: Arc<MockPaymentProvider>,
        pub billing: BillingService,
    }

    pub fn harness() -> Harness {
        harness_with(|_, stores| stores)
    }

    /// Harness whose store set can be rewired before the service is built
    pub fn harness_with(wire: impl FnOnce(Arc<MemoryStore>, Stores) -> Stores) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockPaymentProvider::new());
        let stores = wire(store.clone(), Stores::from_memory(store.clone()));
        let billing = BillingService::new(stores, PricingConfig::default())
            .with_payments(provider.clone(), SECRET, "https://app.ideakit.io");
        Harness {
            store,
            provider,
            billing,
        }
    }

    pub fn event(id: &str, event_type: &str, object: serde_json::Value) -> WebhookEvent {
        let payload = serde_json::json!({
            "id": id,
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object }
        });
        WebhookEvent::parse(&payload.to_string()).unwrap()
    }

    pub fn kit_spec(name: &str) -> KitSpec {
        KitSpec {
            name: name.to_string(),
            content: serde_json::json!({ "pitch": "test" }),
        }
    }

    /// Ledger whose balance is drained by a "concurrent" spend right before
    /// the first debit goes through
    pub struct DrainingLedger {
        pub inner: Arc<MemoryStore>,
        drained: AtomicBool,
    }

    impl DrainingLedger {
        pub fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                drained: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl LedgerStore for DrainingLedger {
        async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
            self.inner.balance(user_id).await
        }

        async fn debit(
            &self,
            user_id: Uuid,
            amount: i64,
            reason: &str,
            reference_id: Option<Uuid>,
        ) -> BillingResult<SpendResult> {
            if !self.drained.swap(true, Ordering::SeqCst) {
                let balance = self.inner.balance(user_id).await?;
                if balance > 0 {
                    self.inner
                        .debit(user_id, balance, "concurrent spend", None)
                        .await?;
                }
            }
            self.inner.debit(user_id, amount, reason, reference_id).await
        }

        async fn credit(
            &self,
            user_id: Uuid,
            amount: i64,
            reason: &str,
            reference_id: Option<Uuid>,
        ) -> BillingResult<i64> {
            self.inner.credit(user_id, amount, reason, reference_id).await
        }

        async fn transactions(
            &self,
            user_id: Uuid,
            limit: i64,
        ) -> BillingResult<Vec<CreditTransaction>> {
            self.inner.transactions(user_id, limit).await
        }

        async fn balance_check(&self, user_id: Uuid) -> BillingResult<BalanceCheck> {
            self.inner.balance_check(user_id).await
        }
    }

    /// Ledger whose debits fail with a storage error
    pub struct BrokenDebitLedger(pub Arc<MemoryStore>);

    #[async_trait]
    impl LedgerStore for BrokenDebitLedger {
        async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
            self.0.balance(user_id).await
        }

        async fn debit(
            &self,
            _user_id: Uuid,
            _amount: i64,
            _reason: &str,
            _reference_id: Option<Uuid>,
        ) -> BillingResult<SpendResult> {
            Err(BillingError::Database("connection reset".to_string()))
        }

        async fn credit(
            &self,
            user_id: Uuid,
            amount: i64,
            reason: &str,
            reference_id: Option<Uuid>,
        ) -> BillingResult<i64> {
            self.0.credit(user_id, amount, reason, reference_id).await
        }

        async fn transactions(
            &self,
            user_id: Uuid,
            limit: i64,
        ) -> BillingResult<Vec<CreditTransaction>> {
            self.0.transactions(user_id, limit).await
        }

        async fn balance_check(&self, user_id: Uuid) -> BillingResult<BalanceCheck> {
            self.0.balance_check(user_id).await
        }
    }

    /// Kit store whose deletes fail
    pub struct UndeletableKits(pub Arc<MemoryStore>);

    #[async_trait]
    impl KitStore for UndeletableKits {
        async fn create(
            &self,
            user_id: Option<Uuid>,
            spec: &KitSpec,
            has_access: bool,
        ) -> BillingResult<Kit> {
            self.0.create(user_id, spec, has_access).await
        }

        async fn find(&self, kit_id: Uuid) -> BillingResult<Option<Kit>> {
            self.0.find(kit_id).await
        }

        async fn grant_access(&self, kit_id: Uuid) -> BillingResult<bool> {
            self.0.grant_access(kit_id).await
        }

        async fn delete(&self, _kit_id: Uuid) -> BillingResult<bool> {
            Err(BillingError::Database("statement timeout".to_string()))
        }
    }

    /// Profile store whose first plan status write fails
    pub struct FlakyProfiles {
        inner: Arc<MemoryStore>,
        failed: AtomicBool,
    }

    impl FlakyProfiles {
        pub fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                failed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ProfileStore for FlakyProfiles {
        async fn set_plan_status(&self, user_id: Uuid, status: PlanStatus) -> BillingResult<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(BillingError::Database("timeout".to_string()));
            }
            self.inner.set_plan_status(user_id, status).await
        }

        async fn plan_status(&self, user_id: Uuid) -> BillingResult<PlanStatus> {
            self.inner.plan_status(user_id).await
        }
    }

    /// Order store that rejects every insert
    pub struct UnwritableOrders(pub Arc<MemoryStore>);

    #[async_trait]
    impl OrderStore for UnwritableOrders {
        async fn insert(&self, _order: NewOrder) -> BillingResult<Order> {
            Err(BillingError::Database("connection refused".to_string()))
        }

        async fn find_by_id(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
            self.0.find_by_id(order_id).await
        }

        async fn find_by_session(&self, session_id: &str) -> BillingResult<Option<Order>> {
            self.0.find_by_session(session_id).await
        }

        async fn find_by_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<Option<Order>> {
            self.0.find_by_subscription(subscription_id).await
        }

        async fn complete_pending(
            &self,
            order_id: Uuid,
            subscription_id: Option<&str>,
        ) -> BillingResult<Option<Order>> {
            self.0.complete_pending(order_id, subscription_id).await
        }

        async fn fail_pending(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
            self.0.fail_pending(order_id).await
        }

        async fn mark_subscription_cancelled(
            &self,
            order_id: Uuid,
            subscription_id: &str,
        ) -> BillingResult<Option<Order>> {
            self.0
                .mark_subscription_cancelled(order_id, subscription_id)
                .await
        }
    }
}

#[cfg(test)]
mod ledger_tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;
    use uuid::Uuid;

    use crate::ledger::CreditLedgerService;
    use crate::store::{LedgerStore, MemoryStore};

    // =========================================================================
    // BILL-L01: N concurrent spends - exactly floor(balance / amount) succeed
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_spends_never_overdraw() {
        let store = Arc::new(MemoryStore::new());
        let ledger = CreditLedgerService::new(store.clone());
        let user = Uuid::new_v4();
        ledger.earn(user, 1000, "grant").await.unwrap();

        let tasks = 50;
        let amount = 30;
        let barrier = Arc::new(Barrier::new(tasks));
        let mut handles = vec![];

        for _ in 0..tasks {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger.spend(user, amount, "parallel", None).await.unwrap()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(result.new_balance >= 0, "Balance must never go negative");
            if result.success {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 1000 / amount, "Exactly floor(1000/30) spends fit");
        assert_eq!(ledger.get_balance(user).await.unwrap(), 1000 % amount);
        assert!(ledger.reconcile(user).await.unwrap().is_consistent());
    }

    // =========================================================================
    // BILL-L02: Balance equals sum of ledger deltas after mixed activity
    // =========================================================================
    #[tokio::test]
    async fn test_ledger_conservation() {
        let store = Arc::new(MemoryStore::new());
        let ledger = CreditLedgerService::new(store.clone());
        let user = Uuid::new_v4();

        ledger.earn(user, 400, "grant").await.unwrap();
        ledger.spend(user, 150, "kit", None).await.unwrap();
        ledger.spend(user, 500, "too much", None).await.unwrap();
        ledger.earn(user, 25, "refund").await.unwrap();

        let sum: i64 = store
            .transactions(user, 100)
            .await
            .unwrap()
            .iter()
            .map(|t| t.delta)
            .sum();
        assert_eq!(sum, 275);
        assert_eq!(ledger.get_balance(user).await.unwrap(), 275);
    }

    // =========================================================================
    // BILL-L03: Spending the exact balance leaves zero, one more credit fails
    // =========================================================================
    #[tokio::test]
    async fn test_exact_balance_spend() {
        let ledger = CreditLedgerService::new(Arc::new(MemoryStore::new()));
        let user = Uuid::new_v4();
        ledger.earn(user, 750, "grant").await.unwrap();

        let exact = ledger.spend(user, 750, "kit", None).await.unwrap();
        assert!(exact.success);
        assert_eq!(exact.new_balance, 0);

        let over = ledger.spend(user, 1, "kit", None).await.unwrap();
        assert!(!over.success);
        assert_eq!(over.new_balance, 0);
    }

    // =========================================================================
    // BILL-L04: Users do not see each other's balances or history
    // =========================================================================
    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let ledger = CreditLedgerService::new(Arc::new(MemoryStore::new()));
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.earn(alice, 100, "grant").await.unwrap();

        assert_eq!(ledger.get_balance(bob).await.unwrap(), 0);
        assert!(ledger.history(bob, None).await.unwrap().is_empty());
        assert!(!ledger.spend(bob, 1, "kit", None).await.unwrap().success);
    }
}

#[cfg(test)]
mod saga_tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;
    use uuid::Uuid;

    use super::support::*;
    use crate::error::BillingError;
    use crate::ledger::CreditLedgerService;
    use crate::saga::{CreditShortfall, KitCreation, KitCreationSaga};
    use crate::store::{KitStore, LedgerStore, MemoryStore};

    // =========================================================================
    // BILL-K01: 1000 credits, kit costs 750 -> kit created, 250 left; second
    //           attempt fails with required 750 / current 250 / needed 500
    // =========================================================================
    #[tokio::test]
    async fn test_two_kits_with_budget_for_one() {
        let h = harness();
        let user = Uuid::new_v4();
        h.billing.ledger.earn(user, 1000, "purchase").await.unwrap();

        let first = h.billing.kits.create_kit(user, kit_spec("First")).await.unwrap();
        match first {
            KitCreation::Created { new_balance, .. } => assert_eq!(new_balance, 250),
            other => panic!("expected creation, got {:?}", other),
        }

        let second = h.billing.kits.create_kit(user, kit_spec("Second")).await.unwrap();
        assert_eq!(
            second,
            KitCreation::InsufficientCredits(CreditShortfall {
                required: 750,
                current: 250,
                needed: 500
            })
        );
        assert_eq!(h.billing.ledger.get_balance(user).await.unwrap(), 250);
    }

    // =========================================================================
    // BILL-K02: Balance drained between check and spend - kit rolled back
    // =========================================================================
    #[tokio::test]
    async fn test_drained_balance_rolls_back_kit() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store.credit(user, 1000, "grant", None).await.unwrap();

        let ledger = CreditLedgerService::new(Arc::new(DrainingLedger::new(store.clone())));
        let saga = KitCreationSaga::new(ledger, store.clone(), 750);

        let outcome = saga.create_kit(user, kit_spec("Race")).await.unwrap();
        assert_eq!(
            outcome,
            KitCreation::InsufficientCredits(CreditShortfall::new(750, 0))
        );

        // Only the grant and the concurrent drain are in the ledger
        let entries = store.all_transactions().await;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|t| t.reference_id.is_none()));
        assert_eq!(store.kit_count(user).await, 0, "Rolled back kit must be deleted");
    }

    // =========================================================================
    // BILL-K03: Spend fails with a storage error - kit removed, error surfaced
    // =========================================================================
    #[tokio::test]
    async fn test_spend_error_rolls_back_kit() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store.credit(user, 1000, "grant", None).await.unwrap();

        let ledger = CreditLedgerService::new(Arc::new(BrokenDebitLedger(store.clone())));
        let saga = KitCreationSaga::new(ledger, store.clone(), 750);

        let result = saga.create_kit(user, kit_spec("Broken")).await;
        assert!(matches!(result, Err(BillingError::Database(_))));
        assert_eq!(store.balance(user).await.unwrap(), 1000);
        assert_eq!(store.kit_count(user).await, 0, "Rolled back kit must be deleted");
    }

    // =========================================================================
    // BILL-K04: Rollback itself fails - dedicated error, never success
    // =========================================================================
    #[tokio::test]
    async fn test_failed_compensation_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store.credit(user, 1000, "grant", None).await.unwrap();

        let ledger = CreditLedgerService::new(Arc::new(DrainingLedger::new(store.clone())));
        let saga = KitCreationSaga::new(ledger, Arc::new(UndeletableKits(store.clone())), 750);

        let result = saga.create_kit(user, kit_spec("Stuck")).await;
        assert!(matches!(result, Err(BillingError::CompensationFailed(_))));
        // The orphan stays behind for reconciliation
        assert_eq!(store.kit_count(user).await, 1);
    }

    // =========================================================================
    // BILL-K05: After a rollback the user can top up and create the kit; the
    //           only saga debit references a kit that exists
    // =========================================================================
    #[tokio::test]
    async fn test_retry_after_rollback() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store.credit(user, 800, "grant", None).await.unwrap();

        let draining = Arc::new(DrainingLedger::new(store.clone()));
        let saga = KitCreationSaga::new(CreditLedgerService::new(draining), store.clone(), 750);
        let first = saga.create_kit(user, kit_spec("Retry")).await.unwrap();
        assert!(matches!(first, KitCreation::InsufficientCredits(_)));

        store.credit(user, 750, "top up", None).await.unwrap();
        let second = saga.create_kit(user, kit_spec("Retry")).await.unwrap();
        let KitCreation::Created { kit, new_balance, .. } = second else {
            panic!("expected kit to be created after top up");
        };
        assert_eq!(new_balance, 0);

        let refs: Vec<Uuid> = store
            .all_transactions()
            .await
            .iter()
            .filter_map(|t| t.reference_id)
            .collect();
        assert_eq!(refs, vec![kit.id]);
        assert!(store.find(kit.id).await.unwrap().is_some());
    }

    // =========================================================================
    // BILL-K06: Two concurrent creations with budget for one - one kit, the
    //           other caller sees the shortfall against the remaining 250
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_kit_creations_budget_for_one() {
        let h = harness();
        let user = Uuid::new_v4();
        h.billing.ledger.earn(user, 1000, "purchase").await.unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for name in ["Left", "Right"] {
            let saga = h.billing.kits.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                saga.create_kit(user, kit_spec(name)).await.unwrap()
            }));
        }

        let mut created = 0;
        let mut shortfalls = vec![];
        for handle in handles {
            match handle.await.unwrap() {
                KitCreation::Created { .. } => created += 1,
                KitCreation::InsufficientCredits(shortfall) => shortfalls.push(shortfall),
            }
        }

        assert_eq!(created, 1);
        assert_eq!(
            shortfalls,
            vec![CreditShortfall {
                required: 750,
                current: 250,
                needed: 500
            }]
        );
        assert_eq!(h.store.kit_count(user).await, 1);
        assert_eq!(h.billing.ledger.get_balance(user).await.unwrap(), 250);
    }
}

#[cfg(test)]
mod webhook_tests {
    use std::sync::Arc;

    use ideakit_shared::PlanStatus;
    use serde_json::json;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use super::support::*;
    use crate::error::BillingError;
    use crate::models::OrderStatus;
    use crate::store::{KitStore, OrderStore, ProfileStore, Stores};
    use crate::webhooks::WebhookOutcome;

    async fn checkout(h: &Harness, user: Option<Uuid>, plan: &str) -> (Uuid, String) {
        let kit = h.store.create(user, &kit_spec("Checkout Kit"), false).await.unwrap();
        let response = h
            .billing
            .checkout()
            .unwrap()
            .create_checkout(kit.id, plan, user)
            .await
            .unwrap();
        (kit.id, response.session_id)
    }

    fn completed(event_id: &str, session_id: &str, subscription: Option<&str>) -> crate::WebhookEvent {
        event(
            event_id,
            "checkout.session.completed",
            json!({
                "id": session_id,
                "subscription": subscription,
                "payment_status": "paid",
                "metadata": {}
            }),
        )
    }

    fn invoice_paid(event_id: &str, subscription: &str) -> crate::WebhookEvent {
        event(
            event_id,
            "invoice.payment_succeeded",
            json!({ "id": format!("in_{}", event_id), "subscription": subscription }),
        )
    }

    // =========================================================================
    // BILL-W01: One-off completion - order completed, kit unlocked, profile paid
    // =========================================================================
    #[tokio::test]
    async fn test_oneoff_completion_grants_access() {
        let h = harness();
        let user = Uuid::new_v4();
        let (kit_id, session_id) = checkout(&h, Some(user), "oneoff").await;
        let handler = h.billing.webhooks().unwrap();

        let outcome = handler
            .handle_event(&completed("evt_w01", &session_id, None))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Applied);
        let order = h.store.find_by_session(&session_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert!(h.store.find(kit_id).await.unwrap().unwrap().has_access);
        assert_eq!(h.store.plan_status(user).await.unwrap(), PlanStatus::Paid);
    }

    // =========================================================================
    // BILL-W02: Same event delivered twice - second is a duplicate, no ledger
    //           entries are ever written by checkout completion
    // =========================================================================
    #[tokio::test]
    async fn test_replayed_completion_is_idempotent() {
        let h = harness();
        let user = Uuid::new_v4();
        let (_, session_id) = checkout(&h, Some(user), "oneoff").await;
        let handler = h.billing.webhooks().unwrap();
        let event = completed("evt_w02", &session_id, None);

        assert_eq!(handler.handle_event(&event).await.unwrap(), WebhookOutcome::Applied);
        assert_eq!(handler.handle_event(&event).await.unwrap(), WebhookOutcome::Duplicate);

        // A redelivery under a new event id reaches the handler but is a no-op
        let redelivered = completed("evt_w02_b", &session_id, None);
        assert_eq!(
            handler.handle_event(&redelivered).await.unwrap(),
            WebhookOutcome::NoOp("order already completed")
        );
        assert!(h.store.all_transactions().await.is_empty());
    }

    // =========================================================================
    // BILL-W03: Crash between completing the order and granting access heals
    //           on redelivery
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_regrants_missing_access() {
        let h = harness();
        let (kit_id, session_id) = checkout(&h, None, "oneoff").await;
        let order = h.store.find_by_session(&session_id).await.unwrap().unwrap();

        // Order completed but the grant never happened
        h.store.complete_pending(order.id, None).await.unwrap();
        assert!(!h.store.find(kit_id).await.unwrap().unwrap().has_access);

        h.billing
            .webhooks()
            .unwrap()
            .handle_event(&completed("evt_w03", &session_id, None))
            .await
            .unwrap();
        assert!(h.store.find(kit_id).await.unwrap().unwrap().has_access);
    }

    // =========================================================================
    // BILL-W04: Order status is monotonic - failed stays failed, completed
    //           stays completed
    // =========================================================================
    #[tokio::test]
    async fn test_order_status_is_terminal() {
        let h = harness();
        let handler = h.billing.webhooks().unwrap();

        let (kit_a, expired_session) = checkout(&h, None, "oneoff").await;
        let expired = event(
            "evt_w04_a",
            "checkout.session.expired",
            json!({ "id": expired_session }),
        );
        assert_eq!(handler.handle_event(&expired).await.unwrap(), WebhookOutcome::Applied);
        assert_eq!(
            handler
                .handle_event(&completed("evt_w04_b", &expired_session, None))
                .await
                .unwrap(),
            WebhookOutcome::NoOp("order already failed")
        );
        assert!(!h.store.find(kit_a).await.unwrap().unwrap().has_access);

        let (_, paid_session) = checkout(&h, None, "oneoff").await;
        handler
            .handle_event(&completed("evt_w04_c", &paid_session, None))
            .await
            .unwrap();
        let late_expiry = event(
            "evt_w04_d",
            "checkout.session.expired",
            json!({ "id": paid_session }),
        );
        assert_eq!(
            handler.handle_event(&late_expiry).await.unwrap(),
            WebhookOutcome::NoOp("order not pending")
        );
        let order = h.store.find_by_session(&paid_session).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
    }

    // =========================================================================
    // BILL-W05: 36 paid invoices - no cancellation
    // =========================================================================
    #[tokio::test]
    async fn test_cap_not_reached_at_36() {
        let h = harness();
        h.provider.set_paid_invoices("sub_w05", 36);

        let outcome = h
            .billing
            .webhooks()
            .unwrap()
            .handle_event(&invoice_paid("evt_w05", "sub_w05"))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::NoOp("subscription below payment cap"));
        assert!(h.provider.cancelled_subscriptions().is_empty());
        assert_eq!(h.provider.invoice_count_calls(), vec!["sub_w05".to_string()]);
    }

    // =========================================================================
    // BILL-W06: 37 paid invoices - subscription cancelled exactly once, even
    //           when the next invoice event also sees the cap
    // =========================================================================
    #[tokio::test]
    async fn test_cap_reached_at_37_cancels_once() {
        let h = harness();
        h.provider.set_paid_invoices("sub_w06", 37);
        let handler = h.billing.webhooks().unwrap();

        assert_eq!(
            handler
                .handle_event(&invoice_paid("evt_w06_a", "sub_w06"))
                .await
                .unwrap(),
            WebhookOutcome::Applied
        );
        handler
            .handle_event(&invoice_paid("evt_w06_b", "sub_w06"))
            .await
            .unwrap();

        assert_eq!(h.provider.cancelled_subscriptions(), vec!["sub_w06".to_string()]);
        assert_eq!(h.provider.invoice_count_calls().len(), 2);
    }

    // =========================================================================
    // BILL-W07: Invoice without a subscription is not counted
    // =========================================================================
    #[tokio::test]
    async fn test_one_off_invoice_skips_cap_check() {
        let h = harness();
        let invoice = event(
            "evt_w07",
            "invoice.payment_succeeded",
            json!({ "id": "in_w07", "subscription": null }),
        );

        h.billing.webhooks().unwrap().handle_event(&invoice).await.unwrap();
        assert!(h.provider.invoice_count_calls().is_empty());
    }

    // =========================================================================
    // BILL-W08: Subscription deleted - profile reset to free, kit access kept
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_deleted_keeps_access() {
        let h = harness();
        let user = Uuid::new_v4();
        let (kit_id, session_id) = checkout(&h, Some(user), "subscription").await;
        let handler = h.billing.webhooks().unwrap();

        handler
            .handle_event(&completed("evt_w08_a", &session_id, Some("sub_w08")))
            .await
            .unwrap();
        assert_eq!(h.store.plan_status(user).await.unwrap(), PlanStatus::Subscriber);

        let deleted = event(
            "evt_w08_b",
            "customer.subscription.deleted",
            json!({ "id": "sub_w08", "metadata": {} }),
        );
        assert_eq!(handler.handle_event(&deleted).await.unwrap(), WebhookOutcome::Applied);

        assert_eq!(h.store.plan_status(user).await.unwrap(), PlanStatus::Free);
        assert!(h.store.find(kit_id).await.unwrap().unwrap().has_access);
        let order = h.store.find_by_subscription("sub_w08").await.unwrap().unwrap();
        assert!(order.subscription_cancelled_at.is_some());
    }

    // =========================================================================
    // BILL-W09: Deletion arrives before completion - order found through
    //           metadata, completion does not upgrade the profile again
    // =========================================================================
    #[tokio::test]
    async fn test_out_of_order_deletion_then_completion() {
        let h = harness();
        let user = Uuid::new_v4();
        let (kit_id, session_id) = checkout(&h, Some(user), "subscription").await;
        let order = h.store.find_by_session(&session_id).await.unwrap().unwrap();
        let handler = h.billing.webhooks().unwrap();

        let deleted = event(
            "evt_w09_a",
            "customer.subscription.deleted",
            json!({ "id": "sub_w09", "metadata": { "order_id": order.id.to_string() } }),
        );
        assert_eq!(handler.handle_event(&deleted).await.unwrap(), WebhookOutcome::Applied);

        handler
            .handle_event(&completed("evt_w09_b", &session_id, Some("sub_w09")))
            .await
            .unwrap();

        assert_eq!(h.store.plan_status(user).await.unwrap(), PlanStatus::Free);
        assert!(h.store.find(kit_id).await.unwrap().unwrap().has_access);
    }

    // =========================================================================
    // BILL-W10: Unknown event types and unknown sessions are acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_unknown_inputs_acknowledged() {
        let h = harness();
        let handler = h.billing.webhooks().unwrap();

        let unknown = event("evt_w10_a", "customer.created", json!({ "id": "cus_1" }));
        assert_eq!(handler.handle_event(&unknown).await.unwrap(), WebhookOutcome::Ignored);

        let orphan = completed("evt_w10_b", "cs_never_created", None);
        assert_eq!(
            handler.handle_event(&orphan).await.unwrap(),
            WebhookOutcome::NoOp("no order for session")
        );

        let failed_invoice = event(
            "evt_w10_c",
            "invoice.payment_failed",
            json!({ "id": "in_1", "subscription": "sub_x" }),
        );
        assert!(matches!(
            handler.handle_event(&failed_invoice).await.unwrap(),
            WebhookOutcome::NoOp(_)
        ));
    }

    // =========================================================================
    // BILL-W11: Failed processing is recorded and the event can be retried
    // =========================================================================
    #[tokio::test]
    async fn test_errored_event_is_reclaimable() {
        let h = harness();
        h.provider.set_paid_invoices("sub_w11", 37);
        h.provider.fail_invoice_listing(true);
        let handler = h.billing.webhooks().unwrap();
        let event = invoice_paid("evt_w11", "sub_w11");

        assert!(handler.handle_event(&event).await.is_err());
        let record = h.store.webhook_event("evt_w11").await.unwrap();
        assert_eq!(record.processing_result, "error");

        h.provider.fail_invoice_listing(false);
        assert_eq!(handler.handle_event(&event).await.unwrap(), WebhookOutcome::Applied);
        assert!(h.provider.is_cancelled("sub_w11"));
        assert_eq!(
            h.store.webhook_event("evt_w11").await.unwrap().processing_result,
            "success"
        );
    }

    // =========================================================================
    // BILL-W13: Profile update fails after the order completed - the
    //           redelivery applies the plan status
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_repairs_failed_profile_update() {
        let h = harness_with(|store, stores| Stores {
            profiles: Arc::new(FlakyProfiles::new(store)),
            ..stores
        });
        let user = Uuid::new_v4();
        let (kit_id, session_id) = checkout(&h, Some(user), "oneoff").await;
        let handler = h.billing.webhooks().unwrap();
        let event = completed("evt_w13", &session_id, None);

        let first = handler.handle_event(&event).await;
        assert!(matches!(first, Err(BillingError::Database(_))));
        let order = h.store.find_by_session(&session_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert!(h.store.find(kit_id).await.unwrap().unwrap().has_access);
        assert_eq!(h.store.plan_status(user).await.unwrap(), PlanStatus::Free);

        assert_eq!(
            handler.handle_event(&event).await.unwrap(),
            WebhookOutcome::NoOp("order already completed")
        );
        assert_eq!(h.store.plan_status(user).await.unwrap(), PlanStatus::Paid);
        assert_eq!(
            h.store.webhook_event("evt_w13").await.unwrap().processing_result,
            "success"
        );
    }

    // =========================================================================
    // BILL-W12: Concurrent deliveries of one event - handlers run once
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_deliveries_processed_once() {
        let h = Arc::new(harness());
        h.provider.set_paid_invoices("sub_w12", 10);
        let deliveries = 8;
        let barrier = Arc::new(Barrier::new(deliveries));
        let mut handles = vec![];

        for _ in 0..deliveries {
            let h = h.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                let event = invoice_paid("evt_w12", "sub_w12");
                barrier.wait().await;
                h.billing.webhooks().unwrap().handle_event(&event).await.unwrap()
            }));
        }

        let mut processed = 0;
        for handle in handles {
            if handle.await.unwrap() != WebhookOutcome::Duplicate {
                processed += 1;
            }
        }

        assert_eq!(processed, 1);
        assert_eq!(h.provider.invoice_count_calls().len(), 1);
    }
}

#[cfg(test)]
mod checkout_tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::support::*;
    use crate::error::BillingError;
    use crate::store::{KitStore, OrderStore, Stores};

    // =========================================================================
    // BILL-C01: Order write fails after the provider session exists - the
    //           checkout fails and no order is left behind
    // =========================================================================
    #[tokio::test]
    async fn test_unrecorded_order_fails_checkout() {
        let h = harness_with(|store, stores| Stores {
            orders: Arc::new(UnwritableOrders(store)),
            ..stores
        });
        let user = Uuid::new_v4();
        let kit = h.store.create(Some(user), &kit_spec("Abandoned"), false).await.unwrap();

        let result = h
            .billing
            .checkout()
            .unwrap()
            .create_checkout(kit.id, "oneoff", Some(user))
            .await;
        assert!(matches!(result, Err(BillingError::Database(_))));

        let sessions = h.provider.created_sessions();
        assert_eq!(sessions.len(), 1);
        let order_id: Uuid = sessions[0].client_reference_id.parse().unwrap();
        assert!(h.store.find_by_id(order_id).await.unwrap().is_none());
    }
}
