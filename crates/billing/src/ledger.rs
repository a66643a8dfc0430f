//! Credit ledger service
//!
//! Balances are materialized on `credit_accounts` and every change is also
//! appended to `credit_transactions`, so the balance can always be recomputed
//! from the ledger. The non-negative balance guard is enforced by the store
//! in the same operation as the decrement.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{BalanceCheck, CreditTransaction, SpendResult};
use crate::store::LedgerStore;

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 200;

/// Upper bound on a single reason string stored in the ledger
const MAX_REASON_LEN: usize = 500;

/// Credit ledger operations
#[derive(Clone)]
pub struct CreditLedgerService {
    store: Arc<dyn LedgerStore>,
}

impl CreditLedgerService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Current balance; 0 for users that never transacted
    pub async fn get_balance(&self, user_id: Uuid) -> BillingResult<i64> {
        self.store.balance(user_id).await
    }

    /// Debit `amount` credits if the balance covers it
    ///
    /// Insufficient funds is not an error: the result has `success == false`
    /// and carries the unchanged balance, and no ledger entry is written.
    pub async fn spend(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        reference_id: Option<Uuid>,
    ) -> BillingResult<SpendResult> {
        validate_amount(amount)?;
        let reason = validate_reason(reason)?;

        let result = self
            .store
            .debit(user_id, amount, reason, reference_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %user_id,
                    amount = amount,
                    reference_id = ?reference_id,
                    error = %e,
                    "Credit spend failed"
                );
                e
            })?;

        if result.success {
            tracing::info!(
                user_id = %user_id,
                amount = amount,
                new_balance = result.new_balance,
                reason = %reason,
                reference_id = ?reference_id,
                "Credits spent"
            );
        } else {
            tracing::info!(
                user_id = %user_id,
                amount = amount,
                balance = result.new_balance,
                reason = %reason,
                "Credit spend rejected: insufficient balance"
            );
        }

        Ok(result)
    }

    /// Credit `amount` to the user; returns the new balance
    pub async fn earn(&self, user_id: Uuid, amount: i64, reason: &str) -> BillingResult<i64> {
        validate_amount(amount)?;
        let reason = validate_reason(reason)?;

        let new_balance = self
            .store
            .credit(user_id, amount, reason, None)
            .await
            .map_err(|e| {
                tracing::error!(
                    user_id = %user_id,
                    amount = amount,
                    error = %e,
                    "Credit grant failed"
                );
                e
            })?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            new_balance = new_balance,
            reason = %reason,
            "Credits earned"
        );

        Ok(new_balance)
    }

    /// Ledger entries, newest first
    pub async fn history(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let limit = clamp_history_limit(limit);
        self.store.transactions(user_id, limit).await
    }

    /// Recompute the ledger sum and compare it with the materialized balance
    pub async fn reconcile(&self, user_id: Uuid) -> BillingResult<BalanceCheck> {
        let check = self.store.balance_check(user_id).await?;

        if !check.is_consistent() {
            tracing::error!(
                user_id = %user_id,
                materialized = check.materialized,
                ledger_sum = check.ledger_sum,
                "RECONCILIATION NEEDED: credit balance does not match ledger"
            );
        }

        Ok(check)
    }
}

pub fn clamp_history_limit(limit: Option<i64>) -> i64 {
    limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT)
}

fn validate_amount(amount: i64) -> BillingResult<()> {
    if amount <= 0 {
        return Err(BillingError::InvalidInput(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

fn validate_reason(reason: &str) -> BillingResult<&str> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(BillingError::InvalidInput(
            "reason must not be empty".to_string(),
        ));
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(BillingError::InvalidInput(format!(
            "reason must be at most {} bytes",
            MAX_REASON_LEN
        )));
    }
    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> CreditLedgerService {
        CreditLedgerService::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_unknown_user_has_zero_balance() {
        let ledger = service();
        assert_eq!(ledger.get_balance(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_earn_then_spend() {
        let ledger = service();
        let user = Uuid::new_v4();

        assert_eq!(ledger.earn(user, 1000, "signup bonus").await.unwrap(), 1000);
        let result = ledger.spend(user, 300, "kit", None).await.unwrap();
        assert_eq!(
            result,
            SpendResult {
                success: true,
                new_balance: 700
            }
        );
        assert_eq!(ledger.get_balance(user).await.unwrap(), 700);
    }

    #[tokio::test]
    async fn test_insufficient_spend_leaves_ledger_untouched() {
        let ledger = service();
        let user = Uuid::new_v4();
        ledger.earn(user, 100, "grant").await.unwrap();

        let result = ledger.spend(user, 101, "kit", None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.new_balance, 100);
        assert_eq!(ledger.history(user, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_positive_amounts_rejected() {
        let ledger = service();
        let user = Uuid::new_v4();

        for amount in [0, -5] {
            assert!(matches!(
                ledger.spend(user, amount, "kit", None).await,
                Err(BillingError::InvalidInput(_))
            ));
            assert!(matches!(
                ledger.earn(user, amount, "grant").await,
                Err(BillingError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_blank_reason_rejected() {
        let ledger = service();
        assert!(matches!(
            ledger.earn(Uuid::new_v4(), 10, "   ").await,
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_consistent_after_activity() {
        let ledger = service();
        let user = Uuid::new_v4();
        ledger.earn(user, 500, "grant").await.unwrap();
        ledger.spend(user, 200, "kit", None).await.unwrap();
        ledger.spend(user, 400, "kit", None).await.unwrap();

        let check = ledger.reconcile(user).await.unwrap();
        assert!(check.is_consistent());
        assert_eq!(check.materialized, 300);
    }

    #[test]
    fn test_history_limit_clamped() {
        assert_eq!(clamp_history_limit(None), DEFAULT_HISTORY_LIMIT);
        assert_eq!(clamp_history_limit(Some(0)), 1);
        assert_eq!(clamp_history_limit(Some(10_000)), MAX_HISTORY_LIMIT);
        assert_eq!(clamp_history_limit(Some(25)), 25);
    }
}
