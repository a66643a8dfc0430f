//! Kit creation saga
//!
//! Creating a kit with credits touches two things that cannot share a
//! transaction from the caller's point of view: the kit row and the credit
//! ledger. The saga orders the steps so that the only partial state it can
//! leave behind is a kit without a matching debit, and removes that kit when
//! the debit does not go through.
//!
//! 1. Check the balance covers the cost (fail fast, no side effects)
//! 2. Create the kit with access granted
//! 3. Spend the credits, referencing the kit id
//! 4. If the spend is rejected or fails, delete the kit

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::CreditLedgerService;
use crate::models::{Kit, KitSpec};
use crate::store::KitStore;

/// Ledger reason prefix for saga debits
pub const KIT_CREATION_REASON_PREFIX: &str = "Kit creation: ";

/// Shortfall reported when a user cannot afford a kit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditShortfall {
    pub required: i64,
    pub current: i64,
    pub needed: i64,
}

impl CreditShortfall {
    pub fn new(required: i64, current: i64) -> Self {
        Self {
            required,
            current,
            needed: (required - current).max(0),
        }
    }
}

/// Result of running the saga
#[derive(Debug, Clone, PartialEq)]
pub enum KitCreation {
    Created {
        kit: Kit,
        credits_spent: i64,
        new_balance: i64,
    },
    InsufficientCredits(CreditShortfall),
}

#[derive(Clone)]
pub struct KitCreationSaga {
    ledger: CreditLedgerService,
    kits: Arc<dyn KitStore>,
    cost: i64,
}

impl KitCreationSaga {
    pub fn new(ledger: CreditLedgerService, kits: Arc<dyn KitStore>, cost: i64) -> Self {
        Self { ledger, kits, cost }
    }

    pub async fn create_kit(&self, user_id: Uuid, spec: KitSpec) -> BillingResult<KitCreation> {
        let spec = spec.normalized()?;

        let balance = self.ledger.get_balance(user_id).await?;
        if balance < self.cost {
            tracing::info!(
                user_id = %user_id,
                balance = balance,
                cost = self.cost,
                "Kit creation rejected before any side effect: insufficient credits"
            );
            return Ok(KitCreation::InsufficientCredits(CreditShortfall::new(
                self.cost, balance,
            )));
        }

        let kit = self.kits.create(Some(user_id), &spec, true).await?;
        tracing::debug!(user_id = %user_id, kit_id = %kit.id, "Kit created, spending credits");

        let reason = format!("{}{}", KIT_CREATION_REASON_PREFIX, kit.name);
        let spend = self
            .ledger
            .spend(user_id, self.cost, &reason, Some(kit.id))
            .await;

        match spend {
            Ok(result) if result.success => {
                tracing::info!(
                    user_id = %user_id,
                    kit_id = %kit.id,
                    credits_spent = self.cost,
                    new_balance = result.new_balance,
                    "Kit created with credits"
                );
                Ok(KitCreation::Created {
                    kit,
                    credits_spent: self.cost,
                    new_balance: result.new_balance,
                })
            }
            Ok(result) => {
                // Balance drained between the check and the spend
                tracing::info!(
                    user_id = %user_id,
                    kit_id = %kit.id,
                    balance = result.new_balance,
                    cost = self.cost,
                    "Credit spend rejected after kit creation - rolling back kit"
                );
                self.compensate(user_id, kit.id).await?;
                Ok(KitCreation::InsufficientCredits(CreditShortfall::new(
                    self.cost,
                    result.new_balance,
                )))
            }
            Err(spend_err) => {
                tracing::error!(
                    user_id = %user_id,
                    kit_id = %kit.id,
                    error = %spend_err,
                    "Credit spend failed after kit creation - rolling back kit"
                );
                self.compensate(user_id, kit.id).await?;
                Err(spend_err)
            }
        }
    }

    async fn compensate(&self, user_id: Uuid, kit_id: Uuid) -> BillingResult<()> {
        match self.kits.delete(kit_id).await {
            Ok(_) => {
                tracing::info!(user_id = %user_id, kit_id = %kit_id, "Kit rolled back");
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    kit_id = %kit_id,
                    error = %e,
                    "RECONCILIATION NEEDED: kit exists with access but no credits were spent"
                );
                Err(BillingError::CompensationFailed(format!(
                    "kit {} could not be removed after a failed credit spend: {}",
                    kit_id, e
                )))
            }
        }
    }
}
