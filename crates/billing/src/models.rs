//! Typed records for the billing tables
//!
//! Every row crossing the storage boundary is one of these structs; JSON
//! columns are decoded into typed values here rather than passed around as
//! untyped maps.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::pricing::PlanType;

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Positive = credit, negative = debit
    pub delta: i64,
    /// Materialized balance right after this entry was applied
    pub balance_after: i64,
    pub reason: String,
    pub reference_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Outcome of a spend attempt
///
/// `success == false` is an expected result, not an error. In that case
/// `new_balance` is the unchanged current balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendResult {
    pub success: bool,
    pub new_balance: i64,
}

/// Materialized balance compared against the ledger it is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceCheck {
    pub user_id: Uuid,
    pub materialized: i64,
    pub ledger_sum: i64,
}

impl BalanceCheck {
    pub fn is_consistent(&self) -> bool {
        self.materialized == self.ledger_sum
    }
}

/// Order status; `Completed` and `Failed` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn from_db(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "completed" => Ok(OrderStatus::Completed),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(BillingError::Database(format!(
                "unexpected order status '{}'",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One checkout attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub id: Uuid,
    /// `None` for guest checkout before registration
    pub user_id: Option<Uuid>,
    pub kit_id: Uuid,
    pub provider_session_id: String,
    pub plan_type: PlanType,
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_cancelled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Raw `orders` row; converted into [`Order`] with validated enums
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OrderRow {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub kit_id: Uuid,
    pub provider_session_id: String,
    pub plan_type: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub subscription_id: Option<String>,
    pub subscription_cancelled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for Order {
    type Error = BillingError;

    fn try_from(row: OrderRow) -> BillingResult<Self> {
        let plan_type = row.plan_type.parse::<PlanType>().map_err(|_| {
            BillingError::Database(format!(
                "order {} has unexpected plan_type '{}'",
                row.id, row.plan_type
            ))
        })?;

        Ok(Order {
            id: row.id,
            user_id: row.user_id,
            kit_id: row.kit_id,
            provider_session_id: row.provider_session_id,
            plan_type,
            amount: row.amount,
            currency: row.currency,
            status: OrderStatus::from_db(&row.status)?,
            subscription_id: row.subscription_id,
            subscription_cancelled_at: row.subscription_cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Data needed to record a pending order
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub kit_id: Uuid,
    pub provider_session_id: String,
    pub plan_type: PlanType,
    pub amount: i64,
    pub currency: String,
}

/// Content of a kit as submitted by the intake flow
///
/// The billing engine only validates the name; `content` is carried through
/// untouched for the generation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KitSpec {
    pub name: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

pub const KIT_NAME_MAX_LEN: usize = 120;

impl KitSpec {
    /// Trim and validate the spec
    pub fn normalized(self) -> BillingResult<Self> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(BillingError::InvalidInput("kit name is required".to_string()));
        }
        if name.chars().count() > KIT_NAME_MAX_LEN {
            return Err(BillingError::InvalidInput(format!(
                "kit name must be at most {} characters",
                KIT_NAME_MAX_LEN
            )));
        }
        Ok(Self {
            name,
            content: self.content,
        })
    }
}

/// A billable resource; `has_access` is the entitlement flag
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kit {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub content: serde_json::Value,
    pub has_access: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct KitRow {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub spec: sqlx::types::Json<serde_json::Value>,
    pub has_access: bool,
    pub created_at: OffsetDateTime,
}

impl From<KitRow> for Kit {
    fn from(row: KitRow) -> Self {
        Kit {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            content: row.spec.0,
            has_access: row.has_access,
            created_at: row.created_at,
        }
    }
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
