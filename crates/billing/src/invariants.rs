//! Billing Invariants Module
//!
//! Runnable consistency checks over the ledger, orders and kits. They can be
//! run after an incident, a webhook replay or a manual correction to confirm
//! the system is back in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::saga::KIT_CREATION_REASON_PREFIX;

/// Pending orders older than this are reported as stale
pub const STALE_PENDING_ORDER_DAYS: i32 = 7;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or credits are wrong
    Critical,
    /// A customer paid but cannot use what they paid for
    High,
    /// Ledger points at something that no longer exists
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// True when no check reported a violation
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceMismatchRow {
    user_id: Uuid,
    balance: i64,
    ledger_sum: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    user_id: Uuid,
    balance: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CompletedWithoutAccessRow {
    order_id: Uuid,
    user_id: Option<Uuid>,
    kit_id: Uuid,
    provider_session_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanedDebitRow {
    transaction_id: Uuid,
    user_id: Uuid,
    reference_id: Uuid,
    delta: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePendingOrderRow {
    order_id: Uuid,
    user_id: Option<Uuid>,
    provider_session_id: String,
    created_at: OffsetDateTime,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_balance_matches_ledger().await?);
        violations.extend(self.check_non_negative_balance().await?);
        violations.extend(self.check_completed_orders_have_access().await?);
        violations.extend(self.check_kit_debits_reference_kits().await?);
        violations.extend(self.check_no_stale_pending_orders().await?);

        let summary =
            InvariantCheckSummary::from_violations(now, Self::available_checks().len(), violations);

        for violation in &summary.violations {
            tracing::error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                "RECONCILIATION NEEDED: {}",
                violation.description
            );
        }

        Ok(summary)
    }

    /// Invariant 1: materialized balance equals the sum of ledger entries
    async fn check_balance_matches_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceMismatchRow> = sqlx::query_as(
            r#"
            SELECT a.user_id, a.balance, COALESCE(SUM(t.delta), 0)::BIGINT AS ledger_sum
            FROM credit_accounts a
            LEFT JOIN credit_transactions t ON t.user_id = a.user_id
            GROUP BY a.user_id, a.balance
            HAVING a.balance <> COALESCE(SUM(t.delta), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "balance_matches_ledger".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Balance {} does not match ledger sum {}",
                    row.balance, row.ledger_sum
                ),
                context: serde_json::json!({
                    "balance": row.balance,
                    "ledger_sum": row.ledger_sum,
                    "difference": row.balance - row.ledger_sum,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: no negative balances
    ///
    /// The column has a CHECK constraint; this catches the constraint being
    /// dropped or bypassed.
    async fn check_non_negative_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> =
            sqlx::query_as("SELECT user_id, balance FROM credit_accounts WHERE balance < 0")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_balance".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Balance is negative: {}", row.balance),
                context: serde_json::json!({ "balance": row.balance }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: every completed order unlocked its kit
    async fn check_completed_orders_have_access(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CompletedWithoutAccessRow> = sqlx::query_as(
            r#"
            SELECT o.id AS order_id, o.user_id, o.kit_id, o.provider_session_id
            FROM orders o
            JOIN kits k ON k.id = o.kit_id
            WHERE o.status = 'completed'
              AND k.has_access = FALSE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_order_has_access".to_string(),
                user_ids: row.user_id.into_iter().collect(),
                description: format!(
                    "Order {} is completed but kit {} is still locked",
                    row.order_id, row.kit_id
                ),
                context: serde_json::json!({
                    "order_id": row.order_id,
                    "kit_id": row.kit_id,
                    "provider_session_id": row.provider_session_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: kit creation debits point at a kit that still exists
    ///
    /// A violation means a saga rollback removed the kit although the spend
    /// had in fact been committed.
    async fn check_kit_debits_reference_kits(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanedDebitRow> = sqlx::query_as(
            r#"
            SELECT t.id AS transaction_id, t.user_id, t.reference_id, t.delta
            FROM credit_transactions t
            LEFT JOIN kits k ON k.id = t.reference_id
            WHERE t.delta < 0
              AND t.reference_id IS NOT NULL
              AND t.reason LIKE $1
              AND k.id IS NULL
            "#,
        )
        .bind(format!("{}%", KIT_CREATION_REASON_PREFIX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "kit_debit_references_kit".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Debit of {} credits references missing kit {}",
                    -row.delta, row.reference_id
                ),
                context: serde_json::json!({
                    "transaction_id": row.transaction_id,
                    "reference_id": row.reference_id,
                    "delta": row.delta,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: pending orders do not linger
    async fn check_no_stale_pending_orders(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePendingOrderRow> = sqlx::query_as(
            r#"
            SELECT id AS order_id, user_id, provider_session_id, created_at
            FROM orders
            WHERE status = 'pending'
              AND created_at < NOW() - ($1 || ' days')::INTERVAL
            "#,
        )
        .bind(STALE_PENDING_ORDER_DAYS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_pending_orders".to_string(),
                user_ids: row.user_id.into_iter().collect(),
                description: format!(
                    "Order {} has been pending for more than {} days",
                    row.order_id, STALE_PENDING_ORDER_DAYS
                ),
                context: serde_json::json!({
                    "order_id": row.order_id,
                    "provider_session_id": row.provider_session_id,
                    "created_at": row.created_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "balance_matches_ledger" => self.check_balance_matches_ledger().await,
            "non_negative_balance" => self.check_non_negative_balance().await,
            "completed_order_has_access" => self.check_completed_orders_have_access().await,
            "kit_debit_references_kit" => self.check_kit_debits_reference_kits().await,
            "no_stale_pending_orders" => self.check_no_stale_pending_orders().await,
            other => Err(BillingError::InvalidInput(format!(
                "unknown invariant check '{}'",
                other
            ))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "balance_matches_ledger",
            "non_negative_balance",
            "completed_order_has_access",
            "kit_debit_references_kit",
            "no_stale_pending_orders",
        ]
    }
}
