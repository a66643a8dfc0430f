//! Postgres-backed stores
//!
//! Balance and status changes are single statements: the guard (`balance >=
//! amount`, `status = 'pending'`) lives in the `WHERE` clause so concurrent
//! callers are serialized by row locks, not by application code.

use async_trait::async_trait;
use ideakit_shared::PlanStatus;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    EventClaim, KitStore, LedgerStore, OrderStore, ProfileStore, WebhookEventStore,
    WEBHOOK_PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BalanceCheck, CreditTransaction, Kit, KitRow, KitSpec, NewOrder, Order, OrderRow,
    SpendResult,
};

const ORDER_COLUMNS: &str = "id, user_id, kit_id, provider_session_id, plan_type, amount, \
     currency, status, subscription_id, subscription_cancelled_at, created_at, updated_at";

const KIT_COLUMNS: &str = "id, user_id, name, spec, has_access, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_balance(&self, user_id: Uuid) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT balance FROM credit_accounts WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(balance,)| balance))
    }

    async fn fetch_order(&self, query: &str, bind: &str) -> BillingResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(query)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Order::try_from).transpose()
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let lookup_error = |e: sqlx::Error| {
            BillingError::Database(format!("balance lookup for user {}: {}", user_id, e))
        };

        if let Some(balance) = self.fetch_balance(user_id).await.map_err(lookup_error)? {
            return Ok(balance);
        }

        // First use: create the account without touching an existing row, then
        // read whichever row won
        sqlx::query(
            r#"
            INSERT INTO credit_accounts (user_id, balance)
            VALUES ($1, 0)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(lookup_error)?;

        self.fetch_balance(user_id)
            .await
            .map_err(lookup_error)?
            .ok_or_else(|| {
                BillingError::Database(format!("credit account for user {} vanished", user_id))
            })
    }

    async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        reference_id: Option<Uuid>,
    ) -> BillingResult<SpendResult> {
        // Guarded decrement and ledger append in one statement. No row back
        // means the guard failed and nothing was written.
        let debited: Option<(i64,)> = sqlx::query_as(
            r#"
            WITH debited AS (
                UPDATE credit_accounts
                SET balance = balance - $2, updated_at = NOW()
                WHERE user_id = $1 AND balance >= $2
                RETURNING balance
            )
            INSERT INTO credit_transactions (user_id, delta, balance_after, reason, reference_id)
            SELECT $1, -$2, debited.balance, $3, $4 FROM debited
            RETURNING balance_after
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(reason)
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            BillingError::Database(format!(
                "debit of {} for user {} (reference {:?}): {}",
                amount, user_id, reference_id, e
            ))
        })?;

        match debited {
            Some((new_balance,)) => Ok(SpendResult {
                success: true,
                new_balance,
            }),
            None => Ok(SpendResult {
                success: false,
                new_balance: self.balance(user_id).await?,
            }),
        }
    }

    async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        reference_id: Option<Uuid>,
    ) -> BillingResult<i64> {
        let (new_balance,): (i64,) = sqlx::query_as(
            r#"
            WITH credited AS (
                INSERT INTO credit_accounts (user_id, balance)
                VALUES ($1, $2)
                ON CONFLICT (user_id) DO UPDATE
                SET balance = credit_accounts.balance + EXCLUDED.balance, updated_at = NOW()
                RETURNING balance
            )
            INSERT INTO credit_transactions (user_id, delta, balance_after, reason, reference_id)
            SELECT $1, $2, credited.balance, $3, $4 FROM credited
            RETURNING balance_after
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(reason)
        .bind(reference_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            BillingError::Database(format!(
                "credit of {} for user {}: {}",
                amount, user_id, e
            ))
        })?;

        Ok(new_balance)
    }

    async fn transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let rows: Vec<CreditTransaction> = sqlx::query_as(
            r#"
            SELECT id, user_id, delta, balance_after, reason, reference_id, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn balance_check(&self, user_id: Uuid) -> BillingResult<BalanceCheck> {
        let (materialized, ledger_sum): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE((SELECT balance FROM credit_accounts WHERE user_id = $1), 0)::BIGINT,
                COALESCE((SELECT SUM(delta) FROM credit_transactions WHERE user_id = $1), 0)::BIGINT
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(BalanceCheck {
            user_id,
            materialized,
            ledger_sum,
        })
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn insert(&self, order: NewOrder) -> BillingResult<Order> {
        let query = format!(
            r#"
            INSERT INTO orders
                (id, user_id, kit_id, provider_session_id, plan_type, amount, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );

        let row: OrderRow = sqlx::query_as(&query)
            .bind(order.id)
            .bind(order.user_id)
            .bind(order.kit_id)
            .bind(&order.provider_session_id)
            .bind(order.plan_type.as_str())
            .bind(order.amount)
            .bind(&order.currency)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                BillingError::Database(format!(
                    "insert order {} (session {}): {}",
                    order.id, order.provider_session_id, e
                ))
            })?;

        Order::try_from(row)
    }

    async fn find_by_id(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        let query = format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS);
        let row: Option<OrderRow> = sqlx::query_as(&query)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Order::try_from).transpose()
    }

    async fn find_by_session(&self, session_id: &str) -> BillingResult<Option<Order>> {
        let query = format!(
            "SELECT {} FROM orders WHERE provider_session_id = $1",
            ORDER_COLUMNS
        );
        self.fetch_order(&query, session_id).await
    }

    async fn find_by_subscription(&self, subscription_id: &str) -> BillingResult<Option<Order>> {
        let query = format!(
            "SELECT {} FROM orders WHERE subscription_id = $1 ORDER BY created_at DESC LIMIT 1",
            ORDER_COLUMNS
        );
        self.fetch_order(&query, subscription_id).await
    }

    async fn complete_pending(
        &self,
        order_id: Uuid,
        subscription_id: Option<&str>,
    ) -> BillingResult<Option<Order>> {
        let query = format!(
            r#"
            UPDATE orders
            SET status = 'completed',
                subscription_id = COALESCE($2, subscription_id),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );

        let row: Option<OrderRow> = sqlx::query_as(&query)
            .bind(order_id)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                BillingError::Database(format!("complete order {}: {}", order_id, e))
            })?;

        row.map(Order::try_from).transpose()
    }

    async fn fail_pending(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        let query = format!(
            r#"
            UPDATE orders
            SET status = 'failed', updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );

        let row: Option<OrderRow> = sqlx::query_as(&query)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Order::try_from).transpose()
    }

    async fn mark_subscription_cancelled(
        &self,
        order_id: Uuid,
        subscription_id: &str,
    ) -> BillingResult<Option<Order>> {
        let query = format!(
            r#"
            UPDATE orders
            SET subscription_cancelled_at = COALESCE(subscription_cancelled_at, NOW()),
                subscription_id = COALESCE(subscription_id, $2),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            ORDER_COLUMNS
        );

        let row: Option<OrderRow> = sqlx::query_as(&query)
            .bind(order_id)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Order::try_from).transpose()
    }
}

#[async_trait]
impl KitStore for PgStore {
    async fn create(
        &self,
        user_id: Option<Uuid>,
        spec: &KitSpec,
        has_access: bool,
    ) -> BillingResult<Kit> {
        let query = format!(
            r#"
            INSERT INTO kits (id, user_id, name, spec, has_access)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            KIT_COLUMNS
        );

        let row: KitRow = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(&spec.name)
            .bind(sqlx::types::Json(&spec.content))
            .bind(has_access)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }

    async fn find(&self, kit_id: Uuid) -> BillingResult<Option<Kit>> {
        let query = format!("SELECT {} FROM kits WHERE id = $1", KIT_COLUMNS);
        let row: Option<KitRow> = sqlx::query_as(&query)
            .bind(kit_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Kit::from))
    }

    async fn grant_access(&self, kit_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE kits SET has_access = TRUE, updated_at = NOW() \
             WHERE id = $1 AND has_access = FALSE",
        )
        .bind(kit_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(format!("grant access on kit {}: {}", kit_id, e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, kit_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query("DELETE FROM kits WHERE id = $1")
            .bind(kit_id)
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::Database(format!("delete kit {}: {}", kit_id, e)))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn set_plan_status(&self, user_id: Uuid, status: PlanStatus) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, plan_status)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
            SET plan_status = EXCLUDED.plan_status, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BillingError::Database(format!(
                "set plan status {} for user {}: {}",
                status, user_id, e
            ))
        })?;

        Ok(())
    }

    async fn plan_status(&self, user_id: Uuid) -> BillingResult<PlanStatus> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT plan_status FROM profiles WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((status,)) => status
                .parse()
                .map_err(|e: ideakit_shared::UnknownPlanStatus| {
                    BillingError::Database(e.to_string())
                }),
            None => Ok(PlanStatus::Free),
        }
    }
}

#[async_trait]
impl WebhookEventStore for PgStore {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        // Only one concurrent delivery gets a row back. Failed attempts and
        // deliveries stuck in processing past the timeout can be taken over.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CASE
                    WHEN stripe_webhook_events.processing_result = 'processing'
                        THEN CONCAT('Recovered from stuck state at ', NOW()::TEXT)
                    ELSE stripe_webhook_events.error_message
                END
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(WEBHOOK_PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some((status,)) if status == "success" => EventClaim::AlreadyProcessed,
            _ => EventClaim::InProgress,
        })
    }

    async fn record_result(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let processing_result = if error.is_some() { "error" } else { "success" };

        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(error)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
