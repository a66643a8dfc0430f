//! Credit balance, history and spending for the signed-in user

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use ideakit_billing::CreditTransaction;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub balance: i64,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<CreditTransaction>,
}

#[derive(Debug, Deserialize)]
pub struct SpendRequest {
    pub amount: i64,
    pub description: String,
    #[serde(default)]
    pub reference_id: Option<Uuid>,
}

/// `success == false` means insufficient credits; `balance` is unchanged then
#[derive(Debug, Serialize)]
pub struct SpendResponse {
    pub success: bool,
    pub balance: i64,
}

pub async fn get_balance(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<BalanceResponse>> {
    let balance = state.billing.ledger.get_balance(auth_user.user_id).await?;
    Ok(Json(BalanceResponse { balance }))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<TransactionsQuery>,
) -> ApiResult<Json<TransactionsResponse>> {
    let transactions = state
        .billing
        .ledger
        .history(auth_user.user_id, query.limit)
        .await?;
    Ok(Json(TransactionsResponse { transactions }))
}

pub async fn spend_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SpendRequest>,
) -> ApiResult<Json<SpendResponse>> {
    let result = state
        .billing
        .ledger
        .spend(auth_user.user_id, req.amount, &req.description, req.reference_id)
        .await?;

    Ok(Json(SpendResponse {
        success: result.success,
        balance: result.new_balance,
    }))
}
