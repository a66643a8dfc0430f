//! Service-to-service routes guarded by `X-Internal-Key`

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use ideakit_billing::InvariantChecker;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct EarnRequest {
    pub user_id: Uuid,
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct EarnResponse {
    pub balance: i64,
}

/// Grant credits (purchases, promotions, refunds)
pub async fn earn_credits(
    State(state): State<AppState>,
    Json(req): Json<EarnRequest>,
) -> ApiResult<Json<EarnResponse>> {
    let balance = state
        .billing
        .ledger
        .earn(req.user_id, req.amount, &req.reason)
        .await?;
    Ok(Json(EarnResponse { balance }))
}

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    /// Run one named check instead of all of them
    pub check: Option<String>,
}

pub async fn run_invariants(
    State(state): State<AppState>,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Response> {
    let checker = state.billing.invariants()?;

    let response = match query.check {
        Some(name) => {
            let violations = checker.run_check(&name).await?;
            Json(json!({
                "check": name,
                "passed": violations.is_empty(),
                "violations": violations,
            }))
            .into_response()
        }
        None => {
            let summary = checker.run_all_checks().await?;
            if !summary.healthy {
                tracing::warn!(
                    checks_failed = summary.checks_failed,
                    available = ?InvariantChecker::available_checks(),
                    "Billing invariant checks reported violations"
                );
            }
            Json(summary).into_response()
        }
    };

    Ok(response)
}
