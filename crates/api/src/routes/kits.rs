//! Credit-funded kit creation

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ideakit_billing::{KitCreation, KitSpec};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateKitRequest {
    pub name: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct KitResponse {
    pub id: Uuid,
    pub name: String,
    pub has_access: bool,
    pub credits_spent: i64,
    pub balance: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// 201 with the kit, or 402 with the shortfall when credits do not cover it
pub async fn create_kit(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateKitRequest>,
) -> ApiResult<Response> {
    let spec = KitSpec {
        name: req.name,
        content: req.spec,
    };

    let response = match state.billing.kits.create_kit(auth_user.user_id, spec).await? {
        KitCreation::Created {
            kit,
            credits_spent,
            new_balance,
        } => (
            StatusCode::CREATED,
            Json(KitResponse {
                id: kit.id,
                name: kit.name,
                has_access: kit.has_access,
                credits_spent,
                balance: new_balance,
                created_at: kit.created_at,
            }),
        )
            .into_response(),
        KitCreation::InsufficientCredits(shortfall) => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "error": "insufficient_credits",
                "required": shortfall.required,
                "current": shortfall.current,
                "needed": shortfall.needed,
            })),
        )
            .into_response(),
    };

    Ok(response)
}
