//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::state::AppState;

/// Cookie the Supabase client libraries store the access token in
pub const ACCESS_TOKEN_COOKIE: &str = "sb-access-token";

/// Header carrying the shared key for `/internal` routes
pub const INTERNAL_KEY_HEADER: &str = "x-internal-key";

/// Authenticated user extracted from a verified access token
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

/// Request extension set by [`optional_auth`]; `None` for guests
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<AuthUser>);

impl MaybeAuthUser {
    pub fn user_id(&self) -> Option<Uuid> {
        self.0.as_ref().map(|u| u.user_id)
    }
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|c| c.strip_prefix(ACCESS_TOKEN_COOKIE)?.strip_prefix('='))
                .filter(|t| !t.is_empty())
                .map(String::from)
        })
}

/// Bearer token from the Authorization header, falling back to the session cookie
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Middleware that requires a valid access token
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => state.jwt_verifier.verify(&token),
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(path = %path, user_id = %auth_user.user_id, "require_auth: authenticated");
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that authenticates when a valid token is present and lets
/// guests through otherwise
pub async fn optional_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let auth_user = extract_bearer_token(&request).and_then(|token| {
        state
            .jwt_verifier
            .verify(&token)
            .map_err(|err| {
                tracing::debug!(error = ?err, "optional_auth: ignoring invalid token");
            })
            .ok()
    });

    request.extensions_mut().insert(MaybeAuthUser(auth_user));
    next.run(request).await
}

/// Middleware for service-to-service routes keyed by `INTERNAL_API_KEY`
pub async fn require_internal_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.internal_api_key.as_deref() else {
        tracing::warn!("Internal route called but INTERNAL_API_KEY is not set");
        return AuthError::InternalKeyNotConfigured.into_response();
    };

    let provided = request
        .headers()
        .get(INTERNAL_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!(path = %request.uri().path(), "Internal route rejected: bad key");
        return AuthError::InvalidInternalKey.into_response();
    }

    next.run(request).await
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Invalid internal key")]
    InvalidInternalKey,
    #[error("INTERNAL_API_KEY is not configured")]
    InternalKeyNotConfigured,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::InvalidInternalKey => (StatusCode::UNAUTHORIZED, "Invalid internal key"),
            AuthError::InternalKeyNotConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                "INTERNAL_API_KEY is not configured",
            ),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
