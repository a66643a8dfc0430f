//! Supabase access token verification

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::middleware::{AuthError, AuthUser};

/// Audience Supabase puts on tokens for signed-in users
pub const SUPABASE_AUDIENCE: &str = "authenticated";

/// Claims read from a Supabase access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseClaims {
    pub sub: String,
    pub aud: String,
    pub exp: usize,
    #[serde(default)]
    pub email: Option<String>,
}

/// Verifies HS256 tokens signed with the project's JWT secret
#[derive(Clone)]
pub struct SupabaseJwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl SupabaseJwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[SUPABASE_AUDIENCE]);

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthUser, AuthError> {
        let data = decode::<SupabaseClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Supabase token rejected");
                AuthError::InvalidToken
            })?;

        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::InvalidToken)?;

        Ok(AuthUser {
            user_id,
            email: data.claims.email,
        })
    }
}
