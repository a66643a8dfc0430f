//! Authentication module for IdeaKit

pub mod jwt;
pub mod middleware;

pub use jwt::{SupabaseClaims, SupabaseJwtVerifier, SUPABASE_AUDIENCE};
pub use middleware::{
    optional_auth, require_auth, require_internal_key, AuthError, AuthUser, MaybeAuthUser,
    ACCESS_TOKEN_COOKIE, INTERNAL_KEY_HEADER,
};
