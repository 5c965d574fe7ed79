//! Authentication module for Atasura

pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{SupabaseClaims, SupabaseJwtVerifier, SUPABASE_AUDIENCE};
pub use middleware::{optional_auth, require_auth, AuthError, AuthState, AuthUser};
