//! Supabase access token validation
//!
//! Supabase signs access tokens with the project's JWT secret (HS256), so
//! they can be checked locally without a round trip to the auth server.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::middleware::AuthError;

/// Audience Supabase puts on tokens for signed-in users
pub const SUPABASE_AUDIENCE: &str = "authenticated";

/// Claims we read from a Supabase access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Clone)]
pub struct SupabaseJwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl SupabaseJwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[SUPABASE_AUDIENCE]);
        validation.leeway = 60;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate signature, expiry and audience; returns the user id and email
    pub fn verify(&self, token: &str) -> Result<(Uuid, Option<String>), AuthError> {
        let data = decode::<SupabaseClaims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "Supabase token rejected");
            AuthError::InvalidToken
        })?;

        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| AuthError::InvalidToken)?;
        Ok((user_id, data.claims.email))
    }
}

#[cfg(test)]
pub(crate) mod test_tokens {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    pub const TEST_SECRET: &str = "test-supabase-jwt-secret";

    pub fn token_with(secret: &str, sub: &str, aud: &str, exp_offset_secs: i64) -> String {
        let claims = SupabaseClaims {
            sub: sub.to_string(),
            exp: time::OffsetDateTime::now_utc().unix_timestamp() + exp_offset_secs,
            aud: Some(aud.to_string()),
            email: Some("user@example.com".to_string()),
            role: Some("authenticated".to_string()),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    pub fn valid_token(user_id: Uuid) -> String {
        token_with(TEST_SECRET, &user_id.to_string(), SUPABASE_AUDIENCE, 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::test_tokens::*;
    use super::*;

    #[test]
    fn test_valid_token() {
        let user = Uuid::new_v4();
        let verifier = SupabaseJwtVerifier::new(TEST_SECRET);
        let (user_id, email) = verifier.verify(&valid_token(user)).unwrap();
        assert_eq!(user_id, user);
        assert_eq!(email.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = SupabaseJwtVerifier::new(TEST_SECRET);
        let token = token_with("other-secret", &Uuid::new_v4().to_string(), SUPABASE_AUDIENCE, 3600);
        assert!(matches!(verifier.verify(&token), Err(AuthError::InvalidToken)));
    }
}
