//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("No Stripe customer on record")]
    NoCustomer,

    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Insufficient credits ({remaining} remaining)")]
    InsufficientCredits { remaining: i32 },

    #[error("Free plan limit reached ({uses}/{limit})")]
    FreePlanLimitReached { uses: i32, limit: i32 },

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed provider payload: {0}")]
    MalformedPayload(String),

    /// Provider rate-limited us, returned 5xx, or timed out
    #[error("Billing provider temporarily unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller may retry the same request later
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::ProviderUnavailable(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            stripe::StripeError::Stripe(req) if req.http_status == 429 || req.http_status >= 500 => {
                BillingError::ProviderUnavailable(err.to_string())
            }
            stripe::StripeError::Timeout => BillingError::ProviderUnavailable(err.to_string()),
            stripe::StripeError::Stripe(req) => BillingError::StripeApi(
                req.message
                    .clone()
                    .unwrap_or_else(|| format!("request failed with status {}", req.http_status)),
            ),
            _ => BillingError::StripeApi(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::MalformedPayload(err.to_string())
    }
}
