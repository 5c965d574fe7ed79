//! API error type and its JSON rendering

use atasura_billing::BillingError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};

use crate::auth::AuthError;
use crate::generation::GenerationError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidPlan(String),

    #[error("Insufficient credits")]
    InsufficientCredits { remaining: i32 },

    #[error("Free plan limit reached")]
    FreePlanLimitReached { uses: i32, limit: i32 },

    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Upstream rate limit, outage or timeout
    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Upstream(String),

    #[error("Database error")]
    Database(String),

    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) | ApiError::InvalidPlan(_) | ApiError::InvalidSignature => {
                StatusCode::BAD_REQUEST
            }
            ApiError::InsufficientCredits { .. } | ApiError::FreePlanLimitReached { .. } => {
                StatusCode::PAYMENT_REQUIRED
            }
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::InvalidPlan(_) => "INVALID_PLAN",
            ApiError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            ApiError::FreePlanLimitReached { .. } => "FREE_PLAN_LIMIT_REACHED",
            ApiError::InvalidSignature => "INVALID_SIGNATURE",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Upstream(_) => "UPSTREAM_ERROR",
            ApiError::Database(_) => "DB_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            ApiError::Database(detail) | ApiError::Internal(detail) => {
                tracing::error!(code = self.code(), detail = %detail, "Request failed");
            }
            ApiError::ServiceUnavailable(detail) | ApiError::Upstream(detail) => {
                tracing::warn!(code = self.code(), detail = %detail, "Upstream failure");
            }
            _ => {}
        }

        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(self.to_string()));
        body.insert("code".to_string(), Value::String(self.code().to_string()));
        body.insert("status".to_string(), json!(status.as_u16()));

        match &self {
            ApiError::InsufficientCredits { remaining } => {
                body.insert("creditsRemaining".to_string(), json!(remaining));
            }
            ApiError::FreePlanLimitReached { uses, limit } => {
                body.insert("uses".to_string(), json!(uses));
                body.insert("limit".to_string(), json!(limit));
            }
            _ => {}
        }

        (status, Json(Value::Object(body))).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidPlan(msg) => ApiError::InvalidPlan(format!("Invalid plan: {msg}")),
            BillingError::InvalidRequest(msg) => ApiError::Validation(msg),
            BillingError::NoActiveSubscription => {
                ApiError::Validation("No active subscription".to_string())
            }
            BillingError::NoCustomer => {
                ApiError::Validation("No billing account found for this user".to_string())
            }
            BillingError::Unauthorized => ApiError::Unauthorized,
            BillingError::Forbidden(msg) => ApiError::Forbidden(msg),
            BillingError::InsufficientCredits { remaining } => {
                ApiError::InsufficientCredits { remaining }
            }
            BillingError::FreePlanLimitReached { uses, limit } => {
                ApiError::FreePlanLimitReached { uses, limit }
            }
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::MalformedPayload(msg) => ApiError::Upstream(msg),
            BillingError::ProviderUnavailable(msg) => {
                tracing::warn!(detail = %msg, "Billing provider unavailable");
                ApiError::ServiceUnavailable(
                    "Billing service is busy, please try again shortly".to_string(),
                )
            }
            BillingError::StripeApi(msg) => ApiError::Upstream(msg),
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) | BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        if err.is_transient() {
            tracing::warn!(error = %err, "Generation service unavailable");
            ApiError::ServiceUnavailable(
                "Generation service is busy, please try again shortly".to_string(),
            )
        } else {
            ApiError::Upstream(err.to_string())
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(_: AuthError) -> Self {
        ApiError::Unauthorized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_insufficient_credits_body() {
        let (status, body) = body_json(BillingError::InsufficientCredits { remaining: 4 }.into()).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["code"], "INSUFFICIENT_CREDITS");
        assert_eq!(body["creditsRemaining"], 4);
        assert_eq!(body["status"], 402);
    }

    #[tokio::test]
    async fn test_free_limit_body() {
        let (status, body) =
            body_json(BillingError::FreePlanLimitReached { uses: 3, limit: 3 }.into()).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["code"], "FREE_PLAN_LIMIT_REACHED");
        assert_eq!(body["uses"], 3);
        assert_eq!(body["limit"], 3);
    }

    #[tokio::test]
    async fn test_database_error_hides_detail() {
        let (status, body) =
            body_json(BillingError::Database("password authentication failed".into()).into())
                .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "DB_ERROR");
        assert_eq!(body["error"], "Database error");
    }

    #[test]
    fn test_upstream_mapping() {
        let unavailable: ApiError = BillingError::ProviderUnavailable("429".into()).into();
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let rejected: ApiError = BillingError::StripeApi("No such price".into()).into();
        assert_eq!(rejected.status(), StatusCode::BAD_GATEWAY);

        let timeout: ApiError = GenerationError::Timeout.into();
        assert_eq!(timeout.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bad_prompt: ApiError = GenerationError::Rejected {
            status: 400,
            message: "blocked".into(),
        }
        .into();
        assert_eq!(bad_prompt.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_validation_family_is_400() {
        for err in [
            BillingError::InvalidPlan("gold".into()),
            BillingError::InvalidRequest("x".into()),
            BillingError::NoActiveSubscription,
            BillingError::NoCustomer,
            BillingError::WebhookSignatureInvalid,
        ] {
            assert_eq!(ApiError::from(err).status(), StatusCode::BAD_REQUEST);
        }
    }
}
