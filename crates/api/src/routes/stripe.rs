//! Stripe-facing routes: webhook ingestion, post-checkout verification and
//! self-service subscription management

use atasura_billing::{PlanChangeResult, SubscriptionView, VerifySessionResponse};
use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionRequest {
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChangeRequest {
    #[serde(default)]
    pub plan_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CancelRequest {
    /// Undo a pending cancellation instead
    pub reactivate: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortalRequest {
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefundRequestBody {
    pub reason: String,
    pub details: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequestResponse {
    pub success: bool,
    pub request_id: Uuid,
}

// =============================================================================
// Webhook
// =============================================================================

/// POST /stripe/webhook and POST /webhook
///
/// The raw body is needed for signature verification. A signature failure
/// is a 400; a processing failure is a 500 so Stripe redelivers.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook received without Stripe-Signature header");
            ApiError::InvalidSignature
        })?;

    let webhooks = &state.billing.webhooks;

    let event = webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = %e, "Webhook rejected");
        ApiError::InvalidSignature
    })?;

    match webhooks.handle_event(&event).await {
        Ok(outcome) => {
            tracing::debug!(event_id = %event.id, outcome = ?outcome, "Webhook handled");
            Ok(Json(json!({ "received": true })))
        }
        Err(e) => {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook processing failed"
            );
            Err(ApiError::Internal(format!("webhook processing failed: {e}")))
        }
    }
}

// =============================================================================
// Checkout verification
// =============================================================================

/// POST /stripe/verify-session
pub async fn verify_session(
    State(state): State<AppState>,
    auth_user: Option<Extension<AuthUser>>,
    Json(req): Json<VerifySessionRequest>,
) -> ApiResult<Json<VerifySessionResponse>> {
    let caller = auth_user.map(|Extension(u)| u.user_id);
    let response = state
        .billing
        .verify
        .verify_session(&req.session_id, caller)
        .await?;

    Ok(Json(response))
}

// =============================================================================
// Subscription management
// =============================================================================

/// GET /stripe/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionView>> {
    let view = state
        .billing
        .plan_change
        .get_subscription_view(auth_user.user_id)
        .await?;
    Ok(Json(view))
}

/// POST /stripe/subscription/upgrade
pub async fn upgrade(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<PlanChangeResult>> {
    let result = state
        .billing
        .plan_change
        .upgrade(auth_user.user_id, &req.plan_id)
        .await?;
    Ok(Json(result))
}

/// POST /stripe/subscription/downgrade
pub async fn downgrade(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<PlanChangeResult>> {
    let result = state
        .billing
        .plan_change
        .downgrade(auth_user.user_id, &req.plan_id)
        .await?;
    Ok(Json(result))
}

/// POST /stripe/subscription/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CancelRequest>,
) -> ApiResult<Json<PlanChangeResult>> {
    let plan_change = &state.billing.plan_change;
    let result = if req.reactivate {
        plan_change.reactivate(auth_user.user_id).await?
    } else {
        plan_change.cancel(auth_user.user_id).await?
    };
    Ok(Json(result))
}

/// POST /stripe/portal
pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<PortalResponse>> {
    let url = state
        .billing
        .portal
        .create_portal_session(auth_user.user_id, req.return_url.as_deref())
        .await?;
    Ok(Json(PortalResponse { url }))
}

/// POST /stripe/refund-request
pub async fn submit_refund_request(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<RefundRequestBody>,
) -> ApiResult<Json<RefundRequestResponse>> {
    let record = state
        .billing
        .refund
        .submit_request(
            auth_user.user_id,
            auth_user.email.as_deref(),
            &req.reason,
            &req.details,
        )
        .await?;

    Ok(Json(RefundRequestResponse {
        success: true,
        request_id: record.id,
    }))
}
