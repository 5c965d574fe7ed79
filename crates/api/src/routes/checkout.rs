//! Checkout session route

use atasura_billing::CheckoutResponse;
use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Deserialize;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub plan_id: String,
}

/// POST /checkout/create-session
pub async fn create_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let response = state
        .billing
        .checkout
        .create_checkout_session(
            &req.plan_id,
            auth_user.user_id,
            auth_user.email.as_deref(),
        )
        .await?;

    Ok(Json(response))
}
