//! Credit balance and consumption routes

use atasura_billing::CreditBalance;
use axum::{
    extract::{Extension, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumeCreditsRequest {
    /// Defaults to the cost of one video
    pub amount: Option<i32>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeCreditsResponse {
    pub success: bool,
    pub credits_consumed: i32,
    pub credits_remaining: i32,
}

/// POST /credits/consume
pub async fn consume_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ConsumeCreditsRequest>,
) -> ApiResult<Json<ConsumeCreditsResponse>> {
    let credits = &state.billing.credits;
    let amount = req.amount.unwrap_or(credits.policy().credits_per_video);

    let credits_remaining = credits
        .consume_credits(auth_user.user_id, amount, req.session_id.as_deref())
        .await?
        .into_result()?;

    Ok(Json(ConsumeCreditsResponse {
        success: true,
        credits_consumed: amount,
        credits_remaining,
    }))
}

/// GET /credits
pub async fn get_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let balance: CreditBalance = state.billing.credits.balance(auth_user.user_id).await?;

    Ok(([(header::CACHE_CONTROL, "no-store")], Json(balance)))
}
