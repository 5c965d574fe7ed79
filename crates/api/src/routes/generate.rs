//! Generation gateway routes
//!
//! Billing points per action:
//! - outline: paid plans spend a video's worth of credits up front, free
//!   plans must have allowance left
//! - script: paid plans need a non-zero balance, free plans must have
//!   allowance left and use one on success
//! - image: paid plans spend an image's worth of credits, free plans must
//!   have allowance left
//! - image prompt translation is not billed
//!
//! Every call is written to the generation log, successful or not.

use std::time::Instant;

use atasura_billing::{BillingError, GenerationLogEntry};
use atasura_shared::GenerationAction;
use axum::{
    extract::{Extension, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    generation::{GeneratedImage, GenerationRequest, TokenUsage},
    state::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
    pub session_id: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<GeneratedImage>,
    pub model: String,
    pub usage: TokenUsage,
    /// Balance after this call, for paid plans that were charged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits_remaining: Option<i32>,
}

/// POST /generate/outline
pub async fn outline(
    state: State<AppState>,
    user: Extension<AuthUser>,
    req: Json<GenerateRequest>,
) -> ApiResult<Json<GenerateResponse>> {
    generate(state, user, req, GenerationAction::OutlineGeneration).await
}

/// POST /generate/script
pub async fn script(
    state: State<AppState>,
    user: Extension<AuthUser>,
    req: Json<GenerateRequest>,
) -> ApiResult<Json<GenerateResponse>> {
    generate(state, user, req, GenerationAction::ScriptGeneration).await
}

/// POST /generate/image
pub async fn image(
    state: State<AppState>,
    user: Extension<AuthUser>,
    req: Json<GenerateRequest>,
) -> ApiResult<Json<GenerateResponse>> {
    generate(state, user, req, GenerationAction::ImageGeneration).await
}

/// POST /generate/image-prompt
pub async fn image_prompt(
    state: State<AppState>,
    user: Extension<AuthUser>,
    req: Json<GenerateRequest>,
) -> ApiResult<Json<GenerateResponse>> {
    generate(state, user, req, GenerationAction::ImagePromptTranslation).await
}

/// Entitlement decision taken before the model call
struct Entitlement {
    is_free: bool,
    credits_remaining: Option<i32>,
}

async fn authorize(
    state: &AppState,
    user: &AuthUser,
    action: GenerationAction,
    session_id: Option<&str>,
) -> ApiResult<Entitlement> {
    let credits = &state.billing.credits;
    let policy = credits.policy();

    if action == GenerationAction::ImagePromptTranslation {
        return Ok(Entitlement {
            is_free: false,
            credits_remaining: None,
        });
    }

    let check = credits.check_credits(user.user_id, 0).await?;
    if check.plan.is_free() {
        credits.require_free_allowance(user.user_id).await?;
        return Ok(Entitlement {
            is_free: true,
            credits_remaining: None,
        });
    }

    let charge = match action {
        GenerationAction::OutlineGeneration => policy.credits_per_video,
        GenerationAction::ImageGeneration => policy.credits_per_image,
        _ => 0,
    };

    if charge == 0 {
        if !check.has_credits {
            return Err(BillingError::InsufficientCredits {
                remaining: check.credits_remaining,
            }
            .into());
        }
        return Ok(Entitlement {
            is_free: false,
            credits_remaining: Some(check.credits_remaining),
        });
    }

    let remaining = credits
        .consume_credits(user.user_id, charge, session_id)
        .await?
        .into_result()?;

    Ok(Entitlement {
        is_free: false,
        credits_remaining: Some(remaining),
    })
}

async fn generate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<GenerateRequest>,
    action: GenerationAction,
) -> ApiResult<Json<GenerateResponse>> {
    let prompt = req.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ApiError::Validation("prompt is required".to_string()));
    }

    let entitlement = authorize(&state, &user, action, req.session_id.as_deref()).await?;

    let model = req
        .model
        .clone()
        .unwrap_or_else(|| state.generation.default_model(action));
    let prompt_length = i32::try_from(prompt.chars().count()).unwrap_or(i32::MAX);

    let started = Instant::now();
    let result = state
        .generation
        .generate(GenerationRequest {
            action,
            model: req.model,
            prompt,
        })
        .await;
    let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

    let (usage, response_length, model_used, error_message) = match &result {
        Ok(output) => (
            output.usage,
            i32::try_from(output.text.chars().count()).unwrap_or(i32::MAX),
            output.model.clone(),
            None,
        ),
        Err(e) => (TokenUsage::default(), 0, model, Some(e.to_string())),
    };

    let credits = &state.billing.credits;
    let _ = credits.log_generation_tokens(GenerationLogEntry {
        session_id: req.session_id,
        user_id: user.user_id,
        action,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        model: model_used,
        prompt_length,
        response_length,
        duration_ms,
        success: result.is_ok(),
        error_message,
    });

    let output = result.map_err(|e| {
        tracing::warn!(
            user_id = %user.user_id,
            action = action.as_str(),
            error = %e,
            "Generation failed"
        );
        ApiError::from(e)
    })?;

    if entitlement.is_free && action == GenerationAction::ScriptGeneration {
        let _ = credits.increment_free_script_uses(user.user_id);
    }

    tracing::info!(
        user_id = %user.user_id,
        action = action.as_str(),
        model = %output.model,
        total_tokens = output.usage.total_tokens,
        duration_ms,
        "Generation completed"
    );

    Ok(Json(GenerateResponse {
        text: output.text,
        image: output.image,
        model: output.model,
        usage: output.usage,
        credits_remaining: entitlement.credits_remaining,
    }))
}
