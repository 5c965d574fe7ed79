//! Generation gateway
//!
//! The model call itself is opaque to billing: callers hand over a finished
//! prompt and get text (or an image) back with token counts. Entitlement
//! checks and token logging live in the `/generate` routes.

mod gemini;

pub use gemini::GeminiClient;

use async_trait::async_trait;
use atasura_shared::GenerationAction;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub action: GenerationAction,
    /// Overrides the service's default model for this action
    pub model: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub mime_type: String,
    /// Base64 payload as returned by the model
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub text: String,
    pub image: Option<GeneratedImage>,
    pub model: String,
    pub usage: TokenUsage,
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Generation timed out")]
    Timeout,

    /// Rate limited, 5xx, or connection failure
    #[error("Generation service unavailable: {0}")]
    Unavailable(String),

    #[error("Generation request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid generation response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, GenerationError::Timeout | GenerationError::Unavailable(_))
    }
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Model used for `action` when the request does not name one
    fn default_model(&self, action: GenerationAction) -> String;

    async fn generate(&self, request: GenerationRequest)
        -> Result<GenerationOutput, GenerationError>;
}
