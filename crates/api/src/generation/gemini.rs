//! Gemini `generateContent` client

use std::time::Duration;

use async_trait::async_trait;
use atasura_shared::GenerationAction;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{
    GeneratedImage, GenerationError, GenerationOutput, GenerationRequest, GenerationService,
    TokenUsage,
};
use crate::config::GeminiConfig;

/// Total attempts per call, including the first
const MAX_ATTEMPTS: usize = 3;

pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
    backoff_base_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i32,
    #[serde(default)]
    candidates_token_count: i32,
    #[serde(default)]
    total_token_count: i32,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GenerationError::Unavailable(format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            config,
            backoff_base_ms: 500,
        })
    }

    /// Shorten retry delays, for tests against a local mock
    pub fn with_backoff_base_ms(mut self, base_ms: u64) -> Self {
        self.backoff_base_ms = base_ms.max(1);
        self
    }

    fn request_body(action: GenerationAction, prompt: &str) -> Value {
        let mut body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }]
        });
        if action == GenerationAction::ImageGeneration {
            body["generationConfig"] = json!({ "responseModalities": ["TEXT", "IMAGE"] });
        }
        body
    }

    async fn call_once(&self, model: &str, body: &Value) -> Result<GenerationOutput, GenerationError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout
                } else {
                    GenerationError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(GenerationError::Unavailable(format!("Gemini returned {status}")));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateContentResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout
            } else {
                GenerationError::InvalidResponse(e.to_string())
            }
        })?;

        parse_output(parsed, model)
    }
}

fn parse_output(
    response: GenerateContentResponse,
    model: &str,
) -> Result<GenerationOutput, GenerationError> {
    let parts = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .unwrap_or_default();

    let mut text = String::new();
    let mut image = None;
    for part in parts {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(data) = part.inline_data {
            image.get_or_insert(GeneratedImage {
                mime_type: data.mime_type,
                data: data.data,
            });
        }
    }

    if text.is_empty() && image.is_none() {
        return Err(GenerationError::InvalidResponse(
            "response contained no content".to_string(),
        ));
    }

    let usage = response.usage_metadata.unwrap_or_default();
    Ok(GenerationOutput {
        text,
        image,
        model: model.to_string(),
        usage: TokenUsage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        },
    })
}

#[async_trait]
impl GenerationService for GeminiClient {
    fn default_model(&self, action: GenerationAction) -> String {
        match action {
            GenerationAction::ImageGeneration => self.config.image_model.clone(),
            _ => self.config.text_model.clone(),
        }
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationOutput, GenerationError> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model(request.action));
        let body = Self::request_body(request.action, &request.prompt);

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.backoff_base_ms / 2)
            .max_delay(Duration::from_secs(8))
            .map(jitter)
            .take(MAX_ATTEMPTS - 1);

        RetryIf::spawn(
            strategy,
            || async {
                let result = self.call_once(&model, &body).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        action = request.action.as_str(),
                        model = %model,
                        error = %e,
                        "Gemini call failed"
                    );
                }
                result
            },
            GenerationError::is_transient,
        )
        .await
    }
}
