//! Server configuration

use std::time::Duration;

use anyhow::Context;

/// Gemini model and endpoint settings
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub text_model: String,
    pub image_model: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    pub fn from_env() -> anyhow::Result<Self> {
        let timeout_secs = match std::env::var("GENERATION_TIMEOUT_SECS") {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .context("GENERATION_TIMEOUT_SECS must be a number of seconds")?,
            Err(_) => 60,
        };

        Ok(Self {
            api_key: std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY must be set")?,
            base_url: std::env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| Self::DEFAULT_BASE_URL.to_string()),
            text_model: std::env::var("GEMINI_TEXT_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            image_model: std::env::var("GEMINI_IMAGE_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash-preview-image-generation".to_string()),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub supabase_jwt_secret: String,
    pub allowed_origins: Vec<String>,
    pub gemini: GeminiConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            supabase_jwt_secret: std::env::var("SUPABASE_JWT_SECRET")
                .context("SUPABASE_JWT_SECRET must be set")?,
            allowed_origins,
            gemini: GeminiConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_gemini_defaults() {
        std::env::set_var("GEMINI_API_KEY", "test-key");
        std::env::remove_var("GENERATION_TIMEOUT_SECS");
        std::env::remove_var("GEMINI_BASE_URL");

        let config = GeminiConfig::from_env().unwrap();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.base_url, GeminiConfig::DEFAULT_BASE_URL);
    }

    #[test]
    #[serial]
    fn test_invalid_timeout_rejected() {
        std::env::set_var("GEMINI_API_KEY", "test-key");
        std::env::set_var("GENERATION_TIMEOUT_SECS", "soon");
        assert!(GeminiConfig::from_env().is_err());
        std::env::remove_var("GENERATION_TIMEOUT_SECS");
    }
}
