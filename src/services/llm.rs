//! LLM completion service
//!
//! Thin client over the Anthropic messages API, used for three things:
//! - intent classification (one short completion)
//! - direct chat replies
//! - report synthesis in the research pipeline
//!
//! The service is stateless per request and shared by all sessions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::debug;

use crate::config::ArachneConfig;
use crate::error::{ArachneError, Result};

/// Configuration for the LLM service
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Anthropic API key
    pub api_key: String,

    /// Model to use (default: claude-3-5-haiku-20241022)
    pub model: String,

    /// Max tokens for responses
    pub max_tokens: usize,

    /// Temperature for sampling
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 4000,
            temperature: 0.1,
        }
    }
}

impl From<&ArachneConfig> for LlmConfig {
    fn from(config: &ArachneConfig) -> Self {
        Self {
            api_key: config.anthropic_api_key.clone(),
            model: config.model.clone(),
            ..Self::default()
        }
    }
}

/// LLM completion service
#[derive(Debug)]
pub struct LlmService {
    config: LlmConfig,
    client: reqwest::Client,
}

/// Anthropic API message format
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: usize,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

/// Anthropic API response format
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    text: String,
}

impl LlmService {
    /// Create a new LLM service with custom config
    pub fn new(config: LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ArachneError::Config(config::ConfigError::Message(
                "ANTHROPIC_API_KEY not set".to_string(),
            )));
        }

        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    /// Create with default config
    pub fn with_default() -> Result<Self> {
        Self::new(LlmConfig::default())
    }

    /// Run one completion and return the raw text.
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        self.call_api(prompt, self.config.max_tokens).await
    }

    /// Run one short completion, for cheap classification-style calls.
    pub async fn complete_short(&self, prompt: &str) -> Result<String> {
        self.call_api(prompt, 32).await
    }

    /// Make an API call to Claude
    async fn call_api(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        debug!(model = %self.config.model, "calling Anthropic API");

        let request = AnthropicRequest {
            model: self.config.model.clone(),
            max_tokens,
            temperature: self.config.temperature,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(ArachneError::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ArachneError::LlmApi(format!(
                "API request failed with status {}: {}",
                status, error_text
            )));
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ArachneError::LlmApi(format!("Failed to parse response: {}", e)))?;

        api_response
            .content
            .first()
            .map(|c| c.text.clone())
            .ok_or_else(|| ArachneError::LlmApi("Empty response from API".to_string()))
    }
}

/// Conversational collaborator: produces one reply for a chat message.
///
/// A seam for tests; the production implementation is [`LlmService`].
#[async_trait]
pub trait ChatResponder: Send + Sync {
    async fn reply(&self, message: &str) -> Result<String>;
}

#[async_trait]
impl ChatResponder for LlmService {
    async fn reply(&self, message: &str) -> Result<String> {
        let prompt = format!(
            "You are a helpful research assistant. Answer the user's message \
             directly and concisely. If the user seems to want web research, \
             suggest they ask you to research the topic.\n\nUser: {}",
            message
        );
        self.complete(&prompt).await
    }
}
