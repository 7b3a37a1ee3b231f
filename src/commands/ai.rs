//! `/ai` command: single-shot chat completion relay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::{CommandContext, CommandError, CommandHandler};
use crate::config::AiSection;
use crate::logging::targets;

pub const USAGE_NOTICE: &str = "🤖 Please provide a message after `/ai`.";
pub const FAILURE_NOTICE: &str = "⚠️ Failed to fetch AI response. Try again later.";
pub const NOT_CONFIGURED_NOTICE: &str = "🤖 AI replies are not configured on this bot.";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("invalid API key: {0}")]
    InvalidApiKey(String),

    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("response contained no completion text")]
    EmptyResponse,
}

/// Produces a completion for a single user prompt.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

/// OpenAI Chat Completions (non-streaming).
#[derive(Debug)]
pub struct OpenAiCompletionService {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompletionService {
    pub fn new(api_key: String) -> Result<Self, CompletionError> {
        if api_key.trim().is_empty() {
            return Err(CompletionError::InvalidApiKey(
                "API key must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CompletionError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: crate::config::DEFAULT_AI_MODEL.to_string(),
            max_tokens: crate::config::DEFAULT_AI_MAX_TOKENS,
            temperature: crate::config::DEFAULT_AI_TEMPERATURE,
        })
    }

    /// Build from config. `Ok(None)` when no API key is configured.
    pub fn from_config(section: &AiSection) -> Result<Option<Self>, CompletionError> {
        let Some(api_key) = section.api_key.clone() else {
            return Ok(None);
        };
        let mut service = Self::new(api_key)?
            .with_model(section.model.clone())
            .with_max_tokens(section.max_tokens)
            .with_temperature(section.temperature);
        if let Some(base_url) = &section.base_url {
            service = service.with_base_url(base_url.clone())?;
        }
        Ok(Some(service))
    }

    pub fn with_base_url(mut self, url: String) -> Result<Self, CompletionError> {
        let parsed = url::Url::parse(&url)
            .map_err(|e| CompletionError::InvalidBaseUrl(format!("invalid URL \"{url}\": {e}")))?;
        let host = parsed.host_str().unwrap_or("");
        let is_loopback =
            host == "localhost" || host == "127.0.0.1" || host == "::1" || host == "[::1]";
        if parsed.scheme() != "https" && !is_loopback {
            return Err(CompletionError::InvalidBaseUrl(format!(
                "base URL must use https scheme (or http for localhost), got \"{}\"",
                parsed.scheme()
            )));
        }
        self.base_url = url.trim_end_matches('/').to_string();
        Ok(self)
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletionService {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&self.build_body(prompt))
            .send()
            .await
            .map_err(|e| CompletionError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            return Err(CompletionError::Api { status, body });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Decode(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(CompletionError::EmptyResponse)
    }
}

/// Handler for `/ai <prompt>`.
pub struct AiCommand {
    service: Option<Arc<dyn CompletionService>>,
}

impl AiCommand {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self {
            service: Some(service),
        }
    }

    /// Replies with a notice instead of calling a service.
    pub fn unconfigured() -> Self {
        Self { service: None }
    }
}

#[async_trait]
impl CommandHandler for AiCommand {
    async fn handle(&self, ctx: &CommandContext, argument: &str) -> Result<(), CommandError> {
        if argument.is_empty() {
            return ctx.reply(USAGE_NOTICE).await;
        }
        let Some(service) = &self.service else {
            return ctx.reply(NOT_CONFIGURED_NOTICE).await;
        };

        info!(target: targets::ROUTER, from = %ctx.sender_id, "AI request");
        match service.complete(argument).await {
            Ok(text) => ctx.reply(&text).await,
            Err(e) => {
                error!(target: targets::ROUTER, from = %ctx.sender_id, "completion failed: {}", e);
                ctx.reply(FAILURE_NOTICE).await
            }
        }
    }
}
