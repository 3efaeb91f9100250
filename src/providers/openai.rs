//! OpenAI-compatible chat-completions adapter
//!
//! Speaks the `POST {base_url}/chat/completions` wire format, which most
//! hosted and self-hosted completion backends expose.

use super::{Generation, ModelProvider, TokenUsage};
use crate::types::Message;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Errors that can occur when calling a chat-completions endpoint.
#[derive(Error, Debug)]
pub enum OpenAiError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Response contained no choices")]
    EmptyResponse,
}

/// Configuration for [`OpenAiCompatProvider`].
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API key sent as a bearer token.
    pub api_key: String,

    /// Model identifier requested from the backend.
    pub model: String,

    /// Base URL (default: api.openai.com/v1).
    pub base_url: Option<String>,

    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
            timeout_seconds: 600,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: String,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Adapter for OpenAI-compatible chat-completions backends.
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    client: Client,
    config: Arc<OpenAiConfig>,
}

impl OpenAiCompatProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, OpenAiError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(OPENAI_API_BASE)
    }

    async fn chat(&self, messages: &[Message]) -> Result<Generation, OpenAiError> {
        let url = format!("{}/chat/completions", self.base_url());
        let request = ChatRequest {
            model: &self.config.model,
            messages: messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role.to_string(),
                    content: &message.content,
                })
                .collect(),
        };

        tracing::debug!(
            model = %self.config.model,
            messages = messages.len(),
            "Calling chat completions endpoint"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OpenAiError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(OpenAiError::EmptyResponse)?;

        Ok(Generation {
            text,
            usage: parsed.usage.map(|usage| TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            }),
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, messages: &[Message]) -> anyhow::Result<Generation> {
        Ok(self.chat(messages).await?)
    }
}
