//! OpenAI-compatible chat completions client (OpenRouter by default)

use super::{CallError, LanguageModel, ModelConfig, RetryPolicy};
use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Reusable chat completions client (connection-pooled)
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl OpenRouterClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry: config.retry.clone(),
        })
    }

    async fn complete_once(&self, request: &ChatRequest<'_>) -> std::result::Result<String, CallError> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| CallError::retryable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("status {}: {}", status, body);
            return Err(if is_retryable_status(status) {
                CallError::retryable(message)
            } else {
                CallError::fatal(message)
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CallError::fatal(format!("unreadable response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CallError::fatal("response contained no message content"))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl LanguageModel for OpenRouterClient {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn invoke(&self, system: &str, user: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(PipelineError::LlmError(
                "OPENROUTER_API_KEY not configured".to_string(),
            ));
        }

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        debug!(model = %self.model, "Calling chat completions");
        let answer = self
            .retry
            .run("chat completion", || self.complete_once(&request))
            .await?;
        info!(chars = answer.len(), "Model reply received");

        Ok(answer)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}
