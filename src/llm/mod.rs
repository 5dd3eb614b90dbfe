//! Language model collaborator
//!
//! Every model-backed step talks to a `LanguageModel`: one system
//! instruction plus one user text in, raw reply text out. Clients are built
//! once at startup and shared across runs; they hold configuration only.

use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub mod gemini;
pub mod mock;
pub mod openrouter;

pub use gemini::GeminiClient;
pub use mock::ScriptedModel;
pub use openrouter::OpenRouterClient;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, system: &str, user: &str) -> Result<String>;
}

//
// ================= Configuration =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelProvider {
    OpenRouter,
    Gemini,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::OpenRouter,
            api_key: String::new(),
            model: openrouter::DEFAULT_MODEL.to_string(),
            base_url: openrouter::DEFAULT_BASE_URL.to_string(),
            temperature: 0.0,
            max_tokens: 1000,
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Build the configured client.
pub fn build_model(config: &ModelConfig) -> Result<Arc<dyn LanguageModel>> {
    if config.api_key.is_empty() {
        warn!("Model API key not configured; model calls will fail until one is set");
    }

    let model: Arc<dyn LanguageModel> = match config.provider {
        ModelProvider::OpenRouter => Arc::new(OpenRouterClient::new(config)?),
        ModelProvider::Gemini => Arc::new(GeminiClient::new(config)?),
    };

    info!(provider = model.name(), model = %config.model, "Language model client ready");
    Ok(model)
}

//
// ================= Retries =================
//

/// Outcome of one failed attempt.
#[derive(Debug)]
pub struct CallError {
    pub message: String,
    pub retryable: bool,
}

impl CallError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Bounded exponential backoff. `max_retries` counts retries after the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.retryable && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed, retrying: {}",
                        label,
                        e.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(PipelineError::LlmError(format!(
                        "{} failed after {} attempt(s): {}",
                        label,
                        attempt + 1,
                        e.message
                    )))
                }
            }
        }
    }
}

//
// ================= Reply Parsing =================
//

/// Parse a model reply as JSON, tolerating markdown code fences and
/// chatter around a single top-level object.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T> {
    let cleaned = text.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();

    if let Ok(value) = serde_json::from_str(cleaned) {
        return Ok(value);
    }

    let sliced = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => cleaned,
    };

    serde_json::from_str(sliced).map_err(|e| {
        let snippet: String = text.chars().take(200).collect();
        PipelineError::MalformedModelOutput(format!("{} (reply: {})", e, snippet))
    })
}
