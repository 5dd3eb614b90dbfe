//! Runtime configuration from environment variables
//!
//! Binaries call `dotenv::dotenv()` first, then `AppConfig::from_env()`.

use crate::error::PipelineError;
use crate::llm::{gemini, openrouter, ModelConfig, ModelProvider, RetryPolicy};
use crate::memory::ContextConfig;
use crate::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: ModelConfig,
    /// `None` selects the in-memory document store.
    pub database_url: Option<String>,
    pub port: u16,
    pub snapshot_delay: Duration,
    pub seed_dir: Option<PathBuf>,
    pub context: ContextConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let provider = match get("LLM_PROVIDER").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("openrouter") | Some("openai") => ModelProvider::OpenRouter,
            Some("gemini") => ModelProvider::Gemini,
            Some(other) => {
                return Err(PipelineError::Config(format!(
                    "LLM_PROVIDER must be 'openrouter' or 'gemini', got '{}'",
                    other
                )))
            }
        };

        let (api_key, model, base_url) = match provider {
            ModelProvider::OpenRouter => (
                get("OPENROUTER_API_KEY").or_else(|| get("OPENAI_API_KEY")),
                get("OPENROUTER_MODEL").unwrap_or_else(|| openrouter::DEFAULT_MODEL.to_string()),
                get("LLM_BASE_URL").unwrap_or_else(|| openrouter::DEFAULT_BASE_URL.to_string()),
            ),
            ModelProvider::Gemini => (
                get("GEMINI_API_KEY"),
                get("GEMINI_MODEL").unwrap_or_else(|| gemini::DEFAULT_MODEL.to_string()),
                get("LLM_BASE_URL").unwrap_or_else(|| gemini::DEFAULT_BASE_URL.to_string()),
            ),
        };

        let retry = RetryPolicy {
            max_retries: parse_or(get("LLM_MAX_RETRIES"), "LLM_MAX_RETRIES", 5)?,
            ..RetryPolicy::default()
        };

        let model = ModelConfig {
            provider,
            api_key: api_key.unwrap_or_default(),
            model,
            base_url,
            max_tokens: parse_or(get("LLM_MAX_TOKENS"), "LLM_MAX_TOKENS", 1000)?,
            timeout: Duration::from_secs(parse_or(get("LLM_TIMEOUT_SECS"), "LLM_TIMEOUT_SECS", 60)?),
            retry,
            ..ModelConfig::default()
        };

        let port = match get("PORT") {
            Some(v) => parse_or(Some(v), "PORT", DEFAULT_PORT)?,
            None => parse_or(get("API_PORT"), "API_PORT", DEFAULT_PORT)?,
        };

        let defaults = ContextConfig::default();
        let context = ContextConfig {
            history_window: parse_or(get("HISTORY_WINDOW"), "HISTORY_WINDOW", defaults.history_window)?,
            compaction_threshold: parse_or(
                get("COMPACTION_THRESHOLD"),
                "COMPACTION_THRESHOLD",
                defaults.compaction_threshold,
            )?,
            keep_after_compaction: parse_or(
                get("KEEP_AFTER_COMPACTION"),
                "KEEP_AFTER_COMPACTION",
                defaults.keep_after_compaction,
            )?,
        };
        if context.keep_after_compaction as u64 >= context.compaction_threshold {
            return Err(PipelineError::Config(format!(
                "KEEP_AFTER_COMPACTION ({}) must be below COMPACTION_THRESHOLD ({})",
                context.keep_after_compaction, context.compaction_threshold
            )));
        }

        Ok(Self {
            model,
            database_url: get("POSTGRES_URL").or_else(|| get("DATABASE_URL")),
            port,
            snapshot_delay: Duration::from_millis(parse_or(get("SNAPSHOT_DELAY_MS"), "SNAPSHOT_DELAY_MS", 0)?),
            seed_dir: get("SEED_DIR").map(PathBuf::from),
            context,
        })
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| PipelineError::Config(format!("{} has an invalid value '{}'", key, v))),
    }
}
