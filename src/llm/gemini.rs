//! Gemini API client
//!
//! Alternative model backend using Google's generateContent endpoint.
//! Uses a long-lived reqwest::Client for connection pooling.

use super::{CallError, LanguageModel, ModelConfig, RetryPolicy};
use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl GeminiClient {
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

    async fn generate_once(&self, request: &GeminiRequest) -> std::result::Result<String, CallError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                CallError::retryable(format!("Gemini API error: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            let message = format!("Gemini API error ({}): {}", status, error_text);
            return Err(if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                CallError::retryable(message)
            } else {
                CallError::fatal(message)
            });
        }

        let gemini_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| CallError::fatal(format!("Gemini parse error: {}", e)))?;

        gemini_response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| CallError::fatal("Empty response from Gemini"))
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn invoke(&self, system: &str, user: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(PipelineError::LlmError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: user.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_tokens,
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: system.to_string(),
                }],
            },
        };

        info!("Calling Gemini API");
        self.retry
            .run("Gemini generateContent", || self.generate_once(&request))
            .await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: Content,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_serialization() {
        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: "Who has the most Test runs?".to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: 1000,
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: "You are a cricket stats presenter".to_string(),
                }],
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 1000);
        assert!(json["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("cricket"));
    }

    #[tokio::test]
    async fn test_invoke_reads_first_candidate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-2.0-flash:generateContent"))
            .and(query_param("key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": "Namaste!"}]}, "finishReason": "STOP"}]
            })))
            .mount(&server)
            .await;

        let client = GeminiClient::new(&ModelConfig {
            api_key: "k".to_string(),
            base_url: server.uri(),
            model: DEFAULT_MODEL.to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(client.invoke("greet", "hi").await.unwrap(), "Namaste!");
    }
}
