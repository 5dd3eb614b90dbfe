//! Relevancy Checker
//!
//! Classifies a question as a greeting and/or a cricket-stats question:
//! - Greeting: "Hi", "Hello there" → friendly reply, no retrieval
//! - On-topic: players, matches, records → query pipeline
//! - Off-topic: everything else → canned refusal

use crate::agent::{Step, StepOutput};
use crate::llm::{parse_json_reply, LanguageModel};
use crate::models::{SessionState, StateUpdate};
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

pub const STEP_NAME: &str = "Relevancy Checker";

const CLASSIFIER_PROMPT: &str = r#"You are a cricket expert AI. Check if the user's question is:
1. A greeting (Hi, Hello, etc.)
2. About cricket stats, players, or matches.

Respond with ONLY a JSON object: {"isCricketRelated": true/false, "isGreeting": true/false, "reason": "short explanation"}"#;

/// Parsed classifier reply. Missing flags read as `false`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Classification {
    #[serde(rename = "isCricketRelated", alias = "isOnTopic", default)]
    pub is_on_topic: bool,
    #[serde(rename = "isGreeting", default)]
    pub is_greeting: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

pub struct RelevancyChecker {
    model: Arc<dyn LanguageModel>,
}

impl RelevancyChecker {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    pub async fn classify(&self, question: &str) -> Result<Classification> {
        let reply = self.model.invoke(CLASSIFIER_PROMPT, question).await?;
        let classification: Classification = parse_json_reply(&reply)?;

        debug!(reason = ?classification.reason, "Classifier rationale");
        Ok(classification)
    }
}

#[async_trait]
impl Step for RelevancyChecker {
    fn name(&self) -> &'static str {
        STEP_NAME
    }

    async fn run(&self, state: &SessionState) -> Result<StepOutput> {
        info!("Node: Relevancy Checker");
        let c = self.classify(&state.question).await?;
        info!(
            is_greeting = c.is_greeting,
            is_on_topic = c.is_on_topic,
            "Question classified"
        );

        Ok(StepOutput::new(
            StateUpdate {
                is_on_topic: Some(c.is_on_topic),
                is_greeting: Some(c.is_greeting),
                ..Default::default()
            },
            STEP_NAME,
        ))
    }
}
