//! Answer Formatter
//!
//! Produces the user-facing answer. Refusals and empty results use fixed
//! text; greetings and found records go through the model.

use crate::agent::{Step, StepOutput};
use crate::error::PipelineError;
use crate::llm::LanguageModel;
use crate::models::{SessionState, StateUpdate};
use crate::store::Document;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

pub const STEP_NAME: &str = "Answer Formatter";
pub const CANNED_STEP_NAME: &str = "Final Response";

pub const REFUSAL: &str = "Sorry, I can only answer cricket-related questions.";
pub const NO_DATA: &str = "I couldn't find any data for that specific request in my database.";

const GREETING_PROMPT: &str = "You are a friendly cricket stats assistant. The user just greeted you. \
Greet them back politely and ask how you can help with cricket stats. Keep it short.";

fn single_record_prompt(record: &Document) -> String {
    format!(
        r#"You are a cricket stats presenter. The search returned only ONE player.
Write one natural, friendly paragraph of plain text that covers every stat in the data below (Runs, Avg, SR, etc.).
Do NOT use lists or tables, and do NOT mention any list or table.
Player names in the data might have country suffixes like '(INDIA)' or '(PAK)'. Leave those out of your answer.
Data: {}"#,
        serde_json::Value::Object(record.clone())
    )
}

fn many_records_prompt(records: &[Document]) -> String {
    format!(
        r#"You are a cricket stats presenter. The search returned {} players.
Reply with ONE very brief sentence saying how many players were found for the question.
Do NOT name or describe individual players; the full table is shown separately.
Data: {}"#,
        records.len(),
        serde_json::Value::Array(
            records
                .iter()
                .cloned()
                .map(serde_json::Value::Object)
                .collect()
        )
    )
}

pub struct AnswerFormatter {
    model: Arc<dyn LanguageModel>,
}

impl AnswerFormatter {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    async fn generate(&self, system: &str, question: &str) -> Result<String> {
        self.model
            .invoke(system, question)
            .await
            .map(|answer| answer.trim().to_string())
            .map_err(|e| {
                error!("Answer generation failed: {}", e);
                PipelineError::GenerationFailure(e.to_string())
            })
    }

    /// Pick the answer branch. Returns `(answer, label)`.
    pub async fn render(&self, state: &SessionState) -> Result<(String, &'static str)> {
        if state.is_greeting {
            let answer = self.generate(GREETING_PROMPT, &state.question).await?;
            return Ok((answer, STEP_NAME));
        }

        if !state.is_on_topic {
            return Ok((REFUSAL.to_string(), CANNED_STEP_NAME));
        }

        match state.retrieved_records.as_slice() {
            [] => Ok((NO_DATA.to_string(), CANNED_STEP_NAME)),
            [record] => {
                let answer = self
                    .generate(&single_record_prompt(record), &state.question)
                    .await?;
                Ok((answer, STEP_NAME))
            }
            records => {
                let answer = self
                    .generate(&many_records_prompt(records), &state.question)
                    .await?;
                Ok((answer, STEP_NAME))
            }
        }
    }
}

#[async_trait]
impl Step for AnswerFormatter {
    fn name(&self) -> &'static str {
        STEP_NAME
    }

    async fn run(&self, state: &SessionState) -> Result<StepOutput> {
        info!(
            records = state.retrieved_records.len(),
            "Node: Answer Formatter"
        );
        let (answer, label) = self.render(state).await?;

        Ok(StepOutput::new(
            StateUpdate {
                answer_text: Some(answer),
                ..Default::default()
            },
            label,
        ))
    }
}
