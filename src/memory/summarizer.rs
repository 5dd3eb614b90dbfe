//! Context Summarization
//!
//! Folds a user's stored turns into one running summary once the
//! stored history grows past the compaction threshold.

use super::context_manager::format_transcript;
use super::store::ConversationMemory;
use crate::error::PipelineError;
use crate::llm::LanguageModel;
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};

const SUMMARY_PROMPT: &str = r#"You are a conversation summarizer for a cricket statistics assistant.

Merge the existing summary and the conversation below into ONE concise paragraph.
Keep every player name, format (Test, ODI, T20) and key figure that was mentioned.
Do not use bullet points or headings.

Respond with the summary paragraph only."#;

pub struct ContextSummarizer {
    model: Arc<dyn LanguageModel>,
}

impl ContextSummarizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Summarize a transcript on top of the existing summary (if any)
    pub async fn summarize(&self, existing: Option<&str>, transcript: &str) -> Result<String> {
        if transcript.trim().is_empty() {
            return Err(PipelineError::MemoryDegraded(
                "Cannot summarize an empty conversation".to_string(),
            ));
        }

        let existing = existing.filter(|s| !s.trim().is_empty()).unwrap_or("None");
        let input = format!(
            "EXISTING SUMMARY:\n{}\n\nCONVERSATION:\n---\n{}---",
            existing, transcript
        );

        match self.model.invoke(SUMMARY_PROMPT, &input).await {
            Ok(summary) => Ok(summary.trim().to_string()),
            Err(e) => {
                warn!("Failed to summarize context: {}", e);
                Err(e)
            }
        }
    }

    /// Summarize every stored turn of the user, overwrite their summary and
    /// keep only the `keep` most recent turns. Returns the number of turns pruned.
    pub async fn compact(&self, memory: &ConversationMemory, user_id: &str, keep: usize) -> Result<u64> {
        let turns = memory.user_turns(user_id).await?;
        let existing = memory.summary(user_id).await?.map(|s| s.summary);

        info!(user_id, turns = turns.len(), "Compacting conversation memory");

        let summary = self
            .summarize(existing.as_deref(), &format_transcript(&turns))
            .await?;
        memory.save_summary(user_id, &summary).await?;

        let pruned = memory.prune_user_turns(user_id, keep).await?;
        info!(user_id, pruned, "Compaction complete");
        Ok(pruned)
    }
}
