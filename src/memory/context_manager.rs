//! Memory window management
//!
//! Decides how much history reaches the model and when a user's stored
//! turns must be summarized and pruned.

use crate::models::ConversationTurn;
use tracing::info;

/// Configuration for memory retention
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Recent turns of the current session shown to the query synthesizer
    pub history_window: usize,
    /// Stored turns per user that trigger summarization & compaction
    pub compaction_threshold: u64,
    /// Most recent turns kept after compaction
    pub keep_after_compaction: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            history_window: 10,
            compaction_threshold: 10,
            keep_after_compaction: 3,
        }
    }
}

pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            config: ContextConfig::default(),
        }
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Check if a user's stored turn count calls for compaction
    pub fn should_compact(&self, stored_turns: u64) -> bool {
        let should = stored_turns >= self.config.compaction_threshold;

        if should {
            info!(
                "User has {} stored turns (threshold: {}). Compaction needed.",
                stored_turns, self.config.compaction_threshold
            );
        }

        should
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Render turns oldest-first as alternating `User:` / `Assistant:` lines.
pub fn format_transcript(turns: &[ConversationTurn]) -> String {
    let mut text = String::new();

    for turn in turns {
        text.push_str(&format!("User: {}\n", turn.question));
        text.push_str(&format!("Assistant: {}\n", turn.answer));
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(q: &str, a: &str) -> ConversationTurn {
        ConversationTurn {
            id: None,
            user_id: "u".into(),
            session_id: "s".into(),
            question: q.into(),
            answer: a.into(),
            records: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let manager = ContextManager::new();
        assert!(!manager.should_compact(9));
        assert!(manager.should_compact(10));
        assert!(manager.should_compact(11));
    }

    #[test]
    fn test_format_transcript() {
        let text = format_transcript(&[
            turn("Kohli ODI runs?", "13,848."),
            turn("And Tests?", "8,848."),
        ]);
        assert_eq!(
            text,
            "User: Kohli ODI runs?\nAssistant: 13,848.\nUser: And Tests?\nAssistant: 8,848.\n"
        );
        assert!(format_transcript(&[]).is_empty());
    }
}
