//! Conversation memory
//!
//! Two pipeline steps sit on top of the document store:
//! - `MemoryRetriever` loads the user's running summary and recent session turns
//! - `MemoryWriter` records the finished turn and compacts old history
//!
//! Neither step ever aborts a run. Store or model failures degrade to an
//! empty memory (or a skipped write) with a `(Failed)` label.

pub mod context_manager;
pub mod store;
pub mod summarizer;

pub use context_manager::{format_transcript, ContextConfig, ContextManager};
pub use store::ConversationMemory;
pub use summarizer::ContextSummarizer;

use crate::agent::{Step, StepOutput};
use crate::error::PipelineError;
use crate::llm::LanguageModel;
use crate::models::{ConversationTurn, MemoryContext, SessionState, StateUpdate};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub const RETRIEVER_STEP: &str = "Memory Retriever";
pub const WRITER_STEP: &str = "Memory Writer";

fn failed(step: &str) -> String {
    format!("{} (Failed)", step)
}

pub struct MemoryRetriever {
    memory: Arc<ConversationMemory>,
}

impl MemoryRetriever {
    pub fn new(memory: Arc<ConversationMemory>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Step for MemoryRetriever {
    fn name(&self) -> &'static str {
        RETRIEVER_STEP
    }

    /// Turns are stored under a user, so an anonymous run has nothing to recall.
    fn should_run(&self, state: &SessionState) -> bool {
        state.user_id.is_some()
    }

    async fn run(&self, state: &SessionState) -> Result<StepOutput> {
        let Some(user_id) = state.user_id.as_deref() else {
            return Ok(StepOutput::skipped(RETRIEVER_STEP));
        };
        info!(user_id, session_id = %state.session_id, "Node: Memory Retriever");

        match self.memory.load_context(user_id, &state.session_id).await {
            Ok(context) => Ok(StepOutput::new(
                StateUpdate {
                    memory: Some(context),
                    ..Default::default()
                },
                RETRIEVER_STEP,
            )),
            Err(e) => {
                let degraded = PipelineError::MemoryDegraded(e.to_string());
                warn!(user_id, "{}", degraded);
                Ok(StepOutput::new(
                    StateUpdate {
                        memory: Some(MemoryContext::default()),
                        ..Default::default()
                    },
                    failed(RETRIEVER_STEP),
                ))
            }
        }
    }
}

pub struct MemoryWriter {
    memory: Arc<ConversationMemory>,
    summarizer: ContextSummarizer,
    manager: ContextManager,
}

impl MemoryWriter {
    pub fn new(memory: Arc<ConversationMemory>, model: Arc<dyn LanguageModel>) -> Self {
        Self::with_manager(memory, model, ContextManager::new())
    }

    pub fn with_manager(
        memory: Arc<ConversationMemory>,
        model: Arc<dyn LanguageModel>,
        manager: ContextManager,
    ) -> Self {
        Self {
            memory,
            summarizer: ContextSummarizer::new(model),
            manager,
        }
    }

    /// Persist one turn, then compact the user's history if it has grown too long.
    /// Returns whether compaction ran.
    async fn write(&self, user_id: &str, state: &SessionState, answer: &str) -> Result<bool> {
        let turn = ConversationTurn {
            id: None,
            user_id: user_id.to_string(),
            session_id: state.session_id.clone(),
            question: state.question.clone(),
            answer: answer.to_string(),
            records: (!state.retrieved_records.is_empty()).then(|| state.retrieved_records.clone()),
            created_at: Utc::now(),
        };
        self.memory.record_turn(&turn).await?;

        let stored = self.memory.count_user_turns(user_id).await?;
        if !self.manager.should_compact(stored) {
            return Ok(false);
        }

        let keep = self.manager.config().keep_after_compaction;
        self.summarizer.compact(&self.memory, user_id, keep).await?;
        Ok(true)
    }
}

#[async_trait]
impl Step for MemoryWriter {
    fn name(&self) -> &'static str {
        WRITER_STEP
    }

    fn should_run(&self, state: &SessionState) -> bool {
        state.user_id.is_some() && state.answer_text.is_some()
    }

    async fn run(&self, state: &SessionState) -> Result<StepOutput> {
        let (Some(user_id), Some(answer)) = (state.user_id.as_deref(), state.answer_text.as_deref())
        else {
            return Ok(StepOutput::skipped(WRITER_STEP));
        };
        info!(user_id, session_id = %state.session_id, "Node: Memory Writer");

        match self.write(user_id, state, answer).await {
            Ok(compacted) => {
                info!(user_id, compacted, "Turn recorded");
                Ok(StepOutput::new(StateUpdate::default(), WRITER_STEP))
            }
            Err(e) => {
                let degraded = PipelineError::MemoryDegraded(e.to_string());
                warn!(user_id, "{}", degraded);
                Ok(StepOutput::new(StateUpdate::default(), failed(WRITER_STEP)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::store::{Document, DocumentStore, FindQuery, InMemoryDocumentStore};
    use serde_json::{json, Value};

    /// Store whose every operation fails.
    struct BrokenStore;

    #[async_trait]
    impl DocumentStore for BrokenStore {
        async fn find_one(&self, _: &str, _: &Value) -> Result<Option<Document>> {
            Err(PipelineError::DatabaseError("connection refused".into()))
        }
        async fn find(&self, _: &str, _: &FindQuery) -> Result<Vec<Document>> {
            Err(PipelineError::DatabaseError("connection refused".into()))
        }
        async fn count(&self, _: &str, _: &Value) -> Result<u64> {
            Err(PipelineError::DatabaseError("connection refused".into()))
        }
        async fn insert_one(&self, _: &str, _: Document) -> Result<String> {
            Err(PipelineError::DatabaseError("connection refused".into()))
        }
        async fn upsert_one(&self, _: &str, _: &Value, _: Document) -> Result<()> {
            Err(PipelineError::DatabaseError("connection refused".into()))
        }
        async fn delete_many(&self, _: &str, _: &Value) -> Result<u64> {
            Err(PipelineError::DatabaseError("connection refused".into()))
        }
    }

    fn answered(user: Option<&str>, question: &str) -> SessionState {
        answered_in(user, "s1", question)
    }

    fn answered_in(user: Option<&str>, session: &str, question: &str) -> SessionState {
        let mut state = SessionState::new(question.into(), user.map(Into::into), session.into());
        state.answer_text = Some(format!("answer to {}", question));
        state
    }

    fn questions(turns: Vec<ConversationTurn>) -> Vec<String> {
        turns.into_iter().map(|t| t.question).collect()
    }

    fn memory() -> Arc<ConversationMemory> {
        Arc::new(ConversationMemory::new(Arc::new(InMemoryDocumentStore::new()), 10))
    }

    #[tokio::test]
    async fn test_retriever_preconditions() {
        let retriever = MemoryRetriever::new(memory());
        assert!(!retriever.should_run(&SessionState::new("q".into(), None, "s".into())));
        assert!(retriever.should_run(&SessionState::new("q".into(), Some("u".into()), "s".into())));
    }

    #[tokio::test]
    async fn test_session_turns_stay_with_their_user() {
        let memory = memory();
        let writer = MemoryWriter::new(memory.clone(), Arc::new(ScriptedModel::default()));
        writer.run(&answered(Some("u1"), "Kohli?")).await.unwrap();

        let retriever = MemoryRetriever::new(memory);
        let anonymous = SessionState::new("And Tests?".into(), None, "s1".into());
        assert!(!retriever.should_run(&anonymous));

        let other_user = SessionState::new("And Tests?".into(), Some("u2".into()), "s1".into());
        let out = retriever.run(&other_user).await.unwrap();
        assert_eq!(out.update.memory, Some(MemoryContext::default()));

        let owner = SessionState::new("And Tests?".into(), Some("u1".into()), "s1".into());
        let out = retriever.run(&owner).await.unwrap();
        assert_eq!(
            out.update.memory.unwrap().history,
            "User: Kohli?\nAssistant: answer to Kohli?\n"
        );
    }

    #[tokio::test]
    async fn test_retriever_degrades_on_store_failure() {
        let memory = Arc::new(ConversationMemory::new(Arc::new(BrokenStore), 10));
        let retriever = MemoryRetriever::new(memory);

        let out = retriever.run(&answered(Some("u1"), "q")).await.unwrap();
        assert_eq!(out.label, "Memory Retriever (Failed)");
        assert_eq!(out.update.memory, Some(MemoryContext::default()));
    }

    #[tokio::test]
    async fn test_writer_preconditions() {
        let writer = MemoryWriter::new(memory(), Arc::new(ScriptedModel::default()));
        assert!(!writer.should_run(&answered(None, "q")));
        assert!(!writer.should_run(&SessionState::new("q".into(), Some("u".into()), "s".into())));
        assert!(writer.should_run(&answered(Some("u"), "q")));
    }

    #[tokio::test]
    async fn test_writer_degrades_on_store_failure() {
        let memory = Arc::new(ConversationMemory::new(Arc::new(BrokenStore), 10));
        let writer = MemoryWriter::new(memory, Arc::new(ScriptedModel::default()));

        let out = writer.run(&answered(Some("u1"), "q")).await.unwrap();
        assert_eq!(out.label, "Memory Writer (Failed)");
    }

    #[tokio::test]
    async fn test_writer_records_records_snapshot() {
        let memory = memory();
        let writer = MemoryWriter::new(memory.clone(), Arc::new(ScriptedModel::default()));

        let mut state = answered(Some("u1"), "Kohli?");
        let record = json!({"Player": "V Kohli (INDIA)", "Runs": 13848});
        state.retrieved_records = vec![record.as_object().cloned().unwrap()];

        let out = writer.run(&state).await.unwrap();
        assert_eq!(out.label, WRITER_STEP);

        let history = memory.session_history("u1", "s1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].answer, "answer to Kohli?");
        assert_eq!(history[0].records.as_ref().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_no_compaction_below_threshold() {
        let memory = memory();
        let model = Arc::new(ScriptedModel::default());
        let writer = MemoryWriter::new(memory.clone(), model.clone());

        for n in 0..4 {
            writer.run(&answered(Some("u1"), &format!("Q{}", n))).await.unwrap();
        }

        assert_eq!(model.call_count(), 0);
        assert_eq!(memory.count_user_turns("u1").await.unwrap(), 4);
        assert!(memory.summary("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compaction_at_threshold_keeps_three_most_recent() {
        let memory = memory();
        let model = Arc::new(ScriptedModel::new(["User asked ten questions."]));
        let writer = MemoryWriter::new(memory.clone(), model.clone());

        for n in 0..9 {
            writer.run(&answered(Some("u1"), &format!("Q{}", n))).await.unwrap();
        }
        assert_eq!(model.call_count(), 0);

        let out = writer.run(&answered(Some("u1"), "Q9")).await.unwrap();
        assert_eq!(out.label, WRITER_STEP);
        assert_eq!(model.call_count(), 1);

        let left: Vec<_> = memory
            .user_turns("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.question)
            .collect();
        assert_eq!(left, vec!["Q7", "Q8", "Q9"]);
        assert_eq!(
            memory.summary("u1").await.unwrap().unwrap().summary,
            "User asked ten questions."
        );
    }

    #[tokio::test]
    async fn test_compaction_counts_and_prunes_across_sessions() {
        let memory = memory();
        let model = Arc::new(ScriptedModel::new(["User asked across two sessions."]));
        let writer = MemoryWriter::new(memory.clone(), model.clone());

        let plan = [
            ("s1", "Q0"),
            ("s1", "Q1"),
            ("s1", "Q2"),
            ("s1", "Q3"),
            ("s2", "Q4"),
            ("s2", "Q5"),
            ("s1", "Q6"),
            ("s2", "Q7"),
            ("s1", "Q8"),
        ];
        for (session, question) in plan {
            writer.run(&answered_in(Some("u1"), session, question)).await.unwrap();
        }
        assert_eq!(model.call_count(), 0);

        let out = writer.run(&answered_in(Some("u1"), "s2", "Q9")).await.unwrap();
        assert_eq!(out.label, WRITER_STEP);
        assert_eq!(model.call_count(), 1);

        assert_eq!(questions(memory.user_turns("u1").await.unwrap()), vec!["Q7", "Q8", "Q9"]);
        assert_eq!(questions(memory.session_history("u1", "s1").await.unwrap()), vec!["Q8"]);
        assert_eq!(questions(memory.session_history("u1", "s2").await.unwrap()), vec!["Q7", "Q9"]);

        let transcript = &model.calls()[0].user;
        assert!(transcript.contains("User: Q0"));
        assert!(transcript.contains("User: Q9"));
    }

    #[tokio::test]
    async fn test_failed_compaction_keeps_turn() {
        let memory = memory();
        let writer = MemoryWriter::new(memory.clone(), Arc::new(ScriptedModel::default()));

        for n in 0..9 {
            writer.run(&answered(Some("u1"), &format!("Q{}", n))).await.unwrap();
        }
        let out = writer.run(&answered(Some("u1"), "Q9")).await.unwrap();

        assert_eq!(out.label, "Memory Writer (Failed)");
        assert_eq!(memory.count_user_turns("u1").await.unwrap(), 10);
    }
}
