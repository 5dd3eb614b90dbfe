//! Conversation memory persistence
//!
//! Turns and per-user summaries live in two document-store collections.
//! Everything here goes through `DocumentStore` primitives only.

use super::context_manager::{format_transcript, ContextConfig};
use crate::error::PipelineError;
use crate::models::{ConversationTurn, MemoryContext, SessionInfo, SessionSummary};
use crate::store::{Document, DocumentStore, FindQuery};
use crate::Result;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const TURNS_COLLECTION: &str = "conversations";
pub const SUMMARIES_COLLECTION: &str = "summaries";

pub struct ConversationMemory {
    store: Arc<dyn DocumentStore>,
    history_window: usize,
}

impl ConversationMemory {
    pub fn new(store: Arc<dyn DocumentStore>, history_window: usize) -> Self {
        Self {
            store,
            history_window,
        }
    }

    pub fn from_config(store: Arc<dyn DocumentStore>, config: &ContextConfig) -> Self {
        Self::new(store, config.history_window)
    }

    /// Running summary for the user plus the last turns of this session.
    pub async fn load_context(&self, user_id: &str, session_id: &str) -> Result<MemoryContext> {
        let summary = self
            .summary(user_id)
            .await?
            .map(|s| s.summary)
            .unwrap_or_default();

        let query = FindQuery::new(json!({"userId": user_id, "sessionId": session_id}))
            .sort(json!({"$natural": -1}))
            .limit(self.history_window);
        let mut recent: Vec<ConversationTurn> = decode_all(self.store.find(TURNS_COLLECTION, &query).await?)?;
        recent.reverse();

        Ok(MemoryContext {
            summary,
            history: format_transcript(&recent),
        })
    }

    pub async fn record_turn(&self, turn: &ConversationTurn) -> Result<String> {
        self.store.insert_one(TURNS_COLLECTION, encode(turn)?).await
    }

    pub async fn count_user_turns(&self, user_id: &str) -> Result<u64> {
        self.store
            .count(TURNS_COLLECTION, &json!({"userId": user_id}))
            .await
    }

    /// Every stored turn of the user across sessions, oldest first.
    pub async fn user_turns(&self, user_id: &str) -> Result<Vec<ConversationTurn>> {
        let query = FindQuery::new(json!({"userId": user_id})).sort(json!({"$natural": 1}));
        decode_all(self.store.find(TURNS_COLLECTION, &query).await?)
    }

    /// Delete all but the `keep` most recent turns of the user.
    pub async fn prune_user_turns(&self, user_id: &str, keep: usize) -> Result<u64> {
        let query = FindQuery::new(json!({"userId": user_id}))
            .sort(json!({"$natural": -1}))
            .limit(keep);
        let keep_ids: Vec<Value> = self
            .store
            .find(TURNS_COLLECTION, &query)
            .await?
            .into_iter()
            .filter_map(|d| d.get("_id").cloned())
            .collect();

        self.store
            .delete_many(
                TURNS_COLLECTION,
                &json!({"userId": user_id, "_id": {"$nin": keep_ids}}),
            )
            .await
    }

    pub async fn summary(&self, user_id: &str) -> Result<Option<SessionSummary>> {
        self.store
            .find_one(SUMMARIES_COLLECTION, &json!({"userId": user_id}))
            .await?
            .map(decode)
            .transpose()
    }

    /// Create or overwrite the user's summary.
    pub async fn save_summary(&self, user_id: &str, text: &str) -> Result<()> {
        let mut fields = Document::new();
        fields.insert("summary".to_string(), Value::String(text.to_string()));
        fields.insert("updatedAt".to_string(), serde_json::to_value(Utc::now())?);

        self.store
            .upsert_one(SUMMARIES_COLLECTION, &json!({"userId": user_id}), fields)
            .await
    }

    //
    // ================= Session CRUD =================
    //

    /// Sessions of a user, most recently active first.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionInfo>> {
        let turns = self.user_turns(user_id).await?;

        let mut sessions: Vec<SessionInfo> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for turn in turns {
            match index.get(&turn.session_id) {
                Some(&i) => {
                    let info = &mut sessions[i];
                    info.turn_count += 1;
                    info.last_question = turn.question;
                    info.last_activity = turn.created_at;
                }
                None => {
                    index.insert(turn.session_id.clone(), sessions.len());
                    sessions.push(SessionInfo {
                        session_id: turn.session_id,
                        turn_count: 1,
                        last_question: turn.question,
                        last_activity: turn.created_at,
                    });
                }
            }
        }

        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    pub async fn session_history(&self, user_id: &str, session_id: &str) -> Result<Vec<ConversationTurn>> {
        let query = FindQuery::new(json!({"userId": user_id, "sessionId": session_id}))
            .sort(json!({"$natural": 1}));
        decode_all(self.store.find(TURNS_COLLECTION, &query).await?)
    }

    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<u64> {
        self.store
            .delete_many(
                TURNS_COLLECTION,
                &json!({"userId": user_id, "sessionId": session_id}),
            )
            .await
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(doc) => Ok(doc),
        other => Err(PipelineError::DatabaseError(format!(
            "expected a document, got {}",
            other
        ))),
    }
}

fn decode<T: DeserializeOwned>(doc: Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

fn decode_all<T: DeserializeOwned>(docs: Vec<Document>) -> Result<Vec<T>> {
    docs.into_iter().map(decode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;

    fn memory() -> ConversationMemory {
        ConversationMemory::new(Arc::new(InMemoryDocumentStore::new()), 10)
    }

    fn turn(user: &str, session: &str, n: usize) -> ConversationTurn {
        ConversationTurn {
            id: None,
            user_id: user.into(),
            session_id: session.into(),
            question: format!("Question {}", n),
            answer: format!("Answer {}", n),
            records: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_load_context_window_is_recent_and_ordered() {
        let memory = memory();
        for n in 0..12 {
            memory.record_turn(&turn("u1", "s1", n)).await.unwrap();
        }
        memory.record_turn(&turn("u1", "other", 99)).await.unwrap();

        let ctx = memory.load_context("u1", "s1").await.unwrap();
        assert!(ctx.summary.is_empty());
        assert!(!ctx.history.contains("Question 1\n"));
        assert!(ctx.history.starts_with("User: Question 2\nAssistant: Answer 2\n"));
        assert!(ctx.history.ends_with("User: Question 11\nAssistant: Answer 11\n"));
        assert!(!ctx.history.contains("Question 99"));
    }

    #[tokio::test]
    async fn test_load_context_is_idempotent() {
        let memory = memory();
        memory.record_turn(&turn("u1", "s1", 1)).await.unwrap();
        memory.save_summary("u1", "Talked about Kohli.").await.unwrap();

        let first = memory.load_context("u1", "s1").await.unwrap();
        let second = memory.load_context("u1", "s1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.summary, "Talked about Kohli.");
    }

    #[tokio::test]
    async fn test_summary_round_trip_and_overwrite() {
        let memory = memory();
        assert!(memory.summary("u1").await.unwrap().is_none());

        memory.save_summary("u1", "first").await.unwrap();
        assert_eq!(memory.summary("u1").await.unwrap().unwrap().summary, "first");

        memory.save_summary("u1", "second").await.unwrap();
        let summary = memory.summary("u1").await.unwrap().unwrap();
        assert_eq!(summary.summary, "second");
        assert_eq!(summary.user_id, "u1");
    }

    #[tokio::test]
    async fn test_prune_keeps_most_recent() {
        let memory = memory();
        for n in 0..6 {
            memory.record_turn(&turn("u1", "s1", n)).await.unwrap();
        }
        memory.record_turn(&turn("u2", "s9", 0)).await.unwrap();

        assert_eq!(memory.prune_user_turns("u1", 3).await.unwrap(), 3);

        let left: Vec<_> = memory
            .user_turns("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.question)
            .collect();
        assert_eq!(left, vec!["Question 3", "Question 4", "Question 5"]);
        assert_eq!(memory.count_user_turns("u2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_session_crud() {
        let memory = memory();
        memory.record_turn(&turn("u1", "a", 0)).await.unwrap();
        memory.record_turn(&turn("u1", "b", 1)).await.unwrap();
        memory.record_turn(&turn("u1", "a", 2)).await.unwrap();

        let sessions = memory.list_sessions("u1").await.unwrap();
        assert_eq!(sessions.len(), 2);
        let a = sessions.iter().find(|s| s.session_id == "a").unwrap();
        assert_eq!(a.turn_count, 2);
        assert_eq!(a.last_question, "Question 2");

        let history = memory.session_history("u1", "a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].id.is_some());

        assert_eq!(memory.delete_session("u1", "a").await.unwrap(), 2);
        assert!(memory.session_history("u1", "a").await.unwrap().is_empty());
        assert_eq!(memory.list_sessions("u1").await.unwrap().len(), 1);
    }
}
