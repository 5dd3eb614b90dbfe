//! Query Executor
//!
//! Runs the generated query against the selected collection.
//! No model calls happen here.

use crate::agent::{Step, StepOutput};
use crate::error::PipelineError;
use crate::models::{SessionState, StateUpdate};
use crate::store::{Document, DocumentStore, FindQuery};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

pub const STEP_NAME: &str = "Query Executor";

/// Row cap when the generated query names none
pub const DEFAULT_LIMIT: usize = 10;

pub struct QueryExecutor {
    store: Arc<dyn DocumentStore>,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn execute(&self, state: &SessionState) -> Result<Vec<Document>> {
        let (Some(collection), Some(query)) = (state.selected_collection, state.structured_query.as_ref())
        else {
            return Ok(Vec::new());
        };

        let limit = query
            .limit
            .filter(|l| *l > 0)
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_LIMIT);
        let find = FindQuery::new(query.filter.clone())
            .sort(query.sort.clone())
            .limit(limit);

        self.store
            .find(collection.as_str(), &find)
            .await
            .map_err(|e| {
                error!(collection = %collection, "Query execution failed: {}", e);
                PipelineError::RetrievalFailure(e.to_string())
            })
    }
}

#[async_trait]
impl Step for QueryExecutor {
    fn name(&self) -> &'static str {
        STEP_NAME
    }

    fn should_run(&self, state: &SessionState) -> bool {
        state.is_on_topic && !state.is_greeting && state.structured_query.is_some()
    }

    async fn run(&self, state: &SessionState) -> Result<StepOutput> {
        info!(collection = ?state.selected_collection, "Node: Query Executor");
        let records = self.execute(state).await?;
        info!(count = records.len(), "Records retrieved");

        Ok(StepOutput::new(
            StateUpdate {
                retrieved_records: Some(records),
                ..Default::default()
            },
            STEP_NAME,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Collection, StructuredQuery};
    use crate::store::InMemoryDocumentStore;
    use serde_json::{json, Value};

    async fn seeded() -> Arc<InMemoryDocumentStore> {
        let store = Arc::new(InMemoryDocumentStore::new());
        for n in 0..15 {
            let doc = json!({"Player": format!("Player {}", n), "Runs": n * 100});
            store
                .insert_one("test", doc.as_object().cloned().unwrap())
                .await
                .unwrap();
        }
        store
    }

    fn planned(filter: Value, sort: Value, limit: Option<u64>) -> SessionState {
        let mut state = SessionState::new("q".into(), None, "s".into());
        state.is_on_topic = true;
        state.selected_collection = Some(Collection::Test);
        state.structured_query = Some(StructuredQuery { filter, sort, limit });
        state
    }

    #[tokio::test]
    async fn test_default_limit_and_sort() {
        let executor = QueryExecutor::new(seeded().await);
        let out = executor
            .run(&planned(json!({}), json!({"Runs": -1}), None))
            .await
            .unwrap();

        let records = out.update.retrieved_records.unwrap();
        assert_eq!(records.len(), DEFAULT_LIMIT);
        assert_eq!(records[0]["Runs"], 1400);
        assert_eq!(out.label, STEP_NAME);
    }

    #[tokio::test]
    async fn test_regex_filter_single_record() {
        let executor = QueryExecutor::new(seeded().await);
        let out = executor
            .run(&planned(
                json!({"Player": {"$regex": "player 7$", "$options": "i"}}),
                json!({}),
                Some(5),
            ))
            .await
            .unwrap();

        let records = out.update.retrieved_records.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["Player"], "Player 7");
    }

    #[tokio::test]
    async fn test_invalid_regex_is_retrieval_failure() {
        let executor = QueryExecutor::new(seeded().await);
        let err = executor
            .run(&planned(json!({"Player": {"$regex": "("}}), json!({}), None))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RetrievalFailure(_)));
    }

    #[test]
    fn test_preconditions() {
        let executor = QueryExecutor::new(Arc::new(InMemoryDocumentStore::new()));
        let mut state = planned(json!({}), json!({}), None);
        assert!(executor.should_run(&state));

        state.structured_query = None;
        assert!(!executor.should_run(&state));

        let mut greeting = planned(json!({}), json!({}), None);
        greeting.is_greeting = true;
        assert!(!executor.should_run(&greeting));
    }
}
