//! Query Generator
//!
//! Turns the question (plus loaded memory) into one structured find query
//! against exactly one of the three stats collections. The model only
//! writes the query here; running it is the executor's job.

use crate::agent::{Step, StepOutput};
use crate::error::PipelineError;
use crate::llm::{parse_json_reply, LanguageModel};
use crate::models::{Collection, MemoryContext, SessionState, StateUpdate, StructuredQuery};
use crate::store::DocumentStore;
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const STEP_NAME: &str = "Query Generator";

/// Field list advertised for a collection with no documents yet.
pub const DEFAULT_FIELDS: [&str; 5] = ["Player", "Runs", "HS", "Avg", "SR"];

#[derive(Debug, Deserialize)]
struct GeneratorReply {
    #[serde(alias = "collection")]
    format: String,
    query: StructuredQuery,
}

pub struct QueryGenerator {
    model: Arc<dyn LanguageModel>,
    store: Arc<dyn DocumentStore>,
}

impl QueryGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, store: Arc<dyn DocumentStore>) -> Self {
        Self { model, store }
    }

    /// Field names of one sample document, or the defaults.
    async fn fields_of(&self, collection: Collection) -> Vec<String> {
        match self.store.sample_field_names(collection.as_str()).await {
            Ok(Some(fields)) if !fields.is_empty() => fields,
            Ok(_) => DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect(),
            Err(e) => {
                warn!(collection = %collection, "Field discovery failed, using defaults: {}", e);
                DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect()
            }
        }
    }

    async fn build_prompt(&self, memory: &MemoryContext) -> String {
        let mut field_lines = String::new();
        for collection in Collection::ALL {
            let fields = self.fields_of(collection).await;
            field_lines.push_str(&format!(
                "Available fields in '{}': {}\n",
                collection,
                fields.join(", ")
            ));
        }

        let summary = if memory.summary.trim().is_empty() {
            "None"
        } else {
            memory.summary.trim()
        };
        let history = if memory.history.trim().is_empty() {
            "None"
        } else {
            memory.history.trim()
        };

        format!(
            r#"You are a MongoDB query generator for cricket stats.
We have 3 collections: 'test', 'odi', 't20'.

{fields}
Conversation summary so far: {summary}

Recent conversation:
{history}

IMPORTANT:
1. Use $regex with case-insensitive flag ('i') for player names because the database might have names in ALL CAPS or with country suffixes (e.g. 'V Kohli (INDIA)' or 'ROHIT SHARMA').
2. Example filter for Virat Kohli: {{"Player": {{"$regex": "Kohli", "$options": "i"}}}}
3. Determine which collection to use based on the user's mention of format.
4. Use the conversation above to resolve references like "he" or "that format".

Convert the user question into a MongoDB find query.
Respond with ONLY a JSON object:
{{
  "format": "test" | "odi" | "t20",
  "query": {{ "filter": {{}}, "sort": {{}}, "limit": 10 }}
}}"#,
            fields = field_lines,
            summary = summary,
            history = history,
        )
    }

    /// Ask the model for a collection and query.
    pub async fn generate(&self, state: &SessionState) -> Result<(Collection, StructuredQuery)> {
        let prompt = self.build_prompt(&state.memory).await;
        let reply = self.model.invoke(&prompt, &state.question).await?;

        let parsed: GeneratorReply = parse_json_reply(&reply)?;
        let collection: Collection = parsed.format.parse()?;
        let query = normalize(parsed.query)?;

        debug!(collection = %collection, filter = %query.filter, "Structured query generated");
        Ok((collection, query))
    }
}

fn normalize(mut query: StructuredQuery) -> Result<StructuredQuery> {
    if query.filter.is_null() {
        query.filter = Value::Object(Default::default());
    }
    if query.sort.is_null() {
        query.sort = Value::Object(Default::default());
    }
    if !query.filter.is_object() || !query.sort.is_object() {
        return Err(PipelineError::MalformedModelOutput(
            "query filter and sort must be JSON objects".to_string(),
        ));
    }
    Ok(query)
}

#[async_trait]
impl Step for QueryGenerator {
    fn name(&self) -> &'static str {
        STEP_NAME
    }

    fn should_run(&self, state: &SessionState) -> bool {
        state.is_on_topic && !state.is_greeting
    }

    async fn run(&self, state: &SessionState) -> Result<StepOutput> {
        info!("Node: Query Generator");
        let (collection, query) = self.generate(state).await?;

        Ok(StepOutput::new(
            StateUpdate {
                selected_collection: Some(collection),
                structured_query: Some(query),
                ..Default::default()
            },
            STEP_NAME,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::store::InMemoryDocumentStore;
    use serde_json::json;

    fn on_topic(question: &str) -> SessionState {
        let mut state = SessionState::new(question.into(), Some("u1".into()), "s1".into());
        state.is_on_topic = true;
        state
    }

    #[tokio::test]
    async fn test_generates_query_and_collection() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store
            .insert_one(
                "odi",
                json!({"Player": "V Kohli (INDIA)", "Mat": 295, "Runs": 13906, "": null})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();

        let model = Arc::new(ScriptedModel::new([r#"```json
{"format": "odi", "query": {"filter": {"Player": {"$regex": "Kohli", "$options": "i"}}, "sort": {}, "limit": 1}}
```"#]));
        let generator = QueryGenerator::new(model.clone(), store);

        let mut state = on_topic("How many ODI runs has he scored?");
        state.memory = MemoryContext {
            summary: "User is interested in Virat Kohli.".into(),
            history: "User: Who is Kohli?\nAssistant: An Indian batter.\n".into(),
        };

        let out = generator.run(&state).await.unwrap();
        assert_eq!(out.label, STEP_NAME);
        assert_eq!(out.update.selected_collection, Some(Collection::Odi));
        let query = out.update.structured_query.unwrap();
        assert_eq!(query.limit, Some(1));
        assert_eq!(query.filter["Player"]["$options"], "i");

        let system = &model.calls()[0].system;
        assert!(system.contains("Available fields in 'odi': Player, Mat, Runs"));
        assert!(system.contains("Available fields in 'test': Player, Runs, HS, Avg, SR"));
        assert!(system.contains("User is interested in Virat Kohli."));
        assert!(system.contains("User: Who is Kohli?"));
    }

    #[tokio::test]
    async fn test_collection_alias_and_missing_limit() {
        let model = Arc::new(ScriptedModel::new([
            r#"{"collection": "T20", "query": {"filter": {}, "sort": {"Runs": -1}}}"#,
        ]));
        let generator = QueryGenerator::new(model, Arc::new(InMemoryDocumentStore::new()));

        let (collection, query) = generator.generate(&on_topic("Top T20 scorers")).await.unwrap();
        assert_eq!(collection, Collection::T20);
        assert_eq!(query.limit, None);
        assert_eq!(query.sort, json!({"Runs": -1}));
    }

    #[tokio::test]
    async fn test_float_and_negative_limits_are_coerced() {
        let model = Arc::new(ScriptedModel::new([
            r#"{"format": "test", "query": {"filter": {}, "sort": {"Runs": -1}, "limit": 5.0}}"#,
            r#"{"format": "test", "query": {"filter": {}, "sort": {"Runs": -1}, "limit": -3}}"#,
        ]));
        let generator = QueryGenerator::new(model, Arc::new(InMemoryDocumentStore::new()));

        let (_, query) = generator.generate(&on_topic("Top 5 Test scorers")).await.unwrap();
        assert_eq!(query.limit, Some(5));
        let (_, query) = generator.generate(&on_topic("Top 3 Test scorers")).await.unwrap();
        assert_eq!(query.limit, Some(3));
    }

    #[tokio::test]
    async fn test_unknown_collection_is_malformed() {
        let model = Arc::new(ScriptedModel::new([
            r#"{"format": "ipl", "query": {"filter": {}}}"#,
        ]));
        let generator = QueryGenerator::new(model, Arc::new(InMemoryDocumentStore::new()));

        let err = generator.generate(&on_topic("IPL stats")).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedModelOutput(_)));
    }

    #[tokio::test]
    async fn test_non_json_reply_is_malformed() {
        let model = Arc::new(ScriptedModel::new(["I'd search the ODI table."]));
        let generator = QueryGenerator::new(model, Arc::new(InMemoryDocumentStore::new()));

        let err = generator.generate(&on_topic("Kohli?")).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedModelOutput(_)));
    }

    #[test]
    fn test_preconditions() {
        let generator = QueryGenerator::new(
            Arc::new(ScriptedModel::default()),
            Arc::new(InMemoryDocumentStore::new()),
        );
        let mut state = on_topic("q");
        assert!(generator.should_run(&state));
        state.is_greeting = true;
        assert!(!generator.should_run(&state));
        state.is_greeting = false;
        state.is_on_topic = false;
        assert!(!generator.should_run(&state));
    }
}
