//! Core data models for the stats agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;
use crate::store::Document;

//
// ================= Collections =================
//

/// The three player-record collections, one per match format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Test,
    Odi,
    T20,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Test, Collection::Odi, Collection::T20];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Test => "test",
            Collection::Odi => "odi",
            Collection::T20 => "t20",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "test" => Ok(Collection::Test),
            "odi" => Ok(Collection::Odi),
            "t20" | "t20i" => Ok(Collection::T20),
            other => Err(PipelineError::MalformedModelOutput(format!(
                "unknown collection '{}'",
                other
            ))),
        }
    }
}

//
// ================= Structured Query =================
//

/// Filter + sort + limit triple produced by the query synthesizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuredQuery {
    #[serde(default = "empty_object")]
    pub filter: serde_json::Value,
    #[serde(default = "empty_object")]
    pub sort: serde_json::Value,
    #[serde(
        default,
        deserialize_with = "lenient_limit",
        skip_serializing_if = "Option::is_none"
    )]
    pub limit: Option<u64>,
}

/// Accept any JSON number as a limit: fractions truncate, negatives count
/// by magnitude and zero means "use the default".
fn lenient_limit<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(number) = Option::<serde_json::Number>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let magnitude = number
        .as_f64()
        .ok_or_else(|| serde::de::Error::custom("limit must be a number"))?
        .trunc()
        .abs();

    Ok((magnitude >= 1.0).then(|| magnitude.min(u64::MAX as f64) as u64))
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

//
// ================= Session State =================
//

/// Summary and recent-history text loaded for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryContext {
    pub summary: String,
    pub history: String,
}

/// Per-run state threaded through every pipeline step.
///
/// Fields are only ever filled in. [`SessionState::apply`] ignores absent
/// values so a later step can never clear what an earlier one set.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub session_id: String,
    pub is_on_topic: bool,
    pub is_greeting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_collection: Option<Collection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_query: Option<StructuredQuery>,
    pub retrieved_records: Vec<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,
    pub executed_steps: Vec<String>,
    #[serde(skip)]
    pub memory: MemoryContext,
}

impl SessionState {
    pub fn new(question: String, user_id: Option<String>, session_id: String) -> Self {
        Self {
            question,
            user_id,
            session_id,
            ..Default::default()
        }
    }

    /// Merge a step's output and record its label.
    pub(crate) fn apply(&mut self, update: StateUpdate, label: String) {
        if let Some(v) = update.is_on_topic {
            self.is_on_topic = v;
        }
        if let Some(v) = update.is_greeting {
            self.is_greeting = v;
        }
        if let Some(v) = update.selected_collection {
            self.selected_collection = Some(v);
        }
        if let Some(v) = update.structured_query {
            self.structured_query = Some(v);
        }
        if let Some(v) = update.retrieved_records {
            self.retrieved_records = v;
        }
        if let Some(v) = update.answer_text {
            self.answer_text = Some(v);
        }
        if let Some(v) = update.memory {
            self.memory = v;
        }
        self.executed_steps.push(label);
    }
}

/// Fields a step wants to set. `None` leaves the current value untouched.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub is_on_topic: Option<bool>,
    pub is_greeting: Option<bool>,
    pub selected_collection: Option<Collection>,
    pub structured_query: Option<StructuredQuery>,
    pub retrieved_records: Option<Vec<Document>>,
    pub answer_text: Option<String>,
    pub memory: Option<MemoryContext>,
}

//
// ================= Snapshots =================
//

/// One item of the caller-facing stream.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Snapshot {
    State(SessionState),
    Error {
        error: String,
        #[serde(rename = "executedSteps")]
        executed_steps: Vec<String>,
    },
}

impl Snapshot {
    pub fn is_error(&self) -> bool {
        matches!(self, Snapshot::Error { .. })
    }

    pub fn state(&self) -> Option<&SessionState> {
        match self {
            Snapshot::State(s) => Some(s),
            Snapshot::Error { .. } => None,
        }
    }

    pub fn executed_steps(&self) -> &[String] {
        match self {
            Snapshot::State(s) => &s.executed_steps,
            Snapshot::Error { executed_steps, .. } => executed_steps,
        }
    }
}

//
// ================= Requests =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

//
// ================= Persisted Memory =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub session_id: String,
    pub question: String,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<Document>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub user_id: String,
    pub summary: String,
    pub updated_at: DateTime<Utc>,
}

/// One row of the session listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub turn_count: usize,
    pub last_question: String,
    pub last_activity: DateTime<Utc>,
}
