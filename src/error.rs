//! Error types for the cricket stats agent

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Caller-visible Pipeline Errors
    // =============================

    #[error("Invalid input: {0}")]
    InputValidation(String),

    #[error("Malformed model output: {0}")]
    MalformedModelOutput(String),

    #[error("Retrieval failure: {0}")]
    RetrievalFailure(String),

    #[error("Generation failure: {0}")]
    GenerationFailure(String),

    /// Memory load or compaction failed. Logged, never surfaced as a fatal snapshot.
    #[error("Memory degraded: {0}")]
    MemoryDegraded(String),

    #[error("Run cancelled by caller")]
    Cancelled,

    // =============================
    // Collaborator Errors
    // =============================

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::DatabaseError(e.to_string())
    }
}
