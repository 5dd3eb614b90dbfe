//! Cricket Stats Agent
//!
//! Answers natural-language questions about cricket player statistics:
//! - Classifies each question (greeting / on-topic / off-topic)
//! - Recalls the user's running summary and recent turns
//! - Has a model write a structured query, then runs it against the stats store
//! - Streams a snapshot of the session state after every step
//! - Records the turn and compacts old history into a summary
//!
//! PIPELINE:
//! CLASSIFY → RECALL → GENERATE QUERY → EXECUTE → ANSWER → REMEMBER

pub mod agent;
pub mod api;
pub mod classifier;
pub mod config;
pub mod error;
pub mod execution;
pub mod llm;
pub mod memory;
pub mod models;
pub mod planner;
pub mod renderer;
pub mod seed;
pub mod store;

pub use error::Result;

// Re-export common types
pub use agent::{Pipeline, SnapshotStream, Step, StepOutput};
pub use models::*;
