//! Pipeline engine
//!
//! CLASSIFY → RECALL → GENERATE QUERY → EXECUTE → ANSWER → REMEMBER
//!
//! Steps run strictly in order on one spawned task per question. After every
//! step (skipped ones included) the engine pushes a snapshot of the session
//! state into a bounded channel; callers consume it as a stream. Dropping the
//! stream cancels the in-flight step and ends the run.

use crate::classifier::RelevancyChecker;
use crate::error::PipelineError;
use crate::execution::QueryExecutor;
use crate::llm::LanguageModel;
use crate::memory::{ContextConfig, ContextManager, ConversationMemory, MemoryRetriever, MemoryWriter};
use crate::models::{AskRequest, SessionState, Snapshot, StateUpdate};
use crate::planner::QueryGenerator;
use crate::renderer::AnswerFormatter;
use crate::store::DocumentStore;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Stream of snapshots for one run. Finite, single-pass.
pub type SnapshotStream = ReceiverStream<Snapshot>;

/// What a step hands back to the engine. The engine, not the step,
/// appends `label` to `executedSteps`.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub update: StateUpdate,
    pub label: String,
}

impl StepOutput {
    pub fn new(update: StateUpdate, label: impl Into<String>) -> Self {
        Self {
            update,
            label: label.into(),
        }
    }

    pub fn skipped(name: &str) -> Self {
        Self::new(StateUpdate::default(), format!("{} (Skipped)", name))
    }
}

/// One stage of the pipeline.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    /// Precondition checked by the engine. When false the step is recorded
    /// as `<name> (Skipped)` and `run` is never called.
    fn should_run(&self, _state: &SessionState) -> bool {
        true
    }

    async fn run(&self, state: &SessionState) -> Result<StepOutput>;
}

pub struct Pipeline {
    steps: Vec<Arc<dyn Step>>,
    snapshot_delay: Duration,
}

impl Pipeline {
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            steps,
            snapshot_delay: Duration::ZERO,
        }
    }

    /// The six-step question answering pipeline over one model and one store.
    pub fn standard(model: Arc<dyn LanguageModel>, store: Arc<dyn DocumentStore>) -> Self {
        Self::with_context(model, store, ContextConfig::default())
    }

    pub fn with_context(
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn DocumentStore>,
        context: ContextConfig,
    ) -> Self {
        let memory = Arc::new(ConversationMemory::from_config(store.clone(), &context));
        Self::with_memory(model, store, memory, context)
    }

    /// Like `with_context`, over a memory the caller also holds (the API's session routes).
    pub fn with_memory(
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn DocumentStore>,
        memory: Arc<ConversationMemory>,
        context: ContextConfig,
    ) -> Self {
        Self::new(vec![
            Arc::new(RelevancyChecker::new(model.clone())),
            Arc::new(MemoryRetriever::new(memory.clone())),
            Arc::new(QueryGenerator::new(model.clone(), store.clone())),
            Arc::new(QueryExecutor::new(store)),
            Arc::new(AnswerFormatter::new(model.clone())),
            Arc::new(MemoryWriter::with_manager(
                memory,
                model,
                ContextManager::with_config(context),
            )),
        ])
    }

    /// Pause between snapshots, for presentation only.
    pub fn with_snapshot_delay(mut self, delay: Duration) -> Self {
        self.snapshot_delay = delay;
        self
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Start a run for `request` and return its snapshot stream.
    ///
    /// A request without a usable question yields a single error snapshot
    /// and no run is started.
    pub fn stream(self: &Arc<Self>, request: AskRequest) -> SnapshotStream {
        let (tx, rx) = mpsc::channel(1);

        match initial_state(request) {
            Ok(state) => {
                let span = info_span!(
                    "pipeline_run",
                    session_id = %state.session_id,
                    user_id = ?state.user_id
                );
                let pipeline = Arc::clone(self);
                tokio::spawn(async move { pipeline.drive(state, tx).await }.instrument(span));
            }
            Err(e) => {
                info!("Rejected request: {}", e);
                // Fresh channel with capacity 1, so this cannot be full.
                let _ = tx.try_send(Snapshot::Error {
                    error: e.to_string(),
                    executed_steps: Vec::new(),
                });
            }
        }

        ReceiverStream::new(rx)
    }

    async fn drive(&self, mut state: SessionState, tx: mpsc::Sender<Snapshot>) {
        info!(question = %state.question, "Pipeline: starting run");

        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 && !self.snapshot_delay.is_zero() {
                tokio::time::sleep(self.snapshot_delay).await;
            }

            let name = step.name();
            let output = if step.should_run(&state) {
                tokio::select! {
                    biased;
                    _ = tx.closed() => {
                        debug!(step = name, "{}", PipelineError::Cancelled);
                        return;
                    }
                    result = step.run(&state) => result,
                }
            } else {
                debug!(step = name, "Precondition not met, skipping");
                Ok(StepOutput::skipped(name))
            };

            match output {
                Ok(out) => state.apply(out.update, out.label),
                Err(e) => {
                    error!(step = name, "Step failed, aborting run: {}", e);
                    let _ = tx
                        .send(Snapshot::Error {
                            error: e.to_string(),
                            executed_steps: state.executed_steps.clone(),
                        })
                        .await;
                    return;
                }
            }

            if tx.send(Snapshot::State(state.clone())).await.is_err() {
                debug!(step = name, "{}", PipelineError::Cancelled);
                return;
            }
        }

        info!(steps = ?state.executed_steps, "Pipeline: run complete");
    }
}

fn initial_state(request: AskRequest) -> Result<SessionState> {
    let question = request
        .question
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| PipelineError::InputValidation("question must not be empty".to_string()))?;

    let user_id = request
        .user_id
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty());
    let session_id = request
        .session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Ok(SessionState::new(question, user_id, session_id))
}
