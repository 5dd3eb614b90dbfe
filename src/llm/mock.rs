//! Scripted model for development & testing
//! Keeps the pipeline runnable without a model API.

use super::LanguageModel;
use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCall {
    pub system: String,
    pub user: String,
}

/// Replies with queued strings in order and records every call.
/// An exhausted queue yields an `LlmError`.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<ModelCall>>,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: impl Into<String>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply.into());
        }
    }

    pub fn calls(&self) -> Vec<ModelCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, system: &str, user: &str) -> Result<String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ModelCall {
                system: system.to_string(),
                user: user.to_string(),
            });
        }

        self.replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .ok_or_else(|| PipelineError::LlmError("scripted model has no reply left".to_string()))
    }
}
