use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::types::{OnComplete, RunResult};

/// Payload delivered to a completion handler once a run is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub workflow_id: String,
    pub result: RunResult,
    pub context: serde_json::Value,
}

impl CompletionEvent {
    /// Decode the context supplied at start time.
    pub fn context<C: DeserializeOwned>(&self) -> Result<C> {
        serde_json::from_value(self.context.clone()).with_context(|| {
            format!(
                "Failed to decode completion context for run {}",
                self.workflow_id
            )
        })
    }
}

/// Callback fired exactly once when a run reaches a terminal state.
///
/// Handlers are registered by name so the reference stored in the journal
/// survives restarts. A handler that fails is logged and never re-fired,
/// so handlers should be idempotent patches against business records.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    /// Name stored in the run's `on_complete` reference.
    fn name(&self) -> &str;

    async fn on_complete(&self, event: CompletionEvent) -> Result<()>;
}

/// Options accepted by `WorkflowManager::start`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub on_complete: Option<OnComplete>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `handler` with `context` when the run finishes.
    pub fn on_complete<C: Serialize>(handler: &str, context: &C) -> Result<Self, serde_json::Error> {
        Ok(Self {
            on_complete: Some(OnComplete {
                handler: handler.to_string(),
                context: serde_json::to_value(context)?,
            }),
        })
    }
}
