pub mod json_store;
pub mod memory_store;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::engine::types::*;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already exists: {0}")]
    RunExists(String),

    #[error("Step {step_index} of run {run_id} already succeeded")]
    AlreadySucceeded { run_id: String, step_index: usize },

    #[error("Out-of-order success for run {run_id}: step {step_index} with cursor at {cursor}")]
    OutOfOrder {
        run_id: String,
        step_index: usize,
        cursor: usize,
    },

    #[error("Run {0} is already terminal")]
    RunTerminal(String),

    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable, append-only record of workflow runs.
///
/// Every write must be durable before the call returns; the manager relies
/// on that to schedule dependent work only after the outcome is on disk.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Persist a freshly started run.
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), JournalError>;

    /// Read the full run record.
    async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, JournalError>;

    /// Append a step entry. A `Succeeded` entry must target the current
    /// cursor and advances it in the same write. Terminal runs reject every
    /// entry with [`JournalError::RunTerminal`].
    async fn append(&self, run_id: &str, entry: StepRecord) -> Result<(), JournalError>;

    /// Ordered step history of a run.
    async fn read_history(&self, run_id: &str) -> Result<Vec<StepRecord>, JournalError>;

    /// Move a running run to the terminal state implied by `result`.
    /// Returns `false` when the run was already terminal.
    async fn finish_run(&self, run_id: &str, result: RunResult) -> Result<bool, JournalError>;

    /// Atomically check-and-set the completion flag of a terminal run.
    /// Returns `true` only for the single caller that flipped it.
    async fn mark_on_complete_fired(&self, run_id: &str) -> Result<bool, JournalError>;

    /// List runs, newest first, optionally filtered by status.
    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<WorkflowRun>, JournalError>;
}

/// Apply a step entry to a run record, enforcing the cursor invariant.
pub(crate) fn apply_entry(run: &mut WorkflowRun, entry: StepRecord) -> Result<(), JournalError> {
    if run.status.is_terminal() {
        return Err(JournalError::RunTerminal(run.id.clone()));
    }
    if entry.step_index < run.cursor {
        return Err(JournalError::AlreadySucceeded {
            run_id: run.id.clone(),
            step_index: entry.step_index,
        });
    }

    if entry.status == StepStatus::Succeeded {
        if entry.step_index != run.cursor {
            return Err(JournalError::OutOfOrder {
                run_id: run.id.clone(),
                step_index: entry.step_index,
                cursor: run.cursor,
            });
        }
        run.cursor += 1;
    }

    run.step_history.push(entry);
    Ok(())
}

pub(crate) fn apply_finish(run: &mut WorkflowRun, result: RunResult) -> bool {
    if run.status.is_terminal() {
        return false;
    }
    run.status = result.status();
    run.result = Some(result);
    run.finished_at = Some(Utc::now());
    true
}

pub(crate) fn apply_fired(run: &mut WorkflowRun) -> bool {
    if !run.status.is_terminal() || run.on_complete_fired {
        return false;
    }
    run.on_complete_fired = true;
    true
}
