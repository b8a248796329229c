use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::types::*;
use crate::storage::{Journal, JournalError, apply_entry, apply_finish, apply_fired};

/// In-memory journal. Holds run state only for the lifetime of the instance,
/// so it only "survives" a simulated restart when the same instance is
/// handed to a new manager.
#[derive(Default)]
pub struct MemoryJournal {
    runs: Mutex<HashMap<String, WorkflowRun>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut WorkflowRun) -> Result<T, JournalError>,
    ) -> Result<T, JournalError> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| JournalError::RunNotFound(run_id.to_string()))?;
        f(run)
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), JournalError> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&run.id) {
            return Err(JournalError::RunExists(run.id.clone()));
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, JournalError> {
        let runs = self.runs.lock().await;
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| JournalError::RunNotFound(run_id.to_string()))
    }

    async fn append(&self, run_id: &str, entry: StepRecord) -> Result<(), JournalError> {
        self.update(run_id, |run| apply_entry(run, entry)).await
    }

    async fn read_history(&self, run_id: &str) -> Result<Vec<StepRecord>, JournalError> {
        Ok(self.get_run(run_id).await?.step_history)
    }

    async fn finish_run(&self, run_id: &str, result: RunResult) -> Result<bool, JournalError> {
        self.update(run_id, |run| Ok(apply_finish(run, result))).await
    }

    async fn mark_on_complete_fired(&self, run_id: &str) -> Result<bool, JournalError> {
        self.update(run_id, |run| Ok(apply_fired(run))).await
    }

    async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<WorkflowRun>, JournalError> {
        let runs = self.runs.lock().await;
        let mut list: Vec<WorkflowRun> = runs
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }
}
