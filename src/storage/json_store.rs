use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::engine::types::*;
use crate::storage::{Journal, JournalError, apply_entry, apply_finish, apply_fired};

/// File-based JSON journal. Each run is stored as a separate JSON file that
/// is rewritten atomically (write, fsync, rename, directory fsync) on every
/// change.
pub struct JsonJournal {
    base_dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonJournal {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", run_id))
    }

    async fn read_run(&self, run_id: &str) -> Result<WorkflowRun, JournalError> {
        let path = self.run_path(run_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JournalError::RunNotFound(run_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    async fn write_run(&self, run: &WorkflowRun) -> Result<(), JournalError> {
        let path = self.run_path(&run.id);
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_vec_pretty(run)?;
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await?;
        self.sync_dir().await
    }

    /// Flush the directory entry so a renamed run file survives power loss.
    #[cfg(unix)]
    async fn sync_dir(&self) -> Result<(), JournalError> {
        tokio::fs::File::open(&self.base_dir).await?.sync_all().await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn sync_dir(&self) -> Result<(), JournalError> {
        Ok(())
    }

    /// Read-modify-write under the journal lock.
    async fn update<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut WorkflowRun) -> Result<T, JournalError>,
    ) -> Result<T, JournalError> {
        let _lock = self.lock.lock().await;
        let mut run = self.read_run(run_id).await?;
        let out = f(&mut run)?;
        self.write_run(&run).await?;
        Ok(out)
    }
}

#[async_trait]
impl Journal for JsonJournal {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), JournalError> {
        let _lock = self.lock.lock().await;

        // Ensure the directory exists
        tokio::fs::create_dir_all(&self.base_dir).await?;

        if tokio::fs::try_exists(self.run_path(&run.id)).await? {
            return Err(JournalError::RunExists(run.id.clone()));
        }

        self.write_run(run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, JournalError> {
        let _lock = self.lock.lock().await;
        self.read_run(run_id).await
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
        let _lock = self.lock.lock().await;

        if !tokio::fs::try_exists(&self.base_dir).await? {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<WorkflowRun>(&data) {
                Ok(run) => {
                    if status.is_none_or(|s| run.status == s) {
                        runs.push(run);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable run file");
                }
            }
        }

        // Newest first
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(runs)
    }
}
