use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::completion::{CompletionEvent, CompletionHandler, StartOptions};
use crate::engine::definition::{StepInput, WorkflowArgs, WorkflowDefinition};
use crate::engine::error::WorkflowError;
use crate::engine::executor::{Outcome, StepExecutor};
use crate::engine::pool::WorkPools;
use crate::engine::retry::Transition;
use crate::engine::types::*;
use crate::storage::{Journal, JournalError};

/// What `recover` did on one pass over the journal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Running runs re-entered into their pool.
    pub resumed: Vec<String>,
    /// Terminal runs whose completion callback had not fired yet.
    pub fired: Vec<String>,
    /// Running runs left alone: already in flight here, or no definition registered.
    pub skipped: Vec<String>,
}

/// Orchestrates workflow runs: sequences steps through their pool, journals
/// every outcome before scheduling dependent work, resumes interrupted runs
/// and fires completion handlers exactly once.
///
/// The manager is the only writer of run records.
#[derive(Clone)]
pub struct WorkflowManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    journal: Arc<dyn Journal>,
    pools: Arc<WorkPools>,
    executor: StepExecutor,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    handlers: RwLock<HashMap<String, Arc<dyn CompletionHandler>>>,
    /// Runs with an invocation queued, backing off or executing in this process.
    leases: Mutex<HashSet<String>>,
    /// Runs with a completion firing in progress, counted per caller.
    firing: Mutex<HashMap<String, usize>>,
    settled: Notify,
}

enum Next {
    /// Keep the lease and dispatch the run again, optionally after a delay.
    Continue(PoolName, Option<Duration>),
    /// The run is terminal; fire its completion.
    Settled,
    /// Drop the lease without touching the run.
    Stop,
}

impl WorkflowManager {
    pub fn new(journal: Arc<dyn Journal>, pools: Arc<WorkPools>) -> Self {
        Self::with_executor(journal, pools, StepExecutor::new())
    }

    pub fn with_executor(
        journal: Arc<dyn Journal>,
        pools: Arc<WorkPools>,
        executor: StepExecutor,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                journal,
                pools,
                executor,
                definitions: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                leases: Mutex::new(HashSet::new()),
                firing: Mutex::new(HashMap::new()),
                settled: Notify::new(),
            }),
        }
    }

    pub fn pools(&self) -> &WorkPools {
        &self.inner.pools
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.inner.journal
    }

    /// Register a workflow definition.
    pub fn define(&self, definition: WorkflowDefinition) -> Result<(), WorkflowError> {
        if definition.steps.is_empty() {
            return Err(WorkflowError::EmptyDefinition(definition.name));
        }

        let mut definitions = self
            .inner
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if definitions.contains_key(&definition.name) {
            return Err(WorkflowError::DuplicateDefinition(definition.name));
        }

        info!(
            workflow = %definition.name,
            pool = %definition.pool,
            steps = definition.steps.len(),
            "Workflow defined"
        );
        definitions.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Register a completion handler under its name. Replaces any previous one.
    pub fn register_handler(&self, handler: Arc<dyn CompletionHandler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handler.name().to_string(), handler);
    }

    pub fn definition(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner.definition(name)
    }

    /// Start a run of the definition registered for `A`. Returns the run id
    /// as soon as the run is journaled and its first step is enqueued.
    pub async fn start<A: WorkflowArgs>(
        &self,
        args: &A,
        options: StartOptions,
    ) -> Result<String, WorkflowError> {
        self.start_named(A::NAME, serde_json::to_value(args)?, options)
            .await
    }

    /// Untyped variant of [`start`](Self::start).
    pub async fn start_named(
        &self,
        name: &str,
        args: serde_json::Value,
        options: StartOptions,
    ) -> Result<String, WorkflowError> {
        let definition = self
            .inner
            .definition(name)
            .ok_or_else(|| WorkflowError::UnknownDefinition(name.to_string()))?;

        if let Some(ref on_complete) = options.on_complete
            && self.inner.handler(&on_complete.handler).is_none()
        {
            return Err(WorkflowError::UnknownHandler(on_complete.handler.clone()));
        }

        let run_id = Uuid::new_v4().to_string();
        let run = WorkflowRun::new(&run_id, name, args, definition.pool, options.on_complete);
        self.inner.journal.create_run(&run).await?;

        info!(run_id = %run_id, workflow = %name, pool = %definition.pool, "Workflow run started");

        self.inner.claim(&run_id);
        self.inner.enqueue_step(run_id.clone(), definition.pool, None);

        Ok(run_id)
    }

    /// Cancel a running run. No further steps are started; a step already
    /// executing is allowed to finish. Returns `false` if the run was
    /// already terminal.
    pub async fn cancel(&self, run_id: &str) -> Result<bool, WorkflowError> {
        let canceled = self
            .inner
            .journal
            .finish_run(run_id, RunResult::Canceled)
            .await?;

        if canceled {
            info!(run_id = %run_id, "Workflow run canceled");
            self.inner.fire_completion(run_id).await;
        }

        Ok(canceled)
    }

    /// Resume every interrupted run found in the journal and fire any
    /// terminal run whose callback never went out. Safe to call repeatedly.
    pub async fn recover(&self) -> Result<RecoveryReport, WorkflowError> {
        let runs = self.inner.journal.list_runs(None).await?;
        let mut report = RecoveryReport::default();

        for run in runs {
            if run.status == RunStatus::Running {
                let Some(definition) = self.inner.definition(&run.definition_name) else {
                    warn!(
                        run_id = %run.id,
                        workflow = %run.definition_name,
                        "No definition registered; leaving run for a later recovery"
                    );
                    report.skipped.push(run.id);
                    continue;
                };
                if !self.inner.claim(&run.id) {
                    report.skipped.push(run.id);
                    continue;
                }

                let delay = remaining_backoff(&run, &definition);
                info!(
                    run_id = %run.id,
                    workflow = %run.definition_name,
                    cursor = run.cursor,
                    backoff_ms = delay.unwrap_or_default().as_millis() as u64,
                    "Resuming interrupted run"
                );
                self.inner.enqueue_step(run.id.clone(), run.pool, delay);
                report.resumed.push(run.id);
            } else if !run.on_complete_fired {
                info!(run_id = %run.id, status = %run.status, "Firing completion missed before restart");
                self.inner.fire_completion(&run.id).await;
                report.fired.push(run.id);
            }
        }

        Ok(report)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        Ok(self.inner.journal.get_run(run_id).await?)
    }

    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
    ) -> Result<Vec<WorkflowRun>, WorkflowError> {
        Ok(self.inner.journal.list_runs(status).await?)
    }

    /// Wait until the run is terminal and its completion has been handled.
    pub async fn wait(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let run = self.inner.journal.get_run(run_id).await?;
            if run.status.is_terminal() && run.on_complete_fired && !self.inner.is_firing(run_id)
            {
                return Ok(run);
            }

            notified.await;
        }
    }
}

/// Backoff a recovered run still owes when it stopped right after a failed
/// attempt of its current step.
fn remaining_backoff(run: &WorkflowRun, definition: &WorkflowDefinition) -> Option<Duration> {
    let step = definition.steps.get(run.cursor)?;
    let last = run
        .step_history
        .iter()
        .rev()
        .find(|r| r.step_index == run.cursor)?;
    if last.status != StepStatus::Failed {
        return None;
    }

    let Transition::RetryAfter(delay) = step.retry.transition(last.attempt, false) else {
        return None;
    };
    let elapsed = (Utc::now() - last.finished_at?).to_std().unwrap_or_default();
    delay.checked_sub(elapsed).filter(|d| !d.is_zero())
}

impl ManagerInner {
    fn definition(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn CompletionHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn claim(&self, run_id: &str) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.to_string())
    }

    fn release(&self, run_id: &str) {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
    }

    fn is_firing(&self, run_id: &str) -> bool {
        self.firing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(run_id)
    }

    fn set_firing(&self, run_id: &str, firing: bool) {
        let mut counts = self.firing.lock().unwrap_or_else(PoisonError::into_inner);
        if firing {
            *counts.entry(run_id.to_string()).or_insert(0) += 1;
        } else if let Some(count) = counts.get_mut(run_id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(run_id);
            }
        }
    }

    /// Put the run's next step on its pool. Backoff delays are spent outside
    /// the pool, and the retry joins the tail of the queue like fresh work.
    fn enqueue_step(self: &Arc<Self>, run_id: String, pool: PoolName, delay: Option<Duration>) {
        let inner = self.clone();
        match delay {
            None => inner.dispatch(run_id, pool),
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.dispatch(run_id, pool);
                });
            }
        }
    }

    fn dispatch(self: Arc<Self>, run_id: String, pool: PoolName) {
        let inner = self.clone();
        self.pools
            .get(pool)
            .enqueue(Box::pin(async move { inner.run_step(run_id).await }));
    }

    async fn run_step(self: Arc<Self>, run_id: String) {
        match self.advance(&run_id).await {
            Ok(Next::Continue(pool, delay)) => self.enqueue_step(run_id, pool, delay),
            // Canceled mid-step: the journal refused the outcome.
            Ok(Next::Settled) | Err(JournalError::RunTerminal(_)) => {
                self.release(&run_id);
                self.fire_completion(&run_id).await;
            }
            Ok(Next::Stop) => self.release(&run_id),
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Journal error while advancing run; leaving it for recovery");
                self.release(&run_id);
            }
        }
    }

    /// Execute the step at the run's cursor and decide what happens next.
    async fn advance(&self, run_id: &str) -> Result<Next, JournalError> {
        let run = self.journal.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(Next::Settled);
        }

        let Some(definition) = self.definition(&run.definition_name) else {
            warn!(run_id = %run_id, workflow = %run.definition_name, "No definition registered; run left running");
            return Ok(Next::Stop);
        };

        // Every step journaled but the run never closed: crashed right before finishing.
        if run.cursor >= definition.steps.len() {
            let return_value = run
                .outputs()
                .pop()
                .unwrap_or(serde_json::Value::Null);
            self.finish(&run, RunResult::Success { return_value }).await?;
            return Ok(Next::Settled);
        }

        let step_index = run.cursor;
        let step = &definition.steps[step_index];
        let attempt = run.failed_attempts(step_index) + 1;

        // Budget spent before a crash kept the run from closing.
        if attempt > step.retry.max_attempts.max(1) {
            let error = format!(
                "Step '{}' failed after {} attempts: {}",
                step.name,
                attempt - 1,
                run.last_error().unwrap_or("unknown error")
            );
            self.finish(&run, RunResult::Error { error }).await?;
            return Ok(Next::Settled);
        }
        let started_at = Utc::now();

        self.journal
            .append(run_id, StepRecord::pending(step_index, attempt, started_at))
            .await?;

        info!(
            run_id = %run_id,
            workflow = %definition.name,
            step = %step.name,
            kind = %step.kind,
            attempt = attempt,
            max = step.retry.max_attempts,
            "Running step"
        );

        let input = StepInput {
            run_id: run_id.to_string(),
            step_index,
            attempt,
            args: run.args.clone(),
            outputs: run.outputs(),
        };

        match self.executor.execute(step, input).await {
            Outcome::Success(value) => {
                let entry = StepRecord::succeeded(step_index, attempt, started_at, value.clone());
                match self.journal.append(run_id, entry).await {
                    Ok(()) => {}
                    Err(JournalError::AlreadySucceeded { .. } | JournalError::OutOfOrder { .. }) => {
                        warn!(run_id = %run_id, step = %step.name, "Step already journaled as succeeded; dropping duplicate invocation");
                        return Ok(Next::Stop);
                    }
                    Err(e) => return Err(e),
                }

                info!(run_id = %run_id, step = %step.name, attempt = attempt, "Step succeeded");

                if step_index + 1 == definition.steps.len() {
                    self.finish(&run, RunResult::Success { return_value: value })
                        .await?;
                    return Ok(Next::Settled);
                }

                if self.journal.get_run(run_id).await?.status.is_terminal() {
                    return Ok(Next::Settled);
                }
                Ok(Next::Continue(run.pool, None))
            }
            Outcome::Failure(err_msg) => {
                self.journal
                    .append(
                        run_id,
                        StepRecord::failed(step_index, attempt, started_at, err_msg.clone()),
                    )
                    .await?;

                match step.retry.transition(attempt, false) {
                    Transition::RetryAfter(delay) => {
                        if self.journal.get_run(run_id).await?.status.is_terminal() {
                            return Ok(Next::Settled);
                        }
                        warn!(
                            run_id = %run_id,
                            step = %step.name,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err_msg,
                            "Step attempt failed; retrying after backoff"
                        );
                        Ok(Next::Continue(run.pool, Some(delay)))
                    }
                    Transition::Exhausted | Transition::Advance => {
                        error!(
                            run_id = %run_id,
                            step = %step.name,
                            attempts = attempt,
                            error = %err_msg,
                            "Step exhausted its retries; failing run"
                        );
                        let error = format!(
                            "Step '{}' failed after {} attempts: {}",
                            step.name, attempt, err_msg
                        );
                        self.finish(&run, RunResult::Error { error }).await?;
                        Ok(Next::Settled)
                    }
                }
            }
        }
    }

    async fn finish(&self, run: &WorkflowRun, result: RunResult) -> Result<bool, JournalError> {
        let status = result.status();
        let closed = self.journal.finish_run(&run.id, result).await?;
        if closed {
            info!(run_id = %run.id, workflow = %run.definition_name, status = %status, "Workflow run finished");
        }
        Ok(closed)
    }

    /// Fire the run's completion handler if nobody has yet. Never returns an
    /// error: handler failures are logged and not retried.
    async fn fire_completion(&self, run_id: &str) {
        self.set_firing(run_id, true);
        if let Err(e) = self.try_fire_completion(run_id).await {
            error!(run_id = %run_id, error = %e, "Failed to fire completion");
        }
        self.set_firing(run_id, false);
        self.settled.notify_waiters();
    }

    async fn try_fire_completion(&self, run_id: &str) -> Result<(), WorkflowError> {
        let run = self.journal.get_run(run_id).await?;
        if !run.status.is_terminal() || run.on_complete_fired {
            return Ok(());
        }

        // The flag goes down before the handler runs: a crash in between
        // loses the callback instead of delivering it twice.
        if !self.journal.mark_on_complete_fired(run_id).await? {
            return Ok(());
        }

        let Some(on_complete) = run.on_complete else {
            return Ok(());
        };

        let Some(handler) = self.handler(&on_complete.handler) else {
            error!(run_id = %run_id, handler = %on_complete.handler, "Completion handler not registered; callback dropped");
            return Ok(());
        };

        let result = run.result.unwrap_or_else(|| RunResult::Error {
            error: "Run finished without a recorded result".to_string(),
        });
        let kind = result.status();
        let event = CompletionEvent {
            workflow_id: run.id.clone(),
            result,
            context: on_complete.context,
        };

        match AssertUnwindSafe(handler.on_complete(event))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {
                info!(run_id = %run_id, handler = %on_complete.handler, status = %kind, "Completion handler fired");
            }
            Ok(Err(e)) => {
                error!(
                    run_id = %run_id,
                    handler = %on_complete.handler,
                    error = %format!("{:#}", e),
                    "Completion handler failed; it will not be re-fired"
                );
            }
            Err(_) => {
                error!(run_id = %run_id, handler = %on_complete.handler, "Completion handler panicked; it will not be re-fired");
            }
        }

        Ok(())
    }
}
