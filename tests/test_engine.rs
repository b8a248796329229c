//! Integration tests for the workflow manager: sequencing, failure handling
//! and exactly-once completion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use detailflow::engine::types::*;
use detailflow::engine::*;
use detailflow::storage::Journal;
use detailflow::storage::memory_store::MemoryJournal;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Numbers {
    value: i64,
}

impl WorkflowArgs for Numbers {
    const NAME: &'static str = "add_then_double";
    const POOL: PoolName = PoolName::Default;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sleepy {
    ms: u64,
}

impl WorkflowArgs for Sleepy {
    const NAME: &'static str = "sleepy";
    const POOL: PoolName = PoolName::Low;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Boom;

impl WorkflowArgs for Boom {
    const NAME: &'static str = "boom";
    const POOL: PoolName = PoolName::High;
}

/// Handler that remembers every event it was given.
struct Recorder {
    name: String,
    fail: bool,
    events: Mutex<Vec<CompletionEvent>>,
}

impl Recorder {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            events: Mutex::new(Vec::new()),
        })
    }

    fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<CompletionEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionHandler for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_complete(&self, event: CompletionEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        if self.fail {
            return Err(anyhow!("handler exploded"));
        }
        Ok(())
    }
}

fn manager() -> WorkflowManager {
    let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
    WorkflowManager::new(journal, Arc::new(WorkPools::default()))
}

fn add_then_double() -> WorkflowDefinition {
    WorkflowDefinition::builder::<Numbers>()
        .mutation("add_one", RetryPolicy::once(), |args, _input| async move {
            Ok(args.value + 1)
        })
        .action("double", RetryPolicy::once(), |_args, input| async move {
            let previous: i64 = input.output(0)?;
            Ok(previous * 2)
        })
        .build()
}

fn sleepy() -> WorkflowDefinition {
    WorkflowDefinition::builder::<Sleepy>()
        .action("nap", RetryPolicy::once(), |args, _input| async move {
            tokio::time::sleep(Duration::from_millis(args.ms)).await;
            Ok("rested")
        })
        .build()
}

// --- Sequencing ---

#[tokio::test]
async fn steps_run_in_order_and_pass_outputs() {
    let manager = manager();
    manager.define(add_then_double()).unwrap();

    let run_id = manager
        .start(&Numbers { value: 4 }, StartOptions::new())
        .await
        .unwrap();
    let run = manager.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.cursor, 2);
    assert_eq!(run.succeeded_count(), run.cursor);
    assert_eq!(run.result.unwrap().return_value::<i64>().unwrap(), 10);

    let statuses: Vec<(usize, StepStatus)> = run
        .step_history
        .iter()
        .map(|r| (r.step_index, r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (0, StepStatus::Pending),
            (0, StepStatus::Succeeded),
            (1, StepStatus::Pending),
            (1, StepStatus::Succeeded),
        ]
    );
}

#[tokio::test]
async fn run_without_callback_is_marked_settled() {
    let manager = manager();
    manager.define(add_then_double()).unwrap();

    let run_id = manager
        .start(&Numbers { value: 0 }, StartOptions::new())
        .await
        .unwrap();
    let run = manager.wait(&run_id).await.unwrap();

    assert!(run.on_complete.is_none());
    assert!(run.on_complete_fired);
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn completion_handler_receives_result_and_context() {
    let manager = manager();
    manager.define(add_then_double()).unwrap();
    let recorder = Recorder::new("numbers_done");
    manager.register_handler(recorder.clone());

    let options =
        StartOptions::on_complete("numbers_done", &serde_json::json!({ "order": 7 })).unwrap();
    let run_id = manager.start(&Numbers { value: 1 }, options).await.unwrap();
    manager.wait(&run_id).await.unwrap();

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].workflow_id, run_id);
    assert_eq!(
        events[0].result,
        RunResult::Success {
            return_value: serde_json::json!(4)
        }
    );
    assert_eq!(events[0].context["order"], 7);
}

// --- Start validation ---

#[tokio::test]
async fn unknown_definition_is_rejected() {
    let manager = manager();
    let err = manager
        .start_named("nope", serde_json::json!({}), StartOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::UnknownDefinition(ref n) if n == "nope"));
    assert!(manager.list_runs(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn unregistered_handler_is_rejected() {
    let manager = manager();
    manager.define(add_then_double()).unwrap();

    let options = StartOptions::on_complete("missing", &serde_json::json!({})).unwrap();
    let err = manager
        .start(&Numbers { value: 1 }, options)
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::UnknownHandler(_)));
}

#[tokio::test]
async fn duplicate_and_empty_definitions_are_rejected() {
    let manager = manager();
    manager.define(add_then_double()).unwrap();

    assert!(matches!(
        manager.define(add_then_double()),
        Err(WorkflowError::DuplicateDefinition(_))
    ));
    assert!(matches!(
        manager.define(WorkflowDefinition::builder::<Boom>().build()),
        Err(WorkflowError::EmptyDefinition(_))
    ));
}

// --- Failures ---

#[tokio::test]
async fn step_error_fails_run_with_message() {
    let manager = manager();
    manager
        .define(
            WorkflowDefinition::builder::<Boom>()
                .action("explode", RetryPolicy::once(), |_args, _input| async move {
                    Err::<(), _>(anyhow!("no fuel"))
                })
                .build(),
        )
        .unwrap();
    let recorder = Recorder::new("boom_done");
    manager.register_handler(recorder.clone());

    let options = StartOptions::on_complete("boom_done", &()).unwrap();
    let run_id = manager.start(&Boom, options).await.unwrap();
    let run = manager.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.cursor, 0);
    match run.result.unwrap() {
        RunResult::Error { error } => {
            assert_eq!(error, "Step 'explode' failed after 1 attempts: no fuel");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(recorder.events().len(), 1);
}

#[tokio::test]
async fn panicking_step_is_a_failure() {
    let manager = manager();
    manager
        .define(
            WorkflowDefinition::builder::<Boom>()
                .action("panic", RetryPolicy::once(), |_args, _input| async move {
                    if true {
                        panic!("wires crossed");
                    }
                    Ok(())
                })
                .build(),
        )
        .unwrap();

    let run_id = manager.start(&Boom, StartOptions::new()).await.unwrap();
    let run = manager.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let err = run.last_error().unwrap();
    assert!(err.contains("panicked"), "got: {}", err);
    assert!(err.contains("wires crossed"), "got: {}", err);
}

#[tokio::test(start_paused = true)]
async fn step_timeout_is_a_failure() {
    let manager = manager();
    manager
        .define(
            WorkflowDefinition::builder::<Sleepy>()
                .action("nap", RetryPolicy::once(), |args, _input| async move {
                    tokio::time::sleep(Duration::from_millis(args.ms)).await;
                    Ok(())
                })
                .timeout(Duration::from_millis(50))
                .build(),
        )
        .unwrap();

    let run_id = manager
        .start(&Sleepy { ms: 10_000 }, StartOptions::new())
        .await
        .unwrap();
    let run = manager.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.last_error().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn default_timeout_applies_to_steps_without_one() {
    let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
    let manager = WorkflowManager::with_executor(
        journal,
        Arc::new(WorkPools::default()),
        executor::StepExecutor::with_default_timeout(Duration::from_secs(1)),
    );
    manager.define(sleepy()).unwrap();

    let run_id = manager
        .start(&Sleepy { ms: 5_000 }, StartOptions::new())
        .await
        .unwrap();
    let run = manager.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.last_error().unwrap().contains("timed out after 1s"));
}

// --- Exactly-once completion ---

#[tokio::test]
async fn cancel_fires_canceled_once() {
    let manager = manager();
    manager.define(sleepy()).unwrap();
    let recorder = Recorder::new("sleepy_done");
    manager.register_handler(recorder.clone());

    let options = StartOptions::on_complete("sleepy_done", &()).unwrap();
    let run_id = manager
        .start(&Sleepy { ms: 60_000 }, options)
        .await
        .unwrap();

    assert!(manager.cancel(&run_id).await.unwrap());
    assert!(!manager.cancel(&run_id).await.unwrap());

    let run = manager.wait(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(run.result, Some(RunResult::Canceled));

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].result, RunResult::Canceled);
}

#[tokio::test]
async fn cancel_drops_in_flight_outcome_and_stops_remaining_steps() {
    let manager = manager();
    let second_ran = Arc::new(AtomicUsize::new(0));
    let counter = second_ran.clone();
    let started = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::new(tokio::sync::Notify::new());
    let (step_started, opened) = (started.clone(), gate.clone());

    manager
        .define(
            WorkflowDefinition::builder::<Sleepy>()
                .action("wait_for_gate", RetryPolicy::once(), move |_args, _input| {
                    let (started, gate) = (step_started.clone(), opened.clone());
                    async move {
                        started.notify_one();
                        gate.notified().await;
                        Ok("finished after cancel")
                    }
                })
                .action("never", RetryPolicy::once(), move |_args, _input| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .build(),
        )
        .unwrap();
    let recorder = Recorder::new("gate_done");
    manager.register_handler(recorder.clone());

    let options = StartOptions::on_complete("gate_done", &()).unwrap();
    let run_id = manager.start(&Sleepy { ms: 0 }, options).await.unwrap();
    started.notified().await;

    assert!(manager.cancel(&run_id).await.unwrap());
    let at_cancel = manager.get_run(&run_id).await.unwrap();
    assert_eq!(at_cancel.cursor, 0);
    assert_eq!(at_cancel.step_history.len(), 1);

    gate.notify_one();
    // Give the in-flight step time to finish and report back.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let run = manager.wait(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(run.cursor, 0);
    assert_eq!(run.step_history.len(), 1);
    assert_eq!(run.step_history[0].status, StepStatus::Pending);
    assert_eq!(second_ran.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.events().len(), 1);
}

#[tokio::test]
async fn saturated_low_pool_does_not_delay_high_workflows() {
    let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
    let pools = Arc::new(WorkPools::new(PoolConfig {
        high: 2,
        default: 1,
        low: 1,
    }));
    let manager = WorkflowManager::new(journal, pools);

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let held = gate.clone();
    manager
        .define(
            WorkflowDefinition::builder::<Sleepy>()
                .action("hold_low_slot", RetryPolicy::once(), move |_args, _input| {
                    let gate = held.clone();
                    async move {
                        let _permit = gate.acquire().await?;
                        Ok("released")
                    }
                })
                .build(),
        )
        .unwrap();
    manager
        .define(
            WorkflowDefinition::builder::<Boom>()
                .mutation("ping", RetryPolicy::once(), |_args, _input| async move {
                    Ok("pong")
                })
                .build(),
        )
        .unwrap();

    let mut low_runs = Vec::new();
    for _ in 0..3 {
        low_runs.push(
            manager
                .start(&Sleepy { ms: 0 }, StartOptions::new())
                .await
                .unwrap(),
        );
    }
    let low = manager.pools().get(PoolName::Low).stats();
    assert_eq!(low.running, 1);
    assert_eq!(low.queued, 2);

    let high_run = manager.start(&Boom, StartOptions::new()).await.unwrap();
    let run = tokio::time::timeout(Duration::from_secs(1), manager.wait(&high_run))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    for id in &low_runs {
        assert_eq!(
            manager.get_run(id).await.unwrap().status,
            RunStatus::Running
        );
    }

    gate.add_permits(low_runs.len());
    for id in &low_runs {
        assert_eq!(manager.wait(id).await.unwrap().status, RunStatus::Completed);
    }
}

#[tokio::test]
async fn failing_handler_is_not_refired() {
    let manager = manager();
    manager.define(add_then_double()).unwrap();
    let recorder = Recorder::failing("flaky_handler");
    manager.register_handler(recorder.clone());

    let options = StartOptions::on_complete("flaky_handler", &()).unwrap();
    let run_id = manager.start(&Numbers { value: 2 }, options).await.unwrap();
    let run = manager.wait(&run_id).await.unwrap();
    assert!(run.on_complete_fired);

    let report = manager.recover().await.unwrap();
    assert!(report.fired.is_empty());
    assert!(report.resumed.is_empty());
    assert_eq!(recorder.events().len(), 1);
}

#[tokio::test]
async fn list_runs_filters_by_status() {
    let manager = manager();
    manager.define(add_then_double()).unwrap();
    manager.define(sleepy()).unwrap();

    let done = manager
        .start(&Numbers { value: 1 }, StartOptions::new())
        .await
        .unwrap();
    manager.wait(&done).await.unwrap();
    let canceled = manager
        .start(&Sleepy { ms: 60_000 }, StartOptions::new())
        .await
        .unwrap();
    manager.cancel(&canceled).await.unwrap();

    let all = manager.list_runs(None).await.unwrap();
    assert_eq!(all.len(), 2);

    let completed = manager.list_runs(Some(RunStatus::Completed)).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, done);

    let canceled_runs = manager.list_runs(Some(RunStatus::Canceled)).await.unwrap();
    assert_eq!(canceled_runs.len(), 1);
    assert_eq!(canceled_runs[0].id, canceled);
}
