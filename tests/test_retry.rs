//! Retry policy arithmetic and backoff behaviour under a paused clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use detailflow::engine::retry::Transition;
use detailflow::engine::types::*;
use detailflow::engine::*;
use detailflow::storage::Journal;
use detailflow::storage::memory_store::MemoryJournal;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Flaky {
    succeed_on: u32,
}

impl WorkflowArgs for Flaky {
    const NAME: &'static str = "flaky";
    const POOL: PoolName = PoolName::Default;
}

fn manager() -> WorkflowManager {
    let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
    WorkflowManager::new(journal, Arc::new(WorkPools::default()))
}

/// One step that fails until attempt `succeed_on`, recording when each
/// attempt started.
fn flaky(policy: RetryPolicy, started: Arc<Mutex<Vec<Instant>>>) -> WorkflowDefinition {
    WorkflowDefinition::builder::<Flaky>()
        .action("flaky_call", policy, move |args, input| {
            let started = started.clone();
            async move {
                started.lock().unwrap().push(Instant::now());
                if input.attempt < args.succeed_on {
                    return Err(anyhow!("attempt {} failed", input.attempt));
                }
                Ok(input.attempt)
            }
        })
        .build()
}

// --- Policy arithmetic ---

#[test]
fn delays_grow_geometrically() {
    let policy = RetryPolicy::new(3, 1000, 2.0);
    assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
    assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
    assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
}

#[test]
fn reminder_policy_backs_off_in_minutes() {
    let policy = RetryPolicy::new(3, 60_000, 2.0);
    assert_eq!(policy.delay_for(1), Duration::from_secs(60));
    assert_eq!(policy.delay_for(2), Duration::from_secs(120));
}

#[test]
fn transitions_follow_attempt_budget() {
    let policy = RetryPolicy::new(3, 1000, 2.0);
    assert_eq!(policy.transition(1, true), Transition::Advance);
    assert_eq!(
        policy.transition(1, false),
        Transition::RetryAfter(Duration::from_millis(1000))
    );
    assert_eq!(
        policy.transition(2, false),
        Transition::RetryAfter(Duration::from_millis(2000))
    );
    assert_eq!(policy.transition(3, false), Transition::Exhausted);
}

#[test]
fn zero_attempts_means_one() {
    let policy = RetryPolicy::new(0, 1000, 2.0);
    assert_eq!(policy.max_attempts, 1);
    assert_eq!(policy.transition(1, false), Transition::Exhausted);
    assert_eq!(RetryPolicy::once().max_attempts, 1);
}

// --- Engine behaviour ---

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_run_after_backoff() {
    let manager = manager();
    let started = Arc::new(Mutex::new(Vec::new()));
    manager
        .define(flaky(RetryPolicy::new(3, 1000, 2.0), started.clone()))
        .unwrap();

    let run_id = manager
        .start(&Flaky { succeed_on: 99 }, StartOptions::new())
        .await
        .unwrap();
    let run = manager.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_attempts(0), 3);
    assert_eq!(run.cursor, 0);
    assert_eq!(
        run.last_error(),
        Some("attempt 3 failed"),
        "last journaled failure is the final attempt"
    );
    match run.result.unwrap() {
        RunResult::Error { error } => {
            assert_eq!(
                error,
                "Step 'flaky_call' failed after 3 attempts: attempt 3 failed"
            );
        }
        other => panic!("unexpected result: {:?}", other),
    }

    let started = started.lock().unwrap().clone();
    assert_eq!(started.len(), 3);
    let first_gap = started[1] - started[0];
    let second_gap = started[2] - started[1];
    assert!(first_gap >= Duration::from_millis(1000), "{:?}", first_gap);
    assert!(first_gap < Duration::from_millis(1100), "{:?}", first_gap);
    assert!(second_gap >= Duration::from_millis(2000), "{:?}", second_gap);
    assert!(second_gap < Duration::from_millis(2100), "{:?}", second_gap);
}

#[tokio::test(start_paused = true)]
async fn retry_succeeds_within_budget() {
    let manager = manager();
    let started = Arc::new(Mutex::new(Vec::new()));
    manager
        .define(flaky(RetryPolicy::new(3, 1000, 2.0), started.clone()))
        .unwrap();

    let run_id = manager
        .start(&Flaky { succeed_on: 2 }, StartOptions::new())
        .await
        .unwrap();
    let run = manager.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.cursor, 1);
    assert_eq!(run.failed_attempts(0), 1);
    assert_eq!(run.result.unwrap().return_value::<u32>().unwrap(), 2);
    assert_eq!(started.lock().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn backoff_does_not_hold_a_pool_slot() {
    let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
    let pools = Arc::new(WorkPools::new(PoolConfig {
        high: 1,
        default: 1,
        low: 1,
    }));
    let manager = WorkflowManager::new(journal, pools);

    let started = Arc::new(Mutex::new(Vec::new()));
    manager
        .define(flaky(RetryPolicy::new(2, 10_000, 2.0), started.clone()))
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Quick;
    impl WorkflowArgs for Quick {
        const NAME: &'static str = "quick";
        const POOL: PoolName = PoolName::Default;
    }
    manager
        .define(
            WorkflowDefinition::builder::<Quick>()
                .action("quick", RetryPolicy::once(), move |_args, _input| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .build(),
        )
        .unwrap();

    let slow = manager
        .start(&Flaky { succeed_on: 2 }, StartOptions::new())
        .await
        .unwrap();
    // Let the first attempt fail and enter its 10s backoff.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let before = Instant::now();
    let quick = manager.start(&Quick, StartOptions::new()).await.unwrap();
    let quick_run = manager.wait(&quick).await.unwrap();
    assert_eq!(quick_run.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Instant::now() - before < Duration::from_secs(10));

    let slow_run = manager.wait(&slow).await.unwrap();
    assert_eq!(slow_run.status, RunStatus::Completed);
}
