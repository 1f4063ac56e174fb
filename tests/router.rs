//! Router Integration Tests
//!
//! Lane isolation under backpressure, idempotent submission, and retry
//! budget behavior, exercised through the public TaskRouter API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use verdict::router::{
    ClassConfig, ResourceClass, RetryPolicy, RouterConfig, RouterError, TaskRouter, WorkExecutor,
    WorkItem, WorkOutcome, WorkPayload,
};

/// Executor that stalls fallback work until the test releases it and counts
/// every execution per payload kind
struct GatedExecutor {
    notify_runs: AtomicU32,
    fallback_runs: AtomicU32,
    gate: tokio::sync::Notify,
}

impl GatedExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            notify_runs: AtomicU32::new(0),
            fallback_runs: AtomicU32::new(0),
            gate: tokio::sync::Notify::new(),
        })
    }
}

#[async_trait]
impl WorkExecutor for GatedExecutor {
    async fn execute(&self, payload: &WorkPayload) -> Result<WorkOutcome> {
        match payload {
            WorkPayload::Notify { .. } => {
                self.notify_runs.fetch_add(1, Ordering::SeqCst);
                Ok(WorkOutcome::Completed)
            }
            WorkPayload::Fallback { .. } => {
                self.fallback_runs.fetch_add(1, Ordering::SeqCst);
                self.gate.notified().await;
                Ok(WorkOutcome::Completed)
            }
            WorkPayload::AuditWrite { .. } => Ok(WorkOutcome::Completed),
        }
    }
}

/// Executor failing a fixed number of times before succeeding
struct FlakyExecutor {
    runs: AtomicU32,
    failures: u32,
}

impl FlakyExecutor {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicU32::new(0),
            failures,
        })
    }
}

#[async_trait]
impl WorkExecutor for FlakyExecutor {
    async fn execute(&self, _payload: &WorkPayload) -> Result<WorkOutcome> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if run < self.failures {
            anyhow::bail!("transient failure {}", run + 1);
        }
        Ok(WorkOutcome::Completed)
    }
}

fn notify_item(key: &str) -> WorkItem {
    WorkItem {
        class: ResourceClass::Notify,
        idempotency_key: key.to_string(),
        payload: WorkPayload::Notify {
            approver: "alice".to_string(),
            summary: "ping".to_string(),
        },
        retry: RetryPolicy::default(),
    }
}

fn fallback_item(key: &str) -> WorkItem {
    WorkItem {
        class: ResourceClass::FallbackDecision,
        idempotency_key: key.to_string(),
        payload: WorkPayload::Fallback {
            request_id: uuid::Uuid::new_v4(),
            subject: "subject".to_string(),
        },
        retry: RetryPolicy::default(),
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay_ms: 5,
        max_delay_ms: 20,
        backoff_multiplier: 2.0,
    }
}

#[tokio::test]
async fn test_backpressure_isolated_per_class() {
    // One worker, one queue slot for the fallback lane
    let config = RouterConfig {
        fallback: ClassConfig {
            queue_capacity: 1,
            workers: 1,
            retry: RetryPolicy::default(),
        },
        ..RouterConfig::default()
    };
    let executor = GatedExecutor::new();
    let router = TaskRouter::new(config, executor.clone());

    // Saturate the fallback lane: one executing behind the gate, one held
    // by the dispatcher waiting for a worker slot, one queued.
    let mut pending = Vec::new();
    for i in 0..3 {
        pending.push(router.submit(fallback_item(&format!("fb-{}", i))).unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let overflow = router.submit(fallback_item("fb-overflow"));
    assert!(matches!(
        overflow,
        Err(RouterError::Backpressure(ResourceClass::FallbackDecision))
    ));

    // The notify lane is unaffected by fallback saturation
    let outcome = router.submit_and_wait(notify_item("n-1")).await.unwrap();
    assert!(matches!(outcome, WorkOutcome::Completed));
    assert_eq!(executor.notify_runs.load(Ordering::SeqCst), 1);

    // Releasing the gate one job at a time drains the saturated lane
    for completion in pending {
        executor.gate.notify_one();
        let outcome = completion.await.unwrap().unwrap();
        assert!(matches!(outcome, WorkOutcome::Completed));
    }
    assert_eq!(executor.fallback_runs.load(Ordering::SeqCst), 3);

    // A rejected key was forgotten, so resubmission is accepted
    executor.gate.notify_one();
    let outcome = router
        .submit_and_wait(fallback_item("fb-overflow"))
        .await
        .unwrap();
    assert!(matches!(outcome, WorkOutcome::Completed));
}

#[tokio::test]
async fn test_duplicate_key_runs_effect_once() {
    let executor = GatedExecutor::new();
    let router = TaskRouter::new(RouterConfig::default(), executor.clone());

    let first = router.submit(fallback_item("same-key")).unwrap();

    // Second submission lands while the first is in flight
    let dup = router.submit_and_wait(fallback_item("same-key")).await.unwrap();
    assert!(matches!(dup, WorkOutcome::Duplicate));

    executor.gate.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, WorkOutcome::Completed));

    // Third submission lands after completion, within the dedup window
    let dup = router.submit_and_wait(fallback_item("same-key")).await.unwrap();
    assert!(matches!(dup, WorkOutcome::Duplicate));

    assert_eq!(executor.fallback_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_recovers_from_transient_failures() {
    let executor = FlakyExecutor::new(2);
    let router = TaskRouter::new(RouterConfig::default(), executor.clone());

    let mut item = notify_item("flaky");
    item.retry = fast_retry(3);

    let outcome = router.submit_and_wait(item).await.unwrap();
    assert!(matches!(outcome, WorkOutcome::Completed));
    assert_eq!(executor.runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_exhausted_budget_reports_last_error() {
    let executor = FlakyExecutor::new(u32::MAX);
    let router = TaskRouter::new(RouterConfig::default(), executor.clone());

    let mut item = notify_item("doomed");
    item.retry = fast_retry(2);

    let result = router.submit_and_wait(item).await;
    match result {
        Err(RouterError::Exhausted {
            class,
            attempts,
            last_error,
        }) => {
            assert_eq!(class, ResourceClass::Notify);
            assert_eq!(attempts, 2);
            assert!(last_error.contains("transient failure 2"));
        }
        other => panic!("expected Exhausted, got {:?}", other),
    }
    assert_eq!(executor.runs.load(Ordering::SeqCst), 2);

    // Exhaustion releases the key: a later submission runs again
    let mut item = notify_item("doomed");
    item.retry = fast_retry(1);
    assert!(router.submit_and_wait(item).await.is_err());
    assert_eq!(executor.runs.load(Ordering::SeqCst), 3);
}
