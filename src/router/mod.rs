//! Resource-class task routing for side-effecting work items.
//!
//! The orchestrator never performs side effects directly; it emits WorkItems
//! tagged with a resource class, and the router delivers each to the worker
//! lane for that class. Lanes are isolated: every class has its own bounded
//! queue and its own concurrency limit, so a failure storm in one class
//! cannot delay the others. Queue-full is a Backpressure rejection, never an
//! unbounded buffer, and an item that exhausts its retry budget is reported
//! back to the submitter, never silently dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::adapters::FallbackDecision;
use crate::domain::AuditEntry;

/// Categories of side-effecting work, each with its own lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Approver notifications
    Notify,

    /// Automated decision generation
    FallbackDecision,

    /// Audit trail appends
    AuditWrite,
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Notify => "notify",
            Self::FallbackDecision => "fallback_decision",
            Self::AuditWrite => "audit_write",
        };
        write!(f, "{}", s)
    }
}

/// Retry policy for failed work items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    250
}
fn default_max_delay() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// The side effect a work item carries
#[derive(Debug, Clone)]
pub enum WorkPayload {
    /// Ask an approver to respond
    Notify { approver: String, summary: String },

    /// Invoke the automated decision generator
    Fallback { request_id: Uuid, subject: String },

    /// Append an entry to the audit trail
    AuditWrite { entry: AuditEntry },
}

/// Unit of work dispatched to a lane
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Lane selector
    pub class: ResourceClass,

    /// Deterministic key collapsing duplicate deliveries into one effect
    pub idempotency_key: String,

    /// The side effect to perform
    pub payload: WorkPayload,

    /// Per-item retry budget
    pub retry: RetryPolicy,
}

/// What a completed work item produced
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    /// Effect performed
    Completed,

    /// Fallback generator produced a decision
    Fallback(FallbackDecision),

    /// Collapsed onto an earlier submission with the same idempotency key
    Duplicate,
}

/// Errors surfaced by the router
#[derive(Debug, Clone, Error)]
pub enum RouterError {
    #[error("queue full for resource class {0}")]
    Backpressure(ResourceClass),

    #[error("work item exhausted retry budget after {attempts} attempts on {class}: {last_error}")]
    Exhausted {
        class: ResourceClass,
        attempts: u32,
        last_error: String,
    },

    #[error("router is shut down")]
    Closed,
}

/// Executes the actual side effect of a work item.
///
/// The router owns queuing, concurrency, retries and dedup; what "perform
/// this payload" means is injected, so tests can substitute recorders.
#[async_trait::async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, payload: &WorkPayload) -> anyhow::Result<WorkOutcome>;
}

/// Tuning for one resource class lane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassConfig {
    /// Bounded queue depth; submissions beyond this get Backpressure
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum concurrently executing items for this class
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retry budget applied to items in this class
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_queue_capacity() -> usize {
    256
}
fn default_workers() -> usize {
    4
}

impl Default for ClassConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Router configuration, one lane per resource class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub notify: ClassConfig,

    #[serde(default = "default_fallback_class")]
    pub fallback: ClassConfig,

    #[serde(default = "default_audit_class")]
    pub audit: ClassConfig,

    /// How long completed idempotency keys are remembered, in seconds
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
}

fn default_fallback_class() -> ClassConfig {
    ClassConfig {
        retry: RetryPolicy {
            max_attempts: 4,
            ..RetryPolicy::default()
        },
        ..ClassConfig::default()
    }
}

// Audit completeness is a correctness invariant; audit writes get a higher
// retry ceiling than notifications.
fn default_audit_class() -> ClassConfig {
    ClassConfig {
        retry: RetryPolicy {
            max_attempts: 8,
            initial_delay_ms: 50,
            ..RetryPolicy::default()
        },
        ..ClassConfig::default()
    }
}

fn default_dedup_window() -> u64 {
    300
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            notify: ClassConfig::default(),
            fallback: default_fallback_class(),
            audit: default_audit_class(),
            dedup_window_secs: default_dedup_window(),
        }
    }
}

impl RouterConfig {
    fn class(&self, class: ResourceClass) -> &ClassConfig {
        match class {
            ResourceClass::Notify => &self.notify,
            ResourceClass::FallbackDecision => &self.fallback,
            ResourceClass::AuditWrite => &self.audit,
        }
    }

    /// Retry budget configured for a class
    pub fn retry_for(&self, class: ResourceClass) -> RetryPolicy {
        self.class(class).retry.clone()
    }
}

/// Completion future for a submitted work item
pub type Completion = oneshot::Receiver<Result<WorkOutcome, RouterError>>;

struct Job {
    item: WorkItem,
    done: oneshot::Sender<Result<WorkOutcome, RouterError>>,
}

enum DedupState {
    InFlight,
    Completed { at: Instant },
}

type DedupMap = Arc<Mutex<HashMap<String, DedupState>>>;

/// Dispatches work items to per-class worker lanes
pub struct TaskRouter {
    lanes: HashMap<ResourceClass, mpsc::Sender<Job>>,
    dedup: DedupMap,
    dedup_window: Duration,
    config: RouterConfig,
}

impl TaskRouter {
    /// Spawn the worker lanes and return the router
    pub fn new(config: RouterConfig, executor: Arc<dyn WorkExecutor>) -> Self {
        let dedup: DedupMap = Arc::new(Mutex::new(HashMap::new()));
        let mut lanes = HashMap::new();

        for class in [
            ResourceClass::Notify,
            ResourceClass::FallbackDecision,
            ResourceClass::AuditWrite,
        ] {
            let lane = spawn_lane(class, config.class(class), executor.clone(), dedup.clone());
            lanes.insert(class, lane);
        }

        Self {
            lanes,
            dedup,
            dedup_window: Duration::from_secs(config.dedup_window_secs),
            config,
        }
    }

    /// Retry budget configured for a class
    pub fn retry_for(&self, class: ResourceClass) -> RetryPolicy {
        self.config.retry_for(class)
    }

    /// Submit a work item to its lane.
    ///
    /// Returns a completion future immediately, or Backpressure if the
    /// class's queue is full. Duplicate idempotency keys (in flight, or
    /// completed within the dedup window) resolve to Duplicate without a
    /// second effect.
    pub fn submit(&self, item: WorkItem) -> Result<Completion, RouterError> {
        let (done, completion) = oneshot::channel();

        {
            let mut dedup = self.dedup.lock().unwrap_or_else(|e| e.into_inner());
            prune_dedup(&mut dedup, self.dedup_window);

            if dedup.contains_key(&item.idempotency_key) {
                debug!(key = %item.idempotency_key, class = %item.class, "duplicate work item collapsed");
                let _ = done.send(Ok(WorkOutcome::Duplicate));
                return Ok(completion);
            }

            dedup.insert(item.idempotency_key.clone(), DedupState::InFlight);
        }

        let lane = self.lanes.get(&item.class).ok_or(RouterError::Closed)?;
        let key = item.idempotency_key.clone();
        let class = item.class;

        match lane.try_send(Job { item, done }) {
            Ok(()) => Ok(completion),
            Err(e) => {
                let mut dedup = self.dedup.lock().unwrap_or_else(|p| p.into_inner());
                dedup.remove(&key);

                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        warn!(%class, "lane queue full, rejecting submission");
                        Err(RouterError::Backpressure(class))
                    }
                    mpsc::error::TrySendError::Closed(_) => Err(RouterError::Closed),
                }
            }
        }
    }

    /// Submit and await the item's terminal outcome
    pub async fn submit_and_wait(&self, item: WorkItem) -> Result<WorkOutcome, RouterError> {
        let completion = self.submit(item)?;
        completion.await.map_err(|_| RouterError::Closed)?
    }
}

fn spawn_lane(
    class: ResourceClass,
    config: &ClassConfig,
    executor: Arc<dyn WorkExecutor>,
    dedup: DedupMap,
) -> mpsc::Sender<Job> {
    let (tx, mut rx) = mpsc::channel::<Job>(config.queue_capacity);
    let semaphore = Arc::new(Semaphore::new(config.workers));

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let executor = executor.clone();
            let dedup = dedup.clone();

            tokio::spawn(async move {
                run_job(class, job, executor, dedup).await;
                drop(permit);
            });
        }

        debug!(%class, "lane shut down");
    });

    tx
}

async fn run_job(class: ResourceClass, job: Job, executor: Arc<dyn WorkExecutor>, dedup: DedupMap) {
    let Job { item, done } = job;
    let mut attempt = 0u32;

    let result = loop {
        attempt += 1;

        match executor.execute(&item.payload).await {
            Ok(outcome) => break Ok(outcome),
            Err(e) if item.retry.should_retry(attempt) => {
                let delay = item.retry.delay_for_attempt(attempt);
                warn!(
                    %class,
                    key = %item.idempotency_key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "work item failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    %class,
                    key = %item.idempotency_key,
                    attempt,
                    error = %e,
                    "work item failed permanently"
                );
                break Err(RouterError::Exhausted {
                    class,
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
        }
    };

    {
        let mut dedup = dedup.lock().unwrap_or_else(|e| e.into_inner());
        match &result {
            // Remember the key so redelivery within the window is a no-op
            Ok(_) => {
                dedup.insert(
                    item.idempotency_key.clone(),
                    DedupState::Completed { at: Instant::now() },
                );
            }
            // Forget failed keys so a deliberate resubmission can run
            Err(_) => {
                dedup.remove(&item.idempotency_key);
            }
        }
    }

    let _ = done.send(result);
}

fn prune_dedup(dedup: &mut HashMap<String, DedupState>, window: Duration) {
    dedup.retain(|_, state| match state {
        DedupState::InFlight => true,
        DedupState::Completed { at } => at.elapsed() < window,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_retry_policy_budget() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_audit_class_outranks_notify_on_retries() {
        let config = RouterConfig::default();

        assert!(
            config.retry_for(ResourceClass::AuditWrite).max_attempts
                > config.retry_for(ResourceClass::Notify).max_attempts
        );
    }

    #[test]
    fn test_dedup_prune_keeps_in_flight() {
        let mut dedup = HashMap::new();
        dedup.insert("a".to_string(), DedupState::InFlight);
        dedup.insert(
            "b".to_string(),
            DedupState::Completed { at: Instant::now() },
        );

        prune_dedup(&mut dedup, Duration::from_secs(0));

        assert!(dedup.contains_key("a"));
        assert!(!dedup.contains_key("b"));
    }
}
