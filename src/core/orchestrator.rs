//! Decision orchestrator: the single-writer driver loop for one request.
//!
//! Each live request gets exactly one orchestrator task. The task owns the
//! DecisionState, serializes all events against it, schedules the current
//! tier's timer, and applies policy-emitted effects through the task router.
//! Everyone else interacts through the inbox (signals, fallback results) or
//! the snapshot channel (queries, which never block on pending work).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::adapters::FallbackDecision;
use crate::domain::{
    AuditEntry, AuditEventType, DecisionRequest, DecisionState, DecisionStatus, Signal, TierCursor,
};
use crate::router::{ResourceClass, RouterError, TaskRouter, WorkItem, WorkOutcome, WorkPayload};

use super::policy::{self, Effect, PolicyEvent};

/// Depth of the per-request inbox
const INBOX_CAPACITY: usize = 64;

/// Spacing between re-submissions when a lane reports Backpressure
const BACKPRESSURE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Events delivered into a request's inbox
#[derive(Debug)]
pub enum InboxEvent {
    /// A human responded (possibly a duplicate delivery)
    Signal(Signal),

    /// The automated generator produced a decision
    FallbackCompleted(FallbackDecision),

    /// The automated generator failed past its retry budget
    FallbackFailed { error: String },
}

/// Handle to a live orchestrator: signal delivery plus non-blocking queries
#[derive(Clone)]
pub struct OrchestratorHandle {
    inbox: mpsc::Sender<InboxEvent>,
    snapshot: watch::Receiver<DecisionState>,
}

impl OrchestratorHandle {
    /// Deliver an event into the request's inbox
    pub async fn deliver(&self, event: InboxEvent) -> bool {
        self.inbox.send(event).await.is_ok()
    }

    /// Snapshot of the current state; never blocks on pending work
    pub fn snapshot(&self) -> DecisionState {
        self.snapshot.borrow().clone()
    }
}

/// Single-writer driver for one decision request
pub struct Orchestrator {
    state: DecisionState,
    inbox: mpsc::Receiver<InboxEvent>,
    inbox_tx: mpsc::Sender<InboxEvent>,
    snapshot: watch::Sender<DecisionState>,
    router: Arc<TaskRouter>,

    /// Dedup keys of signals already processed (at-least-once delivery guard)
    seen_signals: HashSet<String>,

    /// Effects to apply before entering the event loop
    initial_effects: Vec<Effect>,
}

impl Orchestrator {
    /// Build an orchestrator for a freshly created request
    pub fn create(request: &DecisionRequest, router: Arc<TaskRouter>) -> (Self, OrchestratorHandle) {
        let (state, effects) = policy::bootstrap(request);
        Self::build(state, effects, router)
    }

    /// Build an orchestrator resuming a recovered, non-terminal state.
    ///
    /// A request that crashed after FALLBACK_INVOKED but before RESOLVED gets
    /// its fallback work item re-submitted. A cursor pointing past the tier
    /// list (a zero-tier request that crashed before FALLBACK_INVOKED
    /// landed) is fallback-pending too: there is no tier to time out, so
    /// without re-emitting the invocation the request would park forever.
    /// The ordinary tier case needs nothing extra because the driver
    /// recomputes the remaining timeout from `tier_entered_at` on every
    /// iteration.
    pub fn resume(
        mut state: DecisionState,
        router: Arc<TaskRouter>,
    ) -> (Self, OrchestratorHandle) {
        let effects = if state.is_terminal() || state.resolution.is_some() {
            Vec::new()
        } else {
            match state.cursor {
                TierCursor::Fallback => vec![Effect::InvokeFallback],
                TierCursor::Tier(i) if i >= state.tiers.len() => {
                    state.cursor = TierCursor::Fallback;
                    state.status = DecisionStatus::Escalating;
                    vec![
                        Effect::Audit {
                            event_type: AuditEventType::FallbackInvoked,
                            payload: serde_json::json!({}),
                        },
                        Effect::InvokeFallback,
                    ]
                }
                TierCursor::Tier(_) => Vec::new(),
            }
        };
        Self::build(state, effects, router)
    }

    fn build(
        state: DecisionState,
        initial_effects: Vec<Effect>,
        router: Arc<TaskRouter>,
    ) -> (Self, OrchestratorHandle) {
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());

        let handle = OrchestratorHandle {
            inbox: inbox_tx.clone(),
            snapshot: snapshot_rx,
        };

        let orchestrator = Self {
            state,
            inbox,
            inbox_tx,
            snapshot: snapshot_tx,
            router,
            seen_signals: HashSet::new(),
            initial_effects,
        };

        (orchestrator, handle)
    }

    /// Drive the request to a terminal state
    #[instrument(skip(self), fields(request_id = %self.state.request_id))]
    pub async fn run(mut self) -> Result<DecisionState> {
        info!(status = ?self.state.status, "decision orchestrator starting");

        let initial = std::mem::take(&mut self.initial_effects);
        self.apply_effects(initial).await?;
        self.publish();

        while !self.state.is_terminal() {
            let Some(event) = self.wait_for_event().await else {
                warn!("inbox closed before terminal state, parking request");
                break;
            };

            if let PolicyEvent::SignalReceived(signal) = &event {
                if !self.record_signal(signal) {
                    debug!(approver = %signal.approver, "duplicate signal delivery ignored");
                    continue;
                }
            }

            let (new_state, effects) = policy::next(&self.state, &event, Utc::now());
            self.state = new_state;
            self.apply_effects(effects).await?;
            self.publish();
        }

        self.drain_inbox().await?;

        info!(status = ?self.state.status, "decision orchestrator retiring");
        Ok(self.state)
    }

    /// Process signals that raced the terminal transition so they still land
    /// on the audit record as ignored entries.
    async fn drain_inbox(&mut self) -> Result<()> {
        self.inbox.close();

        while let Ok(event) = self.inbox.try_recv() {
            if let InboxEvent::Signal(signal) = event {
                if !self.record_signal(&signal) {
                    continue;
                }
                let (state, effects) = policy::next(
                    &self.state,
                    &PolicyEvent::SignalReceived(signal),
                    Utc::now(),
                );
                self.state = state;
                self.apply_effects(effects).await?;
            }
        }

        self.publish();
        Ok(())
    }

    /// Await the next event for this request.
    ///
    /// While a tier timer is live the wait races the inbox against the
    /// deadline. The select is biased toward the inbox: when a signal and an
    /// expired timer are both ready in the same step, the signal wins and the
    /// timer event is never produced.
    async fn wait_for_event(&mut self) -> Option<PolicyEvent> {
        let deadline = match self.state.cursor {
            TierCursor::Tier(_) if self.state.resolution.is_none() => {
                self.state.current_deadline()
            }
            _ => None,
        };

        match deadline {
            Some(deadline) => {
                let remaining = (deadline - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                tokio::select! {
                    biased;
                    event = self.inbox.recv() => event.map(PolicyEvent::from),
                    _ = tokio::time::sleep(remaining) => Some(PolicyEvent::TimerFired),
                }
            }
            None => self.inbox.recv().await.map(PolicyEvent::from),
        }
    }

    /// Record a signal's dedup key; false if this delivery was already seen
    fn record_signal(&mut self, signal: &Signal) -> bool {
        self.seen_signals.insert(signal_dedup_key(signal))
    }

    async fn apply_effects(&mut self, effects: Vec<Effect>) -> Result<()> {
        // Sequence of the most recent audit entry; notify and fallback work
        // items derive their idempotency keys from it.
        let mut last_sequence = self.state.next_sequence.saturating_sub(1);

        for effect in effects {
            match effect {
                Effect::Audit { event_type, payload } => {
                    let sequence = self.state.next_sequence;
                    let entry =
                        AuditEntry::new(self.state.request_id, sequence, event_type, payload);

                    self.append_audit(entry).await?;

                    self.state.next_sequence = sequence + 1;
                    last_sequence = sequence;
                }

                Effect::Notify { approver } => {
                    self.dispatch_notify(&approver, last_sequence);
                }

                Effect::InvokeFallback => {
                    self.dispatch_fallback(last_sequence);
                }
            }
        }

        Ok(())
    }

    /// Append one audit entry via the router, awaiting completion so the
    /// trail stays ordered. Backpressure is retried; a duplicate-delivery
    /// SequenceConflict surfaces as success inside the audit worker.
    async fn append_audit(&self, entry: AuditEntry) -> Result<()> {
        let item = WorkItem {
            class: ResourceClass::AuditWrite,
            idempotency_key: audit_idempotency_key(&entry),
            payload: WorkPayload::AuditWrite { entry },
            retry: self.router.retry_for(ResourceClass::AuditWrite),
        };

        loop {
            match self.router.submit(item.clone()) {
                Ok(completion) => {
                    completion
                        .await
                        .map_err(|_| RouterError::Closed)?
                        .context("audit write failed past retry budget")?;
                    return Ok(());
                }
                Err(RouterError::Backpressure(class)) => {
                    debug!(%class, "audit lane full, waiting to resubmit");
                    tokio::time::sleep(BACKPRESSURE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e).context("audit write submission failed"),
            }
        }
    }

    /// Submit a notification without blocking the driver on its completion.
    /// A missed notification is degraded UX, not a correctness violation.
    fn dispatch_notify(&self, approver: &str, sequence: u64) {
        let item = WorkItem {
            class: ResourceClass::Notify,
            idempotency_key: format!("{}:{}:notify", self.state.request_id, sequence),
            payload: WorkPayload::Notify {
                approver: approver.to_string(),
                summary: format!(
                    "Decision {} awaiting your response: {}",
                    self.state.request_id, self.state.subject
                ),
            },
            retry: self.router.retry_for(ResourceClass::Notify),
        };

        let approver = approver.to_string();
        match self.router.submit(item) {
            Ok(completion) => {
                tokio::spawn(async move {
                    match completion.await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(%approver, error = %e, "notification failed"),
                        Err(_) => warn!(%approver, "notification lane dropped the item"),
                    }
                });
            }
            Err(e) => warn!(%approver, error = %e, "notification submission rejected"),
        }
    }

    /// Submit the fallback work item; its result comes back through the
    /// inbox like any other event.
    fn dispatch_fallback(&self, sequence: u64) {
        let item = WorkItem {
            class: ResourceClass::FallbackDecision,
            idempotency_key: format!("{}:{}:fallback_decision", self.state.request_id, sequence),
            payload: WorkPayload::Fallback {
                request_id: self.state.request_id,
                subject: self.state.subject.clone(),
            },
            retry: self.router.retry_for(ResourceClass::FallbackDecision),
        };

        let router = self.router.clone();
        let inbox = self.inbox_tx.clone();

        tokio::spawn(async move {
            let completion = loop {
                match router.submit(item.clone()) {
                    Ok(completion) => break completion,
                    Err(RouterError::Backpressure(class)) => {
                        debug!(%class, "fallback lane full, waiting to resubmit");
                        tokio::time::sleep(BACKPRESSURE_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        let _ = inbox
                            .send(InboxEvent::FallbackFailed { error: e.to_string() })
                            .await;
                        return;
                    }
                }
            };

            let event = match completion.await {
                Ok(Ok(WorkOutcome::Fallback(decision))) => InboxEvent::FallbackCompleted(decision),
                // Collapsed onto an in-flight submission; that one reports
                Ok(Ok(WorkOutcome::Duplicate)) => return,
                Ok(Ok(WorkOutcome::Completed)) => InboxEvent::FallbackFailed {
                    error: "generator returned no decision".to_string(),
                },
                Ok(Err(e)) => InboxEvent::FallbackFailed { error: e.to_string() },
                Err(_) => InboxEvent::FallbackFailed {
                    error: "fallback lane dropped the item".to_string(),
                },
            };

            let _ = inbox.send(event).await;
        });
    }

    fn publish(&self) {
        let _ = self.snapshot.send(self.state.clone());
    }
}

impl From<InboxEvent> for PolicyEvent {
    fn from(event: InboxEvent) -> Self {
        match event {
            InboxEvent::Signal(signal) => PolicyEvent::SignalReceived(signal),
            InboxEvent::FallbackCompleted(decision) => PolicyEvent::FallbackCompleted(decision),
            InboxEvent::FallbackFailed { error } => PolicyEvent::FallbackFailed { error },
        }
    }
}

/// Deterministic key for an audit work item: requestId + sequence + eventType
pub fn audit_idempotency_key(entry: &AuditEntry) -> String {
    format!("{}:{}:{}", entry.request_id, entry.sequence, entry.event_type)
}

/// Bounded-size dedup key for duplicate signal deliveries
fn signal_dedup_key(signal: &Signal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signal.approver.as_bytes());
    hasher.update(b"|");
    hasher.update(signal.sent_at.to_rfc3339().as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)[..16].to_string()
}
