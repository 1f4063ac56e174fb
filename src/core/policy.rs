//! Tier escalation policy.
//!
//! A pure transition function: given the current decision state and one
//! event, produce the new state and the side effects to perform. No I/O
//! happens here; the orchestrator turns the emitted effects into work items.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::adapters::FallbackDecision;
use crate::domain::{
    AuditEventType, DecisionRequest, DecisionState, DecisionStatus, Resolution, Signal,
    TierCursor, AI_FALLBACK,
};

/// An event fed into the policy
#[derive(Debug, Clone)]
pub enum PolicyEvent {
    /// The current tier's timeout expired
    TimerFired,

    /// A human responded
    SignalReceived(Signal),

    /// The automated generator produced a decision
    FallbackCompleted(FallbackDecision),

    /// The automated generator failed past its retry budget
    FallbackFailed { error: String },
}

/// A side effect emitted by a transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Append an audit entry
    Audit {
        event_type: AuditEventType,
        payload: serde_json::Value,
    },

    /// Notify an approver that a response is wanted
    Notify { approver: String },

    /// Invoke the automated decision generator
    InvokeFallback,
}

/// Initial transition for a freshly created request.
///
/// Emits the Created and TierEntered(0) audit entries plus the tier-0
/// notification. A request with no tiers goes straight to fallback.
pub fn bootstrap(request: &DecisionRequest) -> (DecisionState, Vec<Effect>) {
    let mut state = DecisionState::new(request);

    let mut effects = vec![Effect::Audit {
        event_type: AuditEventType::Created,
        payload: serde_json::to_value(request).unwrap_or_default(),
    }];

    match request.tiers.first() {
        Some(tier) => {
            effects.push(Effect::Audit {
                event_type: AuditEventType::TierEntered,
                payload: json!({ "tier": 0, "approver": tier.approver }),
            });
            effects.push(Effect::Notify {
                approver: tier.approver.clone(),
            });
        }
        None => {
            state.cursor = TierCursor::Fallback;
            state.status = DecisionStatus::Escalating;
            effects.push(Effect::Audit {
                event_type: AuditEventType::FallbackInvoked,
                payload: json!({}),
            });
            effects.push(Effect::InvokeFallback);
        }
    }

    (state, effects)
}

/// One transition step.
///
/// `now` is passed in rather than read from the clock, keeping the function
/// deterministic. Signals arriving after resolution are audited but never
/// alter the resolution; timers firing after resolution are discarded with
/// no effects at all.
pub fn next(
    state: &DecisionState,
    event: &PolicyEvent,
    now: DateTime<Utc>,
) -> (DecisionState, Vec<Effect>) {
    let mut state = state.clone();

    match event {
        PolicyEvent::SignalReceived(signal) => {
            if state.resolution.is_some() || state.is_terminal() {
                let effects = vec![Effect::Audit {
                    event_type: AuditEventType::SignalReceived,
                    payload: signal_payload(signal, false),
                }];
                return (state, effects);
            }

            let resolution = Resolution {
                resolved_by: signal.approver.clone(),
                approved: signal.approved,
                rationale: signal.rationale.clone(),
                confidence: None,
                resolved_at: now,
            };

            let effects = vec![
                Effect::Audit {
                    event_type: AuditEventType::SignalReceived,
                    payload: signal_payload(signal, true),
                },
                Effect::Audit {
                    event_type: AuditEventType::Resolved,
                    payload: serde_json::to_value(&resolution).unwrap_or_default(),
                },
            ];

            state.status = DecisionStatus::ResolvedHuman;
            state.resolution = Some(resolution);

            (state, effects)
        }

        PolicyEvent::TimerFired => {
            // A timer racing a signal (or firing after resolution) loses
            // silently: no escalation, no audit entry.
            if state.resolution.is_some() || state.is_terminal() {
                return (state, Vec::new());
            }

            let tier_index = match state.cursor {
                TierCursor::Tier(i) => i,
                // Fallback already in flight; nothing left to time out
                TierCursor::Fallback => return (state, Vec::new()),
            };

            let mut effects = vec![Effect::Audit {
                event_type: AuditEventType::TierTimeout,
                payload: json!({ "tier": tier_index }),
            }];

            if tier_index + 1 < state.tiers.len() {
                let next_index = tier_index + 1;
                let approver = state.tiers[next_index].approver.clone();

                state.cursor = TierCursor::Tier(next_index);
                state.tier_entered_at = now;
                state.status = DecisionStatus::Escalating;

                effects.push(Effect::Audit {
                    event_type: AuditEventType::Escalated,
                    payload: json!({ "tier": next_index, "approver": approver }),
                });
                effects.push(Effect::Notify { approver });
            } else {
                state.cursor = TierCursor::Fallback;
                state.status = DecisionStatus::Escalating;

                effects.push(Effect::Audit {
                    event_type: AuditEventType::FallbackInvoked,
                    payload: json!({}),
                });
                effects.push(Effect::InvokeFallback);
            }

            (state, effects)
        }

        PolicyEvent::FallbackCompleted(decision) => {
            if state.resolution.is_some() || state.is_terminal() {
                return (state, Vec::new());
            }

            let resolution = Resolution {
                resolved_by: AI_FALLBACK.to_string(),
                approved: decision.approved,
                rationale: decision.rationale.clone(),
                confidence: Some(decision.confidence),
                resolved_at: now,
            };

            let effects = vec![Effect::Audit {
                event_type: AuditEventType::Resolved,
                payload: serde_json::to_value(&resolution).unwrap_or_default(),
            }];

            state.status = DecisionStatus::ResolvedFallback;
            state.resolution = Some(resolution);

            (state, effects)
        }

        PolicyEvent::FallbackFailed { error } => {
            if state.resolution.is_some() || state.is_terminal() {
                return (state, Vec::new());
            }

            state.status = DecisionStatus::Failed;

            let effects = vec![Effect::Audit {
                event_type: AuditEventType::Failed,
                payload: json!({ "error": error }),
            }];

            (state, effects)
        }
    }
}

fn signal_payload(signal: &Signal, accepted: bool) -> serde_json::Value {
    let mut payload = json!({
        "approver": signal.approver,
        "approved": signal.approved,
        "rationale": signal.rationale,
        "sent_at": signal.sent_at,
        "accepted": accepted,
    });

    if !accepted {
        payload["note"] = json!("ignored: already resolved");
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tier;
    use std::time::Duration;

    fn two_tier_request() -> DecisionRequest {
        DecisionRequest::new(
            "rotate credentials?",
            vec![
                Tier::new("alice", Duration::from_secs(1)),
                Tier::new("bob", Duration::from_secs(1)),
            ],
        )
    }

    fn audit_types(effects: &[Effect]) -> Vec<AuditEventType> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Audit { event_type, .. } => Some(*event_type),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_bootstrap_enters_tier_zero() {
        let request = two_tier_request();
        let (state, effects) = bootstrap(&request);

        assert_eq!(state.cursor, TierCursor::Tier(0));
        assert_eq!(state.status, DecisionStatus::Pending);
        assert_eq!(
            audit_types(&effects),
            vec![AuditEventType::Created, AuditEventType::TierEntered]
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notify { approver } if approver == "alice")));
    }

    #[test]
    fn test_bootstrap_empty_tiers_invokes_fallback() {
        let request = DecisionRequest::new("no approvers", vec![]);
        let (state, effects) = bootstrap(&request);

        assert_eq!(state.cursor, TierCursor::Fallback);
        assert!(effects.iter().any(|e| matches!(e, Effect::InvokeFallback)));
    }

    #[test]
    fn test_timer_escalates_to_next_tier() {
        let request = two_tier_request();
        let (state, _) = bootstrap(&request);

        let now = Utc::now();
        let (state, effects) = next(&state, &PolicyEvent::TimerFired, now);

        assert_eq!(state.cursor, TierCursor::Tier(1));
        assert_eq!(state.status, DecisionStatus::Escalating);
        assert_eq!(state.tier_entered_at, now);
        assert_eq!(
            audit_types(&effects),
            vec![AuditEventType::TierTimeout, AuditEventType::Escalated]
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Notify { approver } if approver == "bob")));
    }

    #[test]
    fn test_timer_on_last_tier_invokes_fallback() {
        let request = two_tier_request();
        let (state, _) = bootstrap(&request);
        let (state, _) = next(&state, &PolicyEvent::TimerFired, Utc::now());
        let (state, effects) = next(&state, &PolicyEvent::TimerFired, Utc::now());

        assert_eq!(state.cursor, TierCursor::Fallback);
        assert!(state.resolution.is_none());
        assert_eq!(
            audit_types(&effects),
            vec![AuditEventType::TierTimeout, AuditEventType::FallbackInvoked]
        );
        assert!(effects.iter().any(|e| matches!(e, Effect::InvokeFallback)));
    }

    #[test]
    fn test_signal_resolves_human() {
        let request = two_tier_request();
        let (state, _) = bootstrap(&request);

        let signal = Signal::new("alice", true, "approved after review");
        let (state, effects) = next(&state, &PolicyEvent::SignalReceived(signal), Utc::now());

        assert_eq!(state.status, DecisionStatus::ResolvedHuman);
        let resolution = state.resolution.unwrap();
        assert_eq!(resolution.resolved_by, "alice");
        assert!(resolution.approved);
        assert_eq!(
            audit_types(&effects),
            vec![AuditEventType::SignalReceived, AuditEventType::Resolved]
        );
    }

    #[test]
    fn test_stale_tier_signal_still_wins() {
        // Alice's tier already escalated past; her reply still resolves.
        let request = two_tier_request();
        let (state, _) = bootstrap(&request);
        let (state, _) = next(&state, &PolicyEvent::TimerFired, Utc::now());
        assert_eq!(state.cursor, TierCursor::Tier(1));

        let signal = Signal::new("alice", false, "too risky");
        let (state, _) = next(&state, &PolicyEvent::SignalReceived(signal), Utc::now());

        assert_eq!(state.status, DecisionStatus::ResolvedHuman);
        assert_eq!(state.resolution.unwrap().resolved_by, "alice");
    }

    #[test]
    fn test_late_signal_audited_but_ignored() {
        let request = two_tier_request();
        let (state, _) = bootstrap(&request);
        let signal = Signal::new("alice", true, "yes");
        let (state, _) = next(&state, &PolicyEvent::SignalReceived(signal), Utc::now());

        let late = Signal::new("bob", false, "no");
        let (state, effects) = next(&state, &PolicyEvent::SignalReceived(late), Utc::now());

        // Resolution untouched
        assert_eq!(state.resolution.as_ref().unwrap().resolved_by, "alice");
        assert!(state.resolution.as_ref().unwrap().approved);

        // But the late signal is still on the record
        assert_eq!(audit_types(&effects), vec![AuditEventType::SignalReceived]);
        if let Effect::Audit { payload, .. } = &effects[0] {
            assert_eq!(payload["accepted"], false);
            assert_eq!(payload["note"], "ignored: already resolved");
        } else {
            panic!("expected audit effect");
        }
    }

    #[test]
    fn test_timer_after_resolution_is_discarded() {
        let request = two_tier_request();
        let (state, _) = bootstrap(&request);
        let signal = Signal::new("alice", true, "yes");
        let (state, _) = next(&state, &PolicyEvent::SignalReceived(signal), Utc::now());

        let (after, effects) = next(&state, &PolicyEvent::TimerFired, Utc::now());

        assert!(effects.is_empty());
        assert_eq!(after.status, DecisionStatus::ResolvedHuman);
    }

    #[test]
    fn test_fallback_completion_resolves() {
        let request = two_tier_request();
        let (state, _) = bootstrap(&request);
        let (state, _) = next(&state, &PolicyEvent::TimerFired, Utc::now());
        let (state, _) = next(&state, &PolicyEvent::TimerFired, Utc::now());

        let decision = FallbackDecision {
            approved: false,
            rationale: "insufficient context".to_string(),
            confidence: 0.7,
        };
        let (state, effects) = next(&state, &PolicyEvent::FallbackCompleted(decision), Utc::now());

        assert_eq!(state.status, DecisionStatus::ResolvedFallback);
        let resolution = state.resolution.unwrap();
        assert_eq!(resolution.resolved_by, AI_FALLBACK);
        assert_eq!(resolution.confidence, Some(0.7));
        assert_eq!(audit_types(&effects), vec![AuditEventType::Resolved]);
    }

    #[test]
    fn test_fallback_completion_after_resolution_is_noop() {
        // A signal slipped in while the generator was working; its result
        // must not overwrite the human resolution.
        let request = two_tier_request();
        let (state, _) = bootstrap(&request);
        let (state, _) = next(&state, &PolicyEvent::TimerFired, Utc::now());
        let (state, _) = next(&state, &PolicyEvent::TimerFired, Utc::now());

        let signal = Signal::new("bob", true, "late but valid");
        let (state, _) = next(&state, &PolicyEvent::SignalReceived(signal), Utc::now());
        assert_eq!(state.status, DecisionStatus::ResolvedHuman);

        let decision = FallbackDecision {
            approved: false,
            rationale: "reject".to_string(),
            confidence: 0.9,
        };
        let (state, effects) = next(&state, &PolicyEvent::FallbackCompleted(decision), Utc::now());

        assert!(effects.is_empty());
        assert_eq!(state.status, DecisionStatus::ResolvedHuman);
        assert_eq!(state.resolution.unwrap().resolved_by, "bob");
    }

    #[test]
    fn test_fallback_failure_is_terminal() {
        let request = two_tier_request();
        let (state, _) = bootstrap(&request);
        let (state, _) = next(&state, &PolicyEvent::TimerFired, Utc::now());
        let (state, _) = next(&state, &PolicyEvent::TimerFired, Utc::now());

        let (state, effects) = next(
            &state,
            &PolicyEvent::FallbackFailed {
                error: "generator unreachable".to_string(),
            },
            Utc::now(),
        );

        assert_eq!(state.status, DecisionStatus::Failed);
        assert!(state.is_terminal());
        assert!(state.resolution.is_none());
        assert_eq!(audit_types(&effects), vec![AuditEventType::Failed]);
    }
}
