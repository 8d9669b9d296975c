//! Escalation Coordinator: walks a ranked escalation path.
//!
//! For each level in ascending rank the coordinator notifies the level's
//! roles on every channel of the rule, then (if the level requires it) waits
//! up to the level's timeout for an acknowledgment. An `approve` from a level
//! with approval authority resolves the escalation, an `abort` from a level
//! with abort authority aborts it; anything else moves on to the next level.
//! Exhausting the levels leaves the escalation unresolved: the coordinator
//! never auto-resolves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use mitigate_types::config::RuleSelection;
use mitigate_types::escalation::{
    AcknowledgmentDecision, EscalationLevel, EscalationOutcome, EscalationRecord, EscalationRule,
    EscalationTrigger, NotificationChannel,
};
use mitigate_types::event::MitigationEvent;
use mitigate_types::signal::Signals;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::notifier::{BoxNotifier, Notification};
use crate::event::EventBus;
use crate::workflow::definition::{DefinitionError, validate_rule};
use crate::workflow::matcher::match_score;

// ---------------------------------------------------------------------------
// Requests and waiting levels
// ---------------------------------------------------------------------------

/// One escalation event to run through a rule.
#[derive(Debug, Clone)]
pub struct EscalationRequest {
    /// Escalation ID, used to acknowledge it.
    pub id: Uuid,
    pub execution_id: Uuid,
    pub instruction_id: String,
    pub definition_name: String,
    pub step_id: String,
    pub step_execution_id: Uuid,
    pub trigger: EscalationTrigger,
    pub reason: String,
    /// Trigger signals of the execution, for condition-based rule selection.
    pub signals: Signals,
}

impl EscalationRequest {
    /// The record as it looks before any level has been visited.
    pub fn pending_record(&self) -> EscalationRecord {
        EscalationRecord {
            id: self.id,
            execution_id: self.execution_id,
            step_id: self.step_id.clone(),
            step_execution_id: self.step_execution_id,
            rule_id: None,
            trigger: self.trigger,
            reason: self.reason.clone(),
            outcome: EscalationOutcome::Pending,
            levels_notified: Vec::new(),
            resolved_level: None,
            acknowledged_by: None,
            started_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// A level currently waiting for acknowledgment, as listed for operators.
#[derive(Debug, Clone, Serialize)]
pub struct PendingEscalation {
    pub escalation_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub rank: u32,
    pub roles: Vec<String>,
    pub can_approve: bool,
    pub can_abort: bool,
}

struct Acknowledgment {
    by: String,
    decision: AcknowledgmentDecision,
}

struct AckWaiter {
    info: PendingEscalation,
    sender: oneshot::Sender<Acknowledgment>,
}

enum LevelResult {
    Resolved(String),
    Aborted(String),
    Cancelled,
    /// Move on to the next level, remembering who acknowledged (if anyone).
    Next(Option<String>),
}

// ---------------------------------------------------------------------------
// EscalationCoordinator
// ---------------------------------------------------------------------------

pub struct EscalationCoordinator {
    seq: AtomicU64,
    rules: DashMap<Uuid, (u64, EscalationRule)>,
    selection: RuleSelection,
    notifier: BoxNotifier,
    event_bus: EventBus,
    waiting: DashMap<Uuid, AckWaiter>,
}

impl EscalationCoordinator {
    pub fn new(notifier: BoxNotifier, event_bus: EventBus, selection: RuleSelection) -> Self {
        Self {
            seq: AtomicU64::new(0),
            rules: DashMap::new(),
            selection,
            notifier,
            event_bus,
            waiting: DashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Rule registry
    // -----------------------------------------------------------------------

    /// Validate and register (or replace by ID) an escalation rule.
    pub fn register_rule(&self, rule: EscalationRule) -> Result<(), DefinitionError> {
        validate_rule(&rule)?;
        let seq = match self.rules.get(&rule.id) {
            Some(existing) => existing.0,
            None => self.seq.fetch_add(1, Ordering::Relaxed),
        };
        tracing::debug!(rule = %rule.name, id = %rule.id, levels = rule.levels.len(), "registered escalation rule");
        self.rules.insert(rule.id, (seq, rule));
        Ok(())
    }

    /// Rules in registration order.
    pub fn rules(&self) -> Vec<EscalationRule> {
        let mut rules: Vec<(u64, EscalationRule)> =
            self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by_key(|(seq, _)| *seq);
        rules.into_iter().map(|(_, rule)| rule).collect()
    }

    /// Pick the rule for an escalation event.
    ///
    /// `first_active` takes the first active rule. `conditions` takes the
    /// active rule whose conditions score highest (> 0) against the signals,
    /// ties to the earliest, and falls back to the first active rule.
    pub fn select_rule(&self, signals: &Signals) -> Option<EscalationRule> {
        let active: Vec<EscalationRule> = self.rules().into_iter().filter(|r| r.active).collect();

        if self.selection == RuleSelection::Conditions {
            let mut best: Option<(f64, &EscalationRule)> = None;
            for rule in active.iter().filter(|r| !r.conditions.is_empty()) {
                let score = match_score(&rule.conditions, signals);
                if score > 0.0 && best.is_none_or(|(s, _)| score > s) {
                    best = Some((score, rule));
                }
            }
            if let Some((_, rule)) = best {
                return Some(rule.clone());
            }
        }

        active.into_iter().next()
    }

    // -----------------------------------------------------------------------
    // Acknowledgment
    // -----------------------------------------------------------------------

    /// Deliver an acknowledgment to the level an escalation is waiting on.
    ///
    /// Returns `false` if the escalation is not currently waiting.
    pub fn acknowledge(
        &self,
        escalation_id: Uuid,
        acknowledged_by: &str,
        decision: AcknowledgmentDecision,
    ) -> bool {
        let Some((_, waiter)) = self.waiting.remove(&escalation_id) else {
            return false;
        };
        waiter
            .sender
            .send(Acknowledgment {
                by: acknowledged_by.to_string(),
                decision,
            })
            .is_ok()
    }

    /// Levels currently waiting for acknowledgment.
    pub fn pending(&self) -> Vec<PendingEscalation> {
        self.waiting.iter().map(|w| w.info.clone()).collect()
    }

    // -----------------------------------------------------------------------
    // Walking the levels
    // -----------------------------------------------------------------------

    /// Run an escalation to its outcome.
    ///
    /// Never fails: notifier errors mean "level not reached", and a missing
    /// rule yields an unresolved record.
    pub async fn run(&self, request: &EscalationRequest, cancel: &CancellationToken) -> EscalationRecord {
        let mut record = request.pending_record();

        let Some(rule) = self.select_rule(&request.signals) else {
            tracing::warn!(
                execution_id = %request.execution_id,
                step_id = %request.step_id,
                "no active escalation rule; escalation unresolved"
            );
            return self.unresolved(record, "no active escalation rule");
        };
        record.rule_id = Some(rule.id);

        tracing::info!(
            escalation_id = %request.id,
            execution_id = %request.execution_id,
            step_id = %request.step_id,
            rule = %rule.name,
            trigger = ?request.trigger,
            reason = %request.reason,
            "escalation started"
        );
        self.event_bus.publish(MitigationEvent::EscalationStarted {
            escalation_id: request.id,
            execution_id: request.execution_id,
            step_id: request.step_id.clone(),
            trigger: request.trigger,
            reason: request.reason.clone(),
        });

        let channels = if rule.channels.is_empty() {
            vec![NotificationChannel::Dashboard]
        } else {
            rule.channels.clone()
        };

        for level in rule.ordered_levels() {
            if cancel.is_cancelled() {
                return self.finish(record, EscalationOutcome::Cancelled, None);
            }

            if !self.notify_level(request, level, &channels).await {
                tracing::warn!(
                    escalation_id = %request.id,
                    level = level.rank,
                    "escalation level not reached"
                );
                continue;
            }
            record.levels_notified.push(level.rank);

            if !level.requires_acknowledgment {
                continue;
            }

            match self.await_level(request, level, cancel).await {
                LevelResult::Resolved(by) => {
                    record.acknowledged_by = Some(by.clone());
                    tracing::info!(escalation_id = %request.id, level = level.rank, resolved_by = %by, "escalation resolved");
                    self.event_bus.publish(MitigationEvent::EscalationResolved {
                        escalation_id: request.id,
                        execution_id: request.execution_id,
                        rank: level.rank,
                        resolved_by: by,
                    });
                    return self.finish(record, EscalationOutcome::Resolved, Some(level.rank));
                }
                LevelResult::Aborted(by) => {
                    record.acknowledged_by = Some(by.clone());
                    tracing::warn!(escalation_id = %request.id, level = level.rank, aborted_by = %by, "escalation aborted");
                    return self.finish(record, EscalationOutcome::Aborted, Some(level.rank));
                }
                LevelResult::Cancelled => {
                    return self.finish(record, EscalationOutcome::Cancelled, None);
                }
                LevelResult::Next(acknowledged_by) => {
                    if acknowledged_by.is_some() {
                        record.acknowledged_by = acknowledged_by;
                    }
                }
            }
        }

        self.unresolved(record, "all escalation levels exhausted")
    }

    async fn notify_level(
        &self,
        request: &EscalationRequest,
        level: &EscalationLevel,
        channels: &[NotificationChannel],
    ) -> bool {
        let mut reached = false;
        for channel in channels {
            let notification = Notification {
                execution_id: request.execution_id,
                instruction_id: request.instruction_id.clone(),
                channel: *channel,
                recipients: level.roles.clone(),
                subject: format!(
                    "[{}] escalation level {}: {} / {}",
                    request.instruction_id, level.rank, request.definition_name, request.step_id
                ),
                body: request.reason.clone(),
                level: Some(level.rank),
            };
            match self.notifier.send(&notification).await {
                Ok(()) => reached = true,
                Err(e) => tracing::warn!(
                    escalation_id = %request.id,
                    level = level.rank,
                    channel = %channel,
                    error = %e,
                    "escalation notification failed"
                ),
            }
        }

        if reached {
            self.event_bus.publish(MitigationEvent::EscalationLevelNotified {
                escalation_id: request.id,
                execution_id: request.execution_id,
                rank: level.rank,
                roles: level.roles.clone(),
                channels: channels.to_vec(),
            });
        }
        reached
    }

    async fn await_level(
        &self,
        request: &EscalationRequest,
        level: &EscalationLevel,
        cancel: &CancellationToken,
    ) -> LevelResult {
        let (sender, receiver) = oneshot::channel();
        self.waiting.insert(
            request.id,
            AckWaiter {
                info: PendingEscalation {
                    escalation_id: request.id,
                    execution_id: request.execution_id,
                    step_id: request.step_id.clone(),
                    rank: level.rank,
                    roles: level.roles.clone(),
                    can_approve: level.can_approve,
                    can_abort: level.can_abort,
                },
                sender,
            },
        );

        let result = tokio::select! {
            ack = receiver => match ack {
                Ok(ack) => Self::judge(level, ack),
                Err(_) => LevelResult::Next(None),
            },
            _ = tokio::time::sleep(Duration::from_secs(level.timeout_secs)) => {
                tracing::info!(escalation_id = %request.id, level = level.rank, "escalation level timed out");
                LevelResult::Next(None)
            }
            _ = cancel.cancelled() => LevelResult::Cancelled,
        };

        self.waiting.remove(&request.id);
        result
    }

    /// Weigh an acknowledgment against the level's authority.
    fn judge(level: &EscalationLevel, ack: Acknowledgment) -> LevelResult {
        match ack.decision {
            AcknowledgmentDecision::Approve if level.can_approve => LevelResult::Resolved(ack.by),
            AcknowledgmentDecision::Abort if level.can_abort => LevelResult::Aborted(ack.by),
            _ => {
                tracing::info!(
                    level = level.rank,
                    acknowledged_by = %ack.by,
                    decision = ?ack.decision,
                    "acknowledged without authority; continuing to next level"
                );
                LevelResult::Next(Some(ack.by))
            }
        }
    }

    fn unresolved(&self, record: EscalationRecord, reason: &str) -> EscalationRecord {
        tracing::warn!(
            escalation_id = %record.id,
            execution_id = %record.execution_id,
            reason,
            "escalation unresolved"
        );
        self.event_bus.publish(MitigationEvent::EscalationUnresolved {
            escalation_id: record.id,
            execution_id: record.execution_id,
            reason: reason.to_string(),
        });
        self.finish(record, EscalationOutcome::Unresolved, None)
    }

    fn finish(
        &self,
        mut record: EscalationRecord,
        outcome: EscalationOutcome,
        resolved_level: Option<u32>,
    ) -> EscalationRecord {
        record.outcome = outcome;
        record.resolved_level = resolved_level;
        record.resolved_at = Some(Utc::now());
        record
    }
}

impl std::fmt::Debug for EscalationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationCoordinator")
            .field("rules", &self.rules.len())
            .field("selection", &self.selection)
            .field("waiting", &self.waiting.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
