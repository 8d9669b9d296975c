//! Shared fixtures for unit tests: recording notifier, scripted handlers and
//! definition builders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mitigate_types::definition::{ConditionOperator, TriggerCondition, WorkflowDefinition, WorkflowStep};
use mitigate_types::escalation::{EscalationLevel, EscalationRule, NotificationChannel};
use serde_json::{Value, json};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::escalation::notifier::{Notification, Notifier, NotifyError};
use crate::workflow::handler::{StepContext, StepError, StepHandler};

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Arc::default(),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// Escalation ranks notified, in order, one entry per level.
    pub fn levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = self.sent().iter().filter_map(|n| n.level).collect();
        levels.dedup();
        levels
    }
}

impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Unavailable("test notifier down".to_string()));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Succeeds unless a failure budget was scripted for the step ID.
#[derive(Clone, Default)]
pub struct ScriptedHandler {
    failures: Arc<Mutex<HashMap<String, u32>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedHandler {
    /// Fail the next `times` attempts of `step_id`.
    pub fn fail(self, step_id: &str, times: u32) -> Self {
        self.failures.lock().unwrap().insert(step_id.to_string(), times);
        self
    }

    pub fn always_fail(self, step_id: &str) -> Self {
        self.fail(step_id, u32::MAX)
    }

    /// Step IDs in dispatch order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl StepHandler for ScriptedHandler {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        self.calls.lock().unwrap().push(ctx.step.id.clone());
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&ctx.step.id) {
            Some(left) if *left > 0 => {
                *left = left.saturating_sub(1);
                Err(StepError::Failed(format!("{} unavailable", ctx.step.id)))
            }
            _ => Ok(json!({ "step": ctx.step.id, "retry_count": ctx.retry_count })),
        }
    }
}

/// Blocks every attempt until released or cancelled.
#[derive(Clone, Default)]
pub struct GatedHandler {
    entered: Arc<AtomicU32>,
    release: Arc<Notify>,
}

impl GatedHandler {
    /// Wait until `n` attempts have entered the handler.
    pub async fn wait_entered(&self, n: u32) {
        while self.entered.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

impl StepHandler for GatedHandler {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = self.release.notified() => Ok(json!({ "released": true })),
            _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
        }
    }
}

/// Hangs on one step ID without ever looking at `ctx.cancel`; every other
/// step succeeds at once.
#[derive(Clone)]
pub struct StallingHandler {
    stalled: String,
    entered: Arc<AtomicU32>,
}

impl StallingHandler {
    pub fn on(step_id: &str) -> Self {
        Self {
            stalled: step_id.to_string(),
            entered: Arc::default(),
        }
    }

    /// Wait until the stalled step has been entered `n` times.
    pub async fn wait_entered(&self, n: u32) {
        while self.entered.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl StepHandler for StallingHandler {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        if ctx.step.id == self.stalled {
            self.entered.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(json!({ "step": ctx.step.id }))
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// An `action` step with sane defaults, patched by `overrides`.
pub fn step(id: &str, overrides: Value) -> WorkflowStep {
    let mut base = json!({
        "id": id,
        "name": id,
        "type": "action",
        "expected_duration_secs": 60,
        "responsible_role": "operations",
    });
    if let (Some(base), Some(patch)) = (base.as_object_mut(), overrides.as_object()) {
        for (k, v) in patch {
            base.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(base).unwrap()
}

/// `failure_probability > 0.7` (0.8) and `risk_score > 0.8` (0.6).
pub fn settlement_conditions() -> Vec<TriggerCondition> {
    vec![
        TriggerCondition::new("failure_probability", ConditionOperator::GreaterThan, Some(0.7.into()), 0.8),
        TriggerCondition::new("risk_score", ConditionOperator::GreaterThan, Some(0.8.into()), 0.6),
    ]
}

pub fn definition(name: &str, steps: Vec<WorkflowStep>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: Uuid::now_v7(),
        name: name.to_string(),
        description: None,
        version: "1.0.0".to_string(),
        category: mitigate_types::definition::WorkflowCategory::Reactive,
        priority: Default::default(),
        triggers: settlement_conditions(),
        steps,
        active: true,
    }
}

/// operations (no authority) -> risk management (approve) -> executive (approve, abort).
pub fn three_level_rule() -> EscalationRule {
    let level = |rank: u32, role: &str, timeout_secs: u64, can_approve: bool, can_abort: bool| EscalationLevel {
        rank,
        roles: vec![role.to_string()],
        timeout_secs,
        requires_acknowledgment: true,
        can_approve,
        can_abort,
    };
    EscalationRule {
        id: Uuid::now_v7(),
        name: "test-escalation".to_string(),
        active: true,
        conditions: Vec::new(),
        levels: vec![
            level(1, "operations", 60, false, false),
            level(2, "risk_management", 120, true, false),
            level(3, "executive", 300, true, true),
        ],
        channels: vec![NotificationChannel::Email],
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Default config with a 5ms retry backoff.
pub fn fast_config() -> mitigate_types::config::EngineConfig {
    mitigate_types::config::EngineConfig {
        retry_backoff_ms: 5,
        ..Default::default()
    }
}

/// Engine over an in-memory store whose `action` steps run `handler`.
pub fn engine<H: StepHandler + 'static>(
    handler: H,
    config: mitigate_types::config::EngineConfig,
    notifier: RecordingNotifier,
) -> crate::engine::MitigationEngine<crate::repository::InMemoryRepository> {
    crate::engine::MitigationEngine::builder(crate::repository::InMemoryRepository::new())
        .config(config)
        .notifier(crate::escalation::notifier::BoxNotifier::new(notifier))
        .handler(mitigate_types::definition::StepType::Action, handler)
        .build()
}

/// Signals that satisfy both settlement conditions.
pub fn hot_signals() -> mitigate_types::signal::Signals {
    serde_json::from_value(json!({"failure_probability": 0.9, "risk_score": 0.9})).unwrap()
}

/// Wait for an escalation of `execution_id` to reach `rank`.
pub async fn wait_for_escalation<R: crate::repository::MitigationRepository + 'static>(
    engine: &crate::engine::MitigationEngine<R>,
    execution_id: Uuid,
    rank: u32,
) -> crate::escalation::coordinator::PendingEscalation {
    loop {
        if let Some(p) = engine
            .pending_escalations()
            .into_iter()
            .find(|p| p.execution_id == execution_id && p.rank == rank)
        {
            return p;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
