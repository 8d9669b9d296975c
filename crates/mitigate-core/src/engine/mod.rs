//! Execution State Machine and the engine facade.
//!
//! `MitigationEngine` owns the definition store, trigger matcher, step
//! runner, approval gate and escalation coordinator, and one
//! [`ExecutionSlot`] per live execution. Each slot is driven by a single
//! spawned task (see [`driver`]), so an execution never has more than one
//! step in flight; operator operations (pause, resume, cancel, bypass) take
//! the same per-execution lock the driver takes between steps.
//!
//! Every state transition is written through the [`CheckpointManager`]
//! before the driver moves on.

mod driver;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mitigate_types::config::EngineConfig;
use mitigate_types::definition::{StepType, WorkflowDefinition, WorkflowStep};
use mitigate_types::escalation::{
    AcknowledgmentDecision, EscalationOutcome, EscalationRecord, EscalationRule, EscalationTrigger,
};
use mitigate_types::event::MitigationEvent;
use mitigate_types::execution::{ExecutionStatus, StepBypass, StepStatus, WorkflowExecution};
use mitigate_types::report::UsageReport;
use mitigate_types::signal::Signals;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::escalation::coordinator::{EscalationCoordinator, EscalationRequest, PendingEscalation};
use crate::escalation::notifier::BoxNotifier;
use crate::event::EventBus;
use crate::report::build_report;
use crate::repository::MitigationRepository;
use crate::workflow::approval::{ApprovalGate, ApprovalResponse, PendingApproval};
use crate::workflow::checkpoint::{CheckpointError, CheckpointManager};
use crate::workflow::defaults;
use crate::workflow::definition::{DefinitionError, discover_definitions};
use crate::workflow::handler::{BoxStepHandler, StepHandler, StepRunner};
use crate::workflow::matcher::TriggerMatcher;
use crate::workflow::store::DefinitionStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced to callers of the engine.
///
/// Step failures never appear here: they are routed through the step's
/// policy. Refused transitions are `false` returns, not errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no workflow definition matched the trigger signals")]
    NoMatchingDefinition,

    #[error("workflow definition not found or inactive: {0}")]
    DefinitionNotFound(String),

    #[error("workflow definition '{0}' already registered")]
    DuplicateDefinition(String),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl From<DefinitionError> for EngineError {
    fn from(err: DefinitionError) -> Self {
        match err {
            DefinitionError::Duplicate(name) => EngineError::DuplicateDefinition(name),
            other => EngineError::InvalidDefinition(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A request to start a mitigation workflow for one instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub instruction_id: String,
    #[serde(default)]
    pub signals: Signals,
    #[serde(default = "default_triggered_by")]
    pub triggered_by: String,
    /// Explicit definition (UUID or name); bypasses scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

fn default_triggered_by() -> String {
    "system".to_string()
}

impl TriggerRequest {
    pub fn new(instruction_id: impl Into<String>, signals: Signals) -> Self {
        Self {
            instruction_id: instruction_id.into(),
            signals,
            triggered_by: default_triggered_by(),
            definition: None,
        }
    }

    pub fn triggered_by(mut self, who: impl Into<String>) -> Self {
        self.triggered_by = who.into();
        self
    }

    pub fn with_definition(mut self, reference: impl Into<String>) -> Self {
        self.definition = Some(reference.into());
        self
    }
}

/// What `recover()` found in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub definitions: usize,
    pub rules: usize,
    /// In-flight executions parked as `paused`.
    pub interrupted: usize,
    /// `paused` executions re-attached unchanged.
    pub reattached: usize,
    /// Executions whose definition is gone, marked `failed`.
    pub orphaned: usize,
}

// ---------------------------------------------------------------------------
// Per-execution state
// ---------------------------------------------------------------------------

struct AttemptHandle {
    step_execution_id: Uuid,
    /// Child of the execution token; cancelled on bypass and once the
    /// attempt is finished, which also ends its timeout escalations.
    token: CancellationToken,
}

struct SlotState {
    execution: WorkflowExecution,
    pause_requested: Option<String>,
    /// A driver task owns the execution.
    running: bool,
    attempt: Option<AttemptHandle>,
    /// Retry count of the next attempt of the step at the cursor.
    next_retry: u32,
}

struct ExecutionSlot {
    state: Mutex<SlotState>,
    cancel: CancellationToken,
    definition: Arc<WorkflowDefinition>,
    /// `true` while no driver task is running.
    settled: watch::Sender<bool>,
}

impl SlotState {
    /// Drop the in-flight attempt, cancelling whatever still waits on it.
    fn finish_attempt(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.token.cancel();
        }
    }

    fn is_current_attempt(&self, step_execution_id: Uuid) -> bool {
        self.attempt
            .as_ref()
            .is_some_and(|a| a.step_execution_id == step_execution_id)
    }
}

impl ExecutionSlot {
    fn new(execution: WorkflowExecution, definition: Arc<WorkflowDefinition>) -> Self {
        let (settled, _) = watch::channel(true);
        Self {
            state: Mutex::new(SlotState {
                execution,
                pause_requested: None,
                running: false,
                attempt: None,
                next_retry: 0,
            }),
            cancel: CancellationToken::new(),
            definition,
            settled,
        }
    }
}

struct EngineInner<R: MitigationRepository> {
    config: EngineConfig,
    store: DefinitionStore,
    matcher: TriggerMatcher,
    runner: StepRunner,
    approvals: Arc<ApprovalGate>,
    coordinator: Arc<EscalationCoordinator>,
    checkpoint: CheckpointManager<R>,
    event_bus: EventBus,
    executions: DashMap<Uuid, Arc<ExecutionSlot>>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct EngineBuilder<R: MitigationRepository> {
    repo: R,
    config: EngineConfig,
    event_bus: Option<EventBus>,
    notifier: BoxNotifier,
    handlers: Vec<(StepType, BoxStepHandler)>,
}

impl<R: MitigationRepository + 'static> EngineBuilder<R> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn notifier(mut self, notifier: BoxNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the built-in handler for a step type.
    pub fn handler<H: StepHandler + 'static>(mut self, step_type: StepType, handler: H) -> Self {
        self.handlers.push((step_type, BoxStepHandler::new(handler)));
        self
    }

    pub fn build(self) -> MitigationEngine<R> {
        let event_bus = self
            .event_bus
            .unwrap_or_else(|| EventBus::new(self.config.event_capacity));
        let approvals = Arc::new(ApprovalGate::new());

        let mut runner = StepRunner::with_defaults(
            Arc::clone(&approvals),
            self.notifier.clone(),
            self.config.approval_timeout(),
        );
        for (step_type, handler) in self.handlers {
            runner = runner.with_boxed_handler(step_type, handler);
        }

        let coordinator = Arc::new(EscalationCoordinator::new(
            self.notifier,
            event_bus.clone(),
            self.config.rule_selection,
        ));

        MitigationEngine {
            inner: Arc::new(EngineInner {
                matcher: TriggerMatcher::new(self.config.match_threshold),
                config: self.config,
                store: DefinitionStore::new(),
                runner,
                approvals,
                coordinator,
                checkpoint: CheckpointManager::new(self.repo),
                event_bus,
                executions: DashMap::new(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MitigationEngine
// ---------------------------------------------------------------------------

/// Cheaply clonable handle to the engine.
pub struct MitigationEngine<R: MitigationRepository + 'static> {
    inner: Arc<EngineInner<R>>,
}

impl<R: MitigationRepository + 'static> Clone for MitigationEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: MitigationRepository + 'static> MitigationEngine<R> {
    pub fn builder(repo: R) -> EngineBuilder<R> {
        EngineBuilder {
            repo,
            config: EngineConfig::default(),
            event_bus: None,
            notifier: BoxNotifier::default(),
            handlers: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MitigationEvent> {
        self.inner.event_bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Definitions and rules
    // -----------------------------------------------------------------------

    /// Register a new definition. Fails if the name or ID is taken.
    pub async fn register_definition(
        &self,
        def: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        let def = self.inner.store.create(def)?;
        self.inner.checkpoint.save_definition(&def).await?;
        Ok(def)
    }

    /// Replace a registered definition wholesale (same ID).
    ///
    /// Running executions keep the version they started with.
    pub async fn replace_definition(
        &self,
        def: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        let def = self.inner.store.replace(def)?;
        self.inner.checkpoint.save_definition(&def).await?;
        Ok(def)
    }

    /// Register or replace by name, keeping the existing ID on replacement.
    pub async fn install_definition(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        if let Some(existing) = self.inner.store.get_by_name(&def.name) {
            def.id = existing.id;
        }
        let def = self.inner.store.upsert(def)?;
        self.inner.checkpoint.save_definition(&def).await?;
        Ok(def)
    }

    pub fn definitions(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.inner.store.list()
    }

    /// Look up a definition by UUID or name.
    pub fn definition(&self, reference: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner.store.resolve(reference)
    }

    pub async fn register_rule(&self, rule: EscalationRule) -> Result<(), EngineError> {
        self.inner.coordinator.register_rule(rule.clone())?;
        self.inner.checkpoint.save_rule(&rule).await?;
        Ok(())
    }

    pub fn rules(&self) -> Vec<EscalationRule> {
        self.inner.coordinator.rules()
    }

    /// Install the built-in playbooks and the default escalation rule.
    pub async fn load_default_playbooks(&self) -> Result<usize, EngineError> {
        let definitions = defaults::default_definitions()?;
        let count = definitions.len();
        for def in definitions {
            self.install_definition(def).await?;
        }
        self.register_rule(defaults::default_escalation_rule()?).await?;
        tracing::info!(playbooks = count, "loaded built-in playbooks");
        Ok(count)
    }

    /// Install every valid playbook found under `dir`.
    pub async fn load_definitions_dir(&self, dir: &Path) -> Result<usize, EngineError> {
        let mut count = 0;
        for (path, def) in discover_definitions(dir)? {
            match self.install_definition(def).await {
                Ok(def) => {
                    tracing::debug!(?path, definition = %def.name, "installed playbook");
                    count += 1;
                }
                Err(e) => tracing::warn!(?path, error = %e, "skipping playbook"),
            }
        }
        tracing::info!(?dir, playbooks = count, "loaded playbooks from directory");
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Triggering
    // -----------------------------------------------------------------------

    /// Select a definition and start a new execution for it.
    ///
    /// Concurrent triggers for the same instruction start independent
    /// executions.
    pub async fn trigger_workflow(
        &self,
        request: TriggerRequest,
    ) -> Result<WorkflowExecution, EngineError> {
        let (definition, match_score, trigger_reason) = match &request.definition {
            Some(reference) => {
                let definition = self
                    .inner
                    .store
                    .resolve(reference)
                    .filter(|d| d.active)
                    .ok_or_else(|| EngineError::DefinitionNotFound(reference.clone()))?;
                let reason = format!("explicit invocation of '{}'", definition.name);
                (definition, None, reason)
            }
            None => {
                let matched = self
                    .inner
                    .matcher
                    .select(&self.inner.store.list(), &request.signals)
                    .ok_or(EngineError::NoMatchingDefinition)?;
                let reason = matched.trigger_reason();
                (matched.definition, Some(matched.score), reason)
            }
        };

        let execution = WorkflowExecution {
            id: Uuid::now_v7(),
            definition_id: definition.id,
            definition_name: definition.name.clone(),
            instruction_id: request.instruction_id,
            trigger_reason,
            triggered_by: request.triggered_by,
            match_score,
            signals: request.signals,
            status: ExecutionStatus::Initiated,
            cursor: 0,
            total_steps: definition.steps.len(),
            steps: Vec::new(),
            escalations: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            effectiveness: None,
            status_reason: None,
        };
        self.inner.checkpoint.checkpoint(&execution).await?;

        tracing::info!(
            execution_id = %execution.id,
            instruction_id = %execution.instruction_id,
            definition = %execution.definition_name,
            score = ?execution.match_score,
            reason = %execution.trigger_reason,
            "execution started"
        );
        self.inner.event_bus.publish(MitigationEvent::ExecutionStarted {
            execution_id: execution.id,
            definition_name: execution.definition_name.clone(),
            instruction_id: execution.instruction_id.clone(),
            trigger_reason: execution.trigger_reason.clone(),
        });

        let slot = Arc::new(ExecutionSlot::new(execution.clone(), definition));
        self.inner.executions.insert(execution.id, Arc::clone(&slot));
        {
            let mut state = slot.state.lock().await;
            self.spawn_driver(&slot, &mut state);
        }
        Ok(execution)
    }

    fn spawn_driver(&self, slot: &Arc<ExecutionSlot>, state: &mut SlotState) {
        state.running = true;
        slot.settled.send_replace(false);
        tokio::spawn(driver::drive(Arc::clone(&self.inner), Arc::clone(slot)));
    }

    fn slot(&self, execution_id: Uuid) -> Option<Arc<ExecutionSlot>> {
        self.inner
            .executions
            .get(&execution_id)
            .map(|s| Arc::clone(s.value()))
    }

    // -----------------------------------------------------------------------
    // Operator transitions
    // -----------------------------------------------------------------------

    /// Pause an execution.
    ///
    /// With a step in flight the pause is recorded and honoured before the
    /// next step starts. Returns `false` unless the execution is
    /// `initiated`/`in_progress`.
    pub async fn pause_execution(&self, execution_id: Uuid, reason: &str) -> bool {
        let Some(slot) = self.slot(execution_id) else {
            return false;
        };
        let mut state = slot.state.lock().await;
        if !matches!(
            state.execution.status,
            ExecutionStatus::Initiated | ExecutionStatus::InProgress
        ) {
            return false;
        }

        if state.running {
            tracing::info!(%execution_id, reason, "pause requested");
            state.pause_requested = Some(reason.to_string());
        } else {
            self.inner.pause(&mut state.execution, reason.to_string());
            self.inner.persist(&state.execution).await;
        }
        true
    }

    /// Resume a paused execution from its cursor.
    ///
    /// A pause taken during retry backoff resumes with the next retry, so the
    /// step keeps the budget it had left. Also withdraws a pause request that
    /// has not been honoured yet.
    pub async fn resume_execution(&self, execution_id: Uuid) -> bool {
        let Some(slot) = self.slot(execution_id) else {
            return false;
        };
        let mut state = slot.state.lock().await;
        match state.execution.status {
            ExecutionStatus::Paused => {
                state.execution.status = ExecutionStatus::InProgress;
                state.execution.status_reason = None;
                tracing::info!(
                    %execution_id,
                    cursor = state.execution.cursor,
                    next_retry = state.next_retry,
                    "execution resumed"
                );
                self.inner
                    .event_bus
                    .publish(MitigationEvent::ExecutionResumed { execution_id });
                self.inner.persist(&state.execution).await;
                if !state.running {
                    self.spawn_driver(&slot, &mut state);
                }
                true
            }
            ExecutionStatus::Initiated | ExecutionStatus::InProgress => {
                state.pause_requested.take().is_some()
            }
            _ => false,
        }
    }

    /// Cancel a non-terminal execution, short-circuiting any pending wait.
    pub async fn cancel_execution(&self, execution_id: Uuid, reason: &str) -> bool {
        self.terminate(execution_id, ExecutionStatus::Cancelled, reason)
            .await
    }

    /// Fail a non-terminal execution from outside the driver (an escalation
    /// abort raised by the deadline monitor).
    pub async fn abort_execution(&self, execution_id: Uuid, reason: &str) -> bool {
        self.terminate(execution_id, ExecutionStatus::Failed, reason)
            .await
    }

    async fn terminate(&self, execution_id: Uuid, status: ExecutionStatus, reason: &str) -> bool {
        let Some(slot) = self.slot(execution_id) else {
            return false;
        };
        let mut state = slot.state.lock().await;
        if state.execution.is_terminal() {
            return false;
        }

        let now = Utc::now();
        let execution = &mut state.execution;
        for record in execution
            .steps
            .iter_mut()
            .filter(|r| matches!(r.status, StepStatus::Pending | StepStatus::InProgress))
        {
            record.finish(StepStatus::Cancelled);
        }
        for escalation in execution
            .escalations
            .iter_mut()
            .filter(|e| e.outcome == EscalationOutcome::Pending)
        {
            escalation.outcome = EscalationOutcome::Cancelled;
            escalation.resolved_at = Some(now);
        }

        match status {
            ExecutionStatus::Cancelled => self.inner.cancel(execution, reason.to_string()),
            _ => self.inner.fail(execution, reason.to_string()),
        }
        state.finish_attempt();
        state.pause_requested = None;
        slot.cancel.cancel();
        self.inner.persist(&state.execution).await;

        if !state.running {
            self.inner.executions.remove(&execution_id);
        }
        true
    }

    /// Bypass the current attempt of the step at the cursor.
    ///
    /// Accepted only for a `bypassable` step whose latest record is
    /// `step_execution_id` and is `pending`, `in_progress` or `failed`. The
    /// record becomes `skipped`, any wait of that attempt is cut short, and
    /// the cursor advances.
    pub async fn bypass_step(
        &self,
        execution_id: Uuid,
        step_execution_id: Uuid,
        reason: &str,
        bypassed_by: &str,
    ) -> bool {
        let Some(slot) = self.slot(execution_id) else {
            return false;
        };
        let mut guard = slot.state.lock().await;
        let state = &mut *guard;
        if state.execution.is_terminal() {
            return false;
        }
        let Some(step) = slot.definition.steps.get(state.execution.cursor) else {
            return false;
        };
        if !step.bypassable {
            return false;
        }
        let Some(record) = state.execution.latest_for_mut(&step.id) else {
            return false;
        };
        if record.id != step_execution_id
            || !matches!(
                record.status,
                StepStatus::Pending | StepStatus::InProgress | StepStatus::Failed
            )
        {
            return false;
        }

        record.finish(StepStatus::Skipped);
        record.bypass = Some(StepBypass {
            reason: reason.to_string(),
            bypassed_by: bypassed_by.to_string(),
            bypassed_at: Utc::now(),
        });

        if let Some(attempt) = state
            .attempt
            .take_if(|a| a.step_execution_id == step_execution_id)
        {
            attempt.token.cancel();
        }
        state.next_retry = 0;
        state.execution.cursor += 1;

        tracing::info!(
            %execution_id,
            step_id = %step.id,
            bypassed_by,
            reason,
            "step bypassed"
        );
        self.inner.event_bus.publish(MitigationEvent::StepBypassed {
            execution_id,
            step_execution_id,
            step_id: step.id.clone(),
            bypassed_by: bypassed_by.to_string(),
            reason: reason.to_string(),
        });
        self.inner.persist(&state.execution).await;
        true
    }

    /// Answer a waiting approval step.
    pub fn respond_to_approval(
        &self,
        execution_id: Uuid,
        step_execution_id: Uuid,
        approver: &str,
        approved: bool,
        comment: Option<String>,
    ) -> bool {
        self.inner.approvals.respond(
            execution_id,
            step_execution_id,
            ApprovalResponse {
                approver: approver.to_string(),
                approved,
                comment,
            },
        )
    }

    /// Acknowledge the level an escalation is waiting on.
    pub fn acknowledge_escalation(
        &self,
        escalation_id: Uuid,
        acknowledged_by: &str,
        decision: AcknowledgmentDecision,
    ) -> bool {
        self.inner
            .coordinator
            .acknowledge(escalation_id, acknowledged_by, decision)
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.inner.approvals.pending()
    }

    pub fn pending_escalations(&self) -> Vec<PendingEscalation> {
        self.inner.coordinator.pending()
    }

    // -----------------------------------------------------------------------
    // Deadline escalation
    // -----------------------------------------------------------------------

    /// Escalate a stalled attempt on behalf of the deadline monitor.
    ///
    /// Only the escalation list is touched; an `aborted` outcome is applied
    /// through [`abort_execution`](Self::abort_execution).
    pub(crate) async fn escalate_timeout(
        &self,
        execution_id: Uuid,
        step_execution_id: Uuid,
        reason: String,
    ) {
        let Some(slot) = self.slot(execution_id) else {
            return;
        };

        let (request, token) = {
            let mut guard = slot.state.lock().await;
            let state = &mut *guard;
            if state.execution.status != ExecutionStatus::InProgress {
                return;
            }
            let Some(step) = state
                .execution
                .step_execution(step_execution_id)
                .filter(|r| r.status == StepStatus::InProgress)
                .and_then(|r| slot.definition.step(&r.step_id))
            else {
                return;
            };
            let Some(token) = state
                .attempt
                .as_ref()
                .filter(|a| a.step_execution_id == step_execution_id)
                .map(|a| a.token.clone())
            else {
                return;
            };
            let request = self.inner.escalation_request(
                &state.execution,
                step,
                step_execution_id,
                EscalationTrigger::Timeout,
                reason,
            );
            state.execution.escalations.push(request.pending_record());
            self.inner.persist(&state.execution).await;
            (request, token)
        };

        let record = self.inner.coordinator.run(&request, &token).await;
        let outcome = record.outcome;
        let acknowledged_by = record.acknowledged_by.clone();
        let still_running = {
            let mut state = slot.state.lock().await;
            replace_escalation(&mut state.execution, record);
            self.inner.persist(&state.execution).await;
            state.is_current_attempt(step_execution_id)
                && state
                    .execution
                    .step_execution(step_execution_id)
                    .is_some_and(|r| r.status == StepStatus::InProgress)
        };

        if outcome != EscalationOutcome::Aborted {
            return;
        }
        if still_running {
            let by = acknowledged_by.unwrap_or_else(|| "escalation".to_string());
            self.abort_execution(
                execution_id,
                &format!("aborted by {by} after step deadline exceeded"),
            )
            .await;
        } else {
            tracing::info!(
                %execution_id,
                %step_execution_id,
                "ignoring abort for an attempt that already finished"
            );
        }
    }

    /// Snapshots of live, non-terminal executions with their definitions.
    pub(crate) async fn active_snapshots(&self) -> Vec<(WorkflowExecution, Arc<WorkflowDefinition>)> {
        let slots: Vec<Arc<ExecutionSlot>> = self
            .inner
            .executions
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect();

        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            let state = slot.state.lock().await;
            if !state.execution.is_terminal() {
                snapshots.push((state.execution.clone(), Arc::clone(&slot.definition)));
            }
        }
        snapshots.sort_by(|a, b| (a.0.started_at, a.0.id).cmp(&(b.0.started_at, b.0.id)));
        snapshots
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        if let Some(slot) = self.slot(execution_id) {
            return Ok(slot.state.lock().await.execution.clone());
        }
        self.inner
            .checkpoint
            .load(execution_id)
            .await
            .map_err(|e| match e {
                CheckpointError::ExecutionNotFound(id) => EngineError::ExecutionNotFound(id),
                other => EngineError::Checkpoint(other),
            })
    }

    pub async fn list_for_instruction(
        &self,
        instruction_id: &str,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self.inner.checkpoint.for_instruction(instruction_id).await?)
    }

    /// Non-terminal executions, oldest first.
    pub async fn list_active(&self) -> Vec<WorkflowExecution> {
        self.active_snapshots()
            .await
            .into_iter()
            .map(|(execution, _)| execution)
            .collect()
    }

    pub async fn generate_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageReport, EngineError> {
        let executions = self.inner.checkpoint.started_between(from, to).await?;
        Ok(build_report(from, to, &executions))
    }

    /// Wait until no driver task owns the execution (paused, terminal, or
    /// unknown).
    pub async fn wait_settled(&self, execution_id: Uuid) {
        let Some(slot) = self.slot(execution_id) else {
            return;
        };
        let mut settled = slot.settled.subscribe();
        let _ = settled.wait_for(|s| *s).await;
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Reload stored definitions and escalation rules, leaving executions
    /// alone. Returns how many of each were registered.
    pub async fn load_stored(&self) -> Result<(usize, usize), EngineError> {
        let (mut definitions, mut rules) = (0, 0);
        for def in self.inner.checkpoint.definitions().await? {
            let name = def.name.clone();
            match self.inner.store.upsert(def) {
                Ok(_) => definitions += 1,
                Err(e) => tracing::warn!(definition = %name, error = %e, "skipping stored definition"),
            }
        }
        for rule in self.inner.checkpoint.rules().await? {
            let name = rule.name.clone();
            match self.inner.coordinator.register_rule(rule) {
                Ok(()) => rules += 1,
                Err(e) => tracing::warn!(rule = %name, error = %e, "skipping stored escalation rule"),
            }
        }
        Ok((definitions, rules))
    }

    /// Reload definitions, rules and unfinished executions from the store.
    ///
    /// Executions that were in flight when the previous process stopped are
    /// parked as `paused`: their running attempt is marked `failed` and any
    /// pending escalation `unresolved`. Nothing is resumed automatically.
    pub async fn recover(&self) -> Result<RecoverySummary, EngineError> {
        let (definitions, rules) = self.load_stored().await?;
        let mut summary = RecoverySummary {
            definitions,
            rules,
            ..Default::default()
        };

        for mut execution in self.inner.checkpoint.unfinished().await? {
            if self.inner.executions.contains_key(&execution.id) {
                continue;
            }
            let Some(definition) = self.inner.store.get(&execution.definition_id) else {
                self.inner
                    .fail(&mut execution, "definition no longer registered".to_string());
                self.inner.persist(&execution).await;
                summary.orphaned += 1;
                continue;
            };

            if execution.status == ExecutionStatus::Paused {
                summary.reattached += 1;
            } else {
                let now = Utc::now();
                for record in execution
                    .steps
                    .iter_mut()
                    .filter(|r| r.status == StepStatus::InProgress)
                {
                    record.error = Some("interrupted by restart".to_string());
                    record.finish(StepStatus::Failed);
                }
                for escalation in execution
                    .escalations
                    .iter_mut()
                    .filter(|e| e.outcome == EscalationOutcome::Pending)
                {
                    escalation.outcome = EscalationOutcome::Unresolved;
                    escalation.resolved_at = Some(now);
                }
                self.inner
                    .pause(&mut execution, "recovered after restart".to_string());
                self.inner.persist(&execution).await;
                summary.interrupted += 1;
            }

            self.inner.executions.insert(
                execution.id,
                Arc::new(ExecutionSlot::new(execution, definition)),
            );
        }

        tracing::info!(
            definitions = summary.definitions,
            rules = summary.rules,
            interrupted = summary.interrupted,
            reattached = summary.reattached,
            orphaned = summary.orphaned,
            "recovered engine state"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Transitions shared by the driver and the operator operations
// ---------------------------------------------------------------------------

impl<R: MitigationRepository> EngineInner<R> {
    async fn persist(&self, execution: &WorkflowExecution) {
        if let Err(e) = self.checkpoint.checkpoint(execution).await {
            tracing::error!(execution_id = %execution.id, error = %e, "failed to checkpoint execution");
        }
    }

    fn pause(&self, execution: &mut WorkflowExecution, reason: String) {
        tracing::info!(execution_id = %execution.id, cursor = execution.cursor, reason = %reason, "execution paused");
        execution.status = ExecutionStatus::Paused;
        execution.status_reason = Some(reason.clone());
        self.event_bus.publish(MitigationEvent::ExecutionPaused {
            execution_id: execution.id,
            reason,
        });
    }

    fn complete(&self, execution: &mut WorkflowExecution) {
        finalize(execution, ExecutionStatus::Completed, None);
        let effectiveness = execution.effectiveness.unwrap_or_default();
        let duration_ms = duration_ms(execution);
        tracing::info!(execution_id = %execution.id, effectiveness, duration_ms, "execution completed");
        self.event_bus.publish(MitigationEvent::ExecutionCompleted {
            execution_id: execution.id,
            effectiveness,
            duration_ms,
        });
    }

    fn fail(&self, execution: &mut WorkflowExecution, reason: String) {
        finalize(execution, ExecutionStatus::Failed, Some(reason.clone()));
        tracing::warn!(execution_id = %execution.id, cursor = execution.cursor, reason = %reason, "execution failed");
        self.event_bus.publish(MitigationEvent::ExecutionFailed {
            execution_id: execution.id,
            reason,
        });
    }

    fn cancel(&self, execution: &mut WorkflowExecution, reason: String) {
        finalize(execution, ExecutionStatus::Cancelled, Some(reason.clone()));
        tracing::info!(execution_id = %execution.id, reason = %reason, "execution cancelled");
        self.event_bus.publish(MitigationEvent::ExecutionCancelled {
            execution_id: execution.id,
            reason,
        });
    }

    fn escalation_request(
        &self,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
        step_execution_id: Uuid,
        trigger: EscalationTrigger,
        reason: String,
    ) -> EscalationRequest {
        EscalationRequest {
            id: Uuid::now_v7(),
            execution_id: execution.id,
            instruction_id: execution.instruction_id.clone(),
            definition_name: execution.definition_name.clone(),
            step_id: step.id.clone(),
            step_execution_id,
            trigger,
            reason,
            signals: execution.signals.clone(),
        }
    }
}

fn finalize(execution: &mut WorkflowExecution, status: ExecutionStatus, reason: Option<String>) {
    execution.status = status;
    execution.status_reason = reason;
    execution.completed_at = Some(Utc::now());
    execution.effectiveness = Some(execution.compute_effectiveness());
}

fn duration_ms(execution: &WorkflowExecution) -> u64 {
    execution
        .duration()
        .map(|d| d.num_milliseconds().max(0) as u64)
        .unwrap_or_default()
}

/// Swap the pending record for its final version (or append it).
fn replace_escalation(execution: &mut WorkflowExecution, record: EscalationRecord) {
    match execution.escalations.iter_mut().find(|e| e.id == record.id) {
        Some(existing) => *existing = record,
        None => execution.escalations.push(record),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
