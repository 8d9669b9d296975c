//! Step handlers and the runner that dispatches to them by step type.
//!
//! A handler takes a step plus its execution context and returns an opaque
//! result payload or fails. The engine treats handlers as retryable external
//! effects; every failure is routed through the step's policy.
//!
//! Built-in handlers:
//! - `notification` -- sends to the step's responsible role via the notifier
//! - `approval` -- notifies, then waits on the [`ApprovalGate`]
//! - `action` / `verification` / `documentation` -- [`LoggingHandler`], which
//!   records the requested effect and succeeds
//!
//! `escalation` steps are run by the engine itself (they need the escalation
//! coordinator), so the runner has no default for them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use mitigate_types::definition::{StepType, WorkflowStep};
use mitigate_types::escalation::NotificationChannel;
use mitigate_types::signal::Signals;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::approval::{ApprovalGate, PendingApproval};
use crate::escalation::notifier::{BoxNotifier, Notification};

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Everything a handler gets to see about the attempt it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: Uuid,
    pub step_execution_id: Uuid,
    pub instruction_id: String,
    pub definition_name: String,
    pub step: WorkflowStep,
    /// 0 for the first attempt.
    pub retry_count: u32,
    /// Signals that triggered the execution.
    pub signals: Signals,
    /// Cancelled when the execution is cancelled or the attempt is bypassed.
    pub cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that can occur during step execution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    /// The effect failed.
    #[error("step failed: {0}")]
    Failed(String),

    /// An approver rejected the step.
    #[error("rejected by {by}{}", .comment.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    Rejected { by: String, comment: Option<String> },

    /// No approval response arrived in time.
    #[error("approval timed out after {0}s")]
    ApprovalTimeout(u64),

    /// The attempt was cancelled (execution cancelled or step bypassed).
    #[error("cancelled")]
    Cancelled,

    /// An escalation step exhausted every level.
    #[error("escalation unresolved: {0}")]
    EscalationUnresolved(String),
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// A step-type handler. Uses RPITIT for the async method.
pub trait StepHandler: Send + Sync {
    fn run(&self, ctx: &StepContext) -> impl Future<Output = Result<Value, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn run_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>> {
        Box::pin(self.run(ctx))
    }
}

/// Type-erased step handler.
#[derive(Clone)]
pub struct BoxStepHandler {
    inner: Arc<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        self.inner.run_boxed(ctx).await
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepHandler").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Sends the step's message to its responsible role.
#[derive(Debug, Clone)]
pub struct NotificationHandler {
    notifier: BoxNotifier,
}

impl NotificationHandler {
    pub fn new(notifier: BoxNotifier) -> Self {
        Self { notifier }
    }
}

fn channel_param(step: &WorkflowStep) -> NotificationChannel {
    step.parameters
        .get("channel")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(NotificationChannel::Dashboard)
}

fn notification_for(ctx: &StepContext, subject: String) -> Notification {
    Notification {
        execution_id: ctx.execution_id,
        instruction_id: ctx.instruction_id.clone(),
        channel: channel_param(&ctx.step),
        recipients: vec![ctx.step.responsible_role.clone()],
        subject,
        body: ctx
            .step
            .param_str("message")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} ({})", ctx.step.name, ctx.definition_name)),
        level: None,
    }
}

impl StepHandler for NotificationHandler {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let notification = notification_for(ctx, format!("[{}] {}", ctx.instruction_id, ctx.step.name));
        self.notifier
            .send(&notification)
            .await
            .map_err(|e| StepError::Failed(e.to_string()))?;
        Ok(json!({
            "notified": notification.recipients,
            "channel": notification.channel,
        }))
    }
}

/// Requests approval from the step's responsible role and waits for it.
///
/// The wait is bounded by the step's `approval_timeout_secs` parameter, or
/// the engine default.
#[derive(Debug, Clone)]
pub struct ApprovalHandler {
    gate: Arc<ApprovalGate>,
    notifier: BoxNotifier,
    default_timeout: Duration,
}

impl ApprovalHandler {
    pub fn new(gate: Arc<ApprovalGate>, notifier: BoxNotifier, default_timeout: Duration) -> Self {
        Self {
            gate,
            notifier,
            default_timeout,
        }
    }
}

impl StepHandler for ApprovalHandler {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let notification =
            notification_for(ctx, format!("[{}] approval required: {}", ctx.instruction_id, ctx.step.name));
        if let Err(e) = self.notifier.send(&notification).await {
            tracing::warn!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step.id,
                error = %e,
                "approval request notification failed; waiting anyway"
            );
        }

        let timeout = ctx
            .step
            .param_u64("approval_timeout_secs")
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let info = PendingApproval {
            execution_id: ctx.execution_id,
            step_execution_id: ctx.step_execution_id,
            step_id: ctx.step.id.clone(),
            role: ctx.step.responsible_role.clone(),
        };
        let response = self.gate.wait(info, timeout, &ctx.cancel).await?;

        if response.approved {
            Ok(json!({
                "approved": true,
                "approved_by": response.approver,
                "comment": response.comment,
            }))
        } else {
            Err(StepError::Rejected {
                by: response.approver,
                comment: response.comment,
            })
        }
    }
}

/// Records the requested effect in the log and succeeds.
///
/// Stands in for the external action executor, verifier and documentation
/// writer until real integrations are registered with
/// [`StepRunner::with_handler`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl StepHandler for LoggingHandler {
    async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        tracing::info!(
            execution_id = %ctx.execution_id,
            step_id = %ctx.step.id,
            step_type = %ctx.step.step_type,
            role = %ctx.step.responsible_role,
            "step effect recorded"
        );
        Ok(json!({
            "step_type": ctx.step.step_type,
            "parameters": ctx.step.parameters,
            "recorded": true,
        }))
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Dispatches steps to handlers by `StepType`.
#[derive(Debug, Clone, Default)]
pub struct StepRunner {
    handlers: HashMap<StepType, BoxStepHandler>,
}

impl StepRunner {
    /// Runner with the built-in handlers for every type except `escalation`.
    pub fn with_defaults(gate: Arc<ApprovalGate>, notifier: BoxNotifier, approval_timeout: Duration) -> Self {
        Self::default()
            .with_handler(StepType::Notification, NotificationHandler::new(notifier.clone()))
            .with_handler(
                StepType::Approval,
                ApprovalHandler::new(gate, notifier, approval_timeout),
            )
            .with_handler(StepType::Action, LoggingHandler)
            .with_handler(StepType::Verification, LoggingHandler)
            .with_handler(StepType::Documentation, LoggingHandler)
    }

    /// Register (or replace) the handler for a step type.
    pub fn with_handler<H: StepHandler + 'static>(self, step_type: StepType, handler: H) -> Self {
        self.with_boxed_handler(step_type, BoxStepHandler::new(handler))
    }

    pub fn with_boxed_handler(mut self, step_type: StepType, handler: BoxStepHandler) -> Self {
        self.handlers.insert(step_type, handler);
        self
    }

    pub fn has_handler(&self, step_type: StepType) -> bool {
        self.handlers.contains_key(&step_type)
    }

    /// Run the step's handler.
    ///
    /// Cancelling `ctx.cancel` ends the run with [`StepError::Cancelled`]
    /// even when the handler never looks at the token.
    pub async fn run(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let Some(handler) = self.handlers.get(&ctx.step.step_type) else {
            return Err(StepError::Failed(format!(
                "no handler registered for {} steps",
                ctx.step.step_type
            )));
        };
        tracing::debug!(
            execution_id = %ctx.execution_id,
            step_id = %ctx.step.id,
            retry_count = ctx.retry_count,
            "dispatching step"
        );
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
            result = handler.run(ctx) => result,
        }
    }
}
