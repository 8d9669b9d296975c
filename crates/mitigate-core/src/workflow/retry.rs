//! Failure routing: retry budget, backoff, and the effective failure policy.
//!
//! Stateless, like the rest of the policy helpers: the engine passes in the
//! step and the failed attempt's retry count and gets back what to do next.

use std::time::Duration;

use mitigate_types::definition::{FailurePolicy, StepType, WorkflowStep};

/// What the state machine does after a step attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureRoute {
    /// Run a new attempt after `backoff`.
    Retry { next_retry: u32, backoff: Duration },
    /// Hand the failure to the escalation coordinator.
    Escalate,
    /// Fail the execution.
    Abort,
    /// Soft failure: advance the cursor.
    Continue,
    /// Park the execution for manual intervention.
    Pause,
}

pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed. `retry_count` is 0 for the first attempt.
    pub fn should_retry(step: &WorkflowStep, retry_count: u32) -> bool {
        retry_count < step.max_retries
    }

    /// Linear backoff: `base × (retry_count + 1)`.
    pub fn backoff(base_ms: u64, retry_count: u32) -> Duration {
        Duration::from_millis(base_ms.saturating_mul(u64::from(retry_count) + 1))
    }

    /// Route a failed attempt.
    ///
    /// The retry budget is spent first. Afterwards `on_failure` applies with
    /// these adjustments:
    /// - `retry` means `escalate`
    /// - `continue` on a required step means `escalate`
    /// - `escalate` on an `escalation` step means `pause`
    pub fn route(step: &WorkflowStep, retry_count: u32, base_backoff_ms: u64) -> FailureRoute {
        if Self::should_retry(step, retry_count) {
            return FailureRoute::Retry {
                next_retry: retry_count + 1,
                backoff: Self::backoff(base_backoff_ms, retry_count),
            };
        }

        let escalate = if step.step_type == StepType::Escalation {
            FailureRoute::Pause
        } else {
            FailureRoute::Escalate
        };

        match step.on_failure {
            FailurePolicy::Abort => FailureRoute::Abort,
            FailurePolicy::Retry | FailurePolicy::Escalate => escalate,
            FailurePolicy::Continue if step.required => escalate,
            FailurePolicy::Continue => FailureRoute::Continue,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn step(on_failure: &str, max_retries: u32, required: bool, step_type: &str) -> WorkflowStep {
        serde_json::from_value(serde_json::json!({
            "id": "s",
            "name": "s",
            "type": step_type,
            "expected_duration_secs": 60,
            "responsible_role": "operations",
            "on_failure": on_failure,
            "max_retries": max_retries,
            "required": required,
        }))
        .unwrap()
    }

    #[test]
    fn test_retry_budget_spent_first() {
        let s = step("escalate", 2, true, "action");
        assert_eq!(
            RetryHandler::route(&s, 0, 100),
            FailureRoute::Retry { next_retry: 1, backoff: Duration::from_millis(100) }
        );
        assert_eq!(
            RetryHandler::route(&s, 1, 100),
            FailureRoute::Retry { next_retry: 2, backoff: Duration::from_millis(200) }
        );
        assert_eq!(RetryHandler::route(&s, 2, 100), FailureRoute::Escalate);
    }

    #[test]
    fn test_retry_policy_exhausted_escalates() {
        let s = step("retry", 0, false, "action");
        assert_eq!(RetryHandler::route(&s, 0, 100), FailureRoute::Escalate);
    }

    #[test]
    fn test_abort_and_continue() {
        assert_eq!(RetryHandler::route(&step("abort", 0, true, "action"), 0, 0), FailureRoute::Abort);
        assert_eq!(
            RetryHandler::route(&step("continue", 0, false, "action"), 0, 0),
            FailureRoute::Continue
        );
    }

    #[test]
    fn test_required_step_never_continues() {
        let s = step("continue", 0, true, "verification");
        assert_eq!(RetryHandler::route(&s, 0, 0), FailureRoute::Escalate);
    }

    #[test]
    fn test_escalation_step_pauses_instead_of_escalating_twice() {
        let s = step("escalate", 0, true, "escalation");
        assert_eq!(RetryHandler::route(&s, 0, 0), FailureRoute::Pause);
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(RetryHandler::backoff(0, 5), Duration::ZERO);
        assert_eq!(RetryHandler::backoff(u64::MAX, 3), Duration::from_millis(u64::MAX));
    }
}
