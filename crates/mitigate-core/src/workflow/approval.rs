//! Approval gate: parks approval steps until a response, timeout or cancel.
//!
//! Each waiting approval is keyed by its step execution ID and holds a
//! oneshot sender; `respond` completes the wait from outside the driver.
//! Waiting is a `tokio::select!` so a blocked approval never holds a thread.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::handler::StepError;

/// An operator's answer to an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approver: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// A waiting approval, as listed for operators.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub execution_id: Uuid,
    pub step_execution_id: Uuid,
    pub step_id: String,
    pub role: String,
}

struct Waiter {
    info: PendingApproval,
    sender: oneshot::Sender<ApprovalResponse>,
}

#[derive(Default)]
pub struct ApprovalGate {
    waiting: DashMap<Uuid, Waiter>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a response to the approval identified by `info`.
    ///
    /// Returns the response (approved or not), or `ApprovalTimeout` /
    /// `Cancelled` when the timer fires or the token is cancelled first.
    pub async fn wait(
        &self,
        info: PendingApproval,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ApprovalResponse, StepError> {
        let step_execution_id = info.step_execution_id;
        let (sender, receiver) = oneshot::channel();
        self.waiting.insert(step_execution_id, Waiter { info, sender });

        tokio::select! {
            response = receiver => match response {
                Ok(response) => Ok(response),
                Err(_) => Err(StepError::Cancelled),
            },
            _ = tokio::time::sleep(timeout) => {
                self.waiting.remove(&step_execution_id);
                Err(StepError::ApprovalTimeout(timeout.as_secs()))
            }
            _ = cancel.cancelled() => {
                self.waiting.remove(&step_execution_id);
                Err(StepError::Cancelled)
            }
        }
    }

    /// Deliver a response. Returns `false` when nothing is waiting under that
    /// execution/step execution pair.
    pub fn respond(
        &self,
        execution_id: Uuid,
        step_execution_id: Uuid,
        response: ApprovalResponse,
    ) -> bool {
        let Some((_, waiter)) = self
            .waiting
            .remove_if(&step_execution_id, |_, w| w.info.execution_id == execution_id)
        else {
            return false;
        };
        waiter.sender.send(response).is_ok()
    }

    pub fn is_waiting(&self, step_execution_id: &Uuid) -> bool {
        self.waiting.contains_key(step_execution_id)
    }

    pub fn pending(&self) -> Vec<PendingApproval> {
        self.waiting.iter().map(|w| w.info.clone()).collect()
    }
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("waiting", &self.waiting.len())
            .finish()
    }
}
