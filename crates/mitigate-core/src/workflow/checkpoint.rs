//! Durable checkpoint manager for execution state.
//!
//! Wraps `MitigationRepository` with the write-through API the engine uses.
//! Every state transition of an execution is persisted as a full snapshot
//! before the engine moves forward, so a restart can recover in-flight
//! executions instead of silently losing them.

use chrono::{DateTime, Utc};
use mitigate_types::definition::WorkflowDefinition;
use mitigate_types::escalation::EscalationRule;
use mitigate_types::execution::{ExecutionStatus, WorkflowExecution};
use uuid::Uuid;

use crate::repository::MitigationRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints.
///
/// Generic over `R: MitigationRepository` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<R: MitigationRepository> {
    repo: R,
}

impl<R: MitigationRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Execution checkpoints
    // -----------------------------------------------------------------------

    /// Persist the execution snapshot.
    pub async fn checkpoint(&self, execution: &WorkflowExecution) -> Result<(), CheckpointError> {
        self.repo
            .save_execution(execution)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution.id,
            status = %execution.status,
            cursor = execution.cursor,
            records = execution.steps.len(),
            "checkpointed execution"
        );
        Ok(())
    }

    pub async fn load(&self, execution_id: Uuid) -> Result<WorkflowExecution, CheckpointError> {
        self.repo
            .get_execution(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::ExecutionNotFound(execution_id))
    }

    /// Executions left unfinished by a previous process.
    pub async fn unfinished(&self) -> Result<Vec<WorkflowExecution>, CheckpointError> {
        self.repo
            .list_executions_by_status(&[
                ExecutionStatus::Initiated,
                ExecutionStatus::InProgress,
                ExecutionStatus::Paused,
            ])
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn for_instruction(
        &self,
        instruction_id: &str,
    ) -> Result<Vec<WorkflowExecution>, CheckpointError> {
        self.repo
            .list_executions_for_instruction(instruction_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Executions started within `[from, to]`.
    pub async fn started_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, CheckpointError> {
        self.repo
            .list_executions_started_between(from, to)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Registry checkpoints
    // -----------------------------------------------------------------------

    pub async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), CheckpointError> {
        self.repo
            .save_definition(def)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(definition = %def.name, id = %def.id, "checkpointed definition");
        Ok(())
    }

    pub async fn save_rule(&self, rule: &EscalationRule) -> Result<(), CheckpointError> {
        self.repo
            .save_rule(rule)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(rule = %rule.name, id = %rule.id, "checkpointed escalation rule");
        Ok(())
    }

    pub async fn definitions(&self) -> Result<Vec<WorkflowDefinition>, CheckpointError> {
        self.repo
            .list_definitions()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn rules(&self) -> Result<Vec<EscalationRule>, CheckpointError> {
        self.repo
            .list_rules()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use mitigate_types::signal::Signals;

    #[test]
    fn checkpoint_error_display() {
        let err = CheckpointError::Repository("connection lost".to_string());
        assert!(err.to_string().contains("connection lost"));

        let err = CheckpointError::ExecutionNotFound(Uuid::nil());
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn checkpoint_then_load_and_list_unfinished() {
        let manager = CheckpointManager::new(InMemoryRepository::new());
        let exec = WorkflowExecution {
            id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_name: "test".to_string(),
            instruction_id: "INS-1".to_string(),
            trigger_reason: "manual".to_string(),
            triggered_by: "tester".to_string(),
            match_score: None,
            signals: Signals::new(),
            status: ExecutionStatus::InProgress,
            cursor: 1,
            total_steps: 2,
            steps: vec![],
            escalations: vec![],
            started_at: Utc::now(),
            completed_at: None,
            effectiveness: None,
            status_reason: None,
        };
        manager.checkpoint(&exec).await.unwrap();

        assert_eq!(manager.load(exec.id).await.unwrap().cursor, 1);
        assert_eq!(manager.unfinished().await.unwrap().len(), 1);
        assert!(matches!(
            manager.load(Uuid::now_v7()).await,
            Err(CheckpointError::ExecutionNotFound(_))
        ));
    }
}
