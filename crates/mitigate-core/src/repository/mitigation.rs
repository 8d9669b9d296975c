//! Mitigation repository trait definition.
//!
//! Defines the storage interface for playbook definitions, escalation rules
//! and execution snapshots. The infrastructure layer (mitigate-infra)
//! implements this trait with SQLite persistence; `InMemoryRepository` is
//! the default for tests and one-shot runs.

use chrono::{DateTime, Utc};
use mitigate_types::definition::WorkflowDefinition;
use mitigate_types::error::RepositoryError;
use mitigate_types::escalation::EscalationRule;
use mitigate_types::execution::{ExecutionStatus, WorkflowExecution};
use uuid::Uuid;

/// Repository trait for mitigation persistence.
///
/// Covers three entity families:
/// - **Definitions:** upsert/query playbooks.
/// - **Rules:** upsert/query escalation rules.
/// - **Executions:** upsert full snapshots (the engine writes through on every
///   state transition) and query them by instruction, status or time window.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait MitigationRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// All definitions in registration order.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Escalation rules
    // -----------------------------------------------------------------------

    /// Upsert an escalation rule (insert or replace by ID).
    fn save_rule(
        &self,
        rule: &EscalationRule,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All rules in registration order.
    fn list_rules(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<EscalationRule>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Upsert the full execution snapshot.
    fn save_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// Executions for an instruction, ordered by started_at ASC.
    fn list_executions_for_instruction(
        &self,
        instruction_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Executions in any of the given statuses, ordered by started_at ASC.
    fn list_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Executions with `from <= started_at < to`, ordered by started_at ASC.
    fn list_executions_started_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;
}

impl<T: MitigationRepository> MitigationRepository for std::sync::Arc<T> {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        (**self).save_definition(def).await
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        (**self).get_definition(id).await
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        (**self).list_definitions().await
    }

    async fn save_rule(&self, rule: &EscalationRule) -> Result<(), RepositoryError> {
        (**self).save_rule(rule).await
    }

    async fn list_rules(&self) -> Result<Vec<EscalationRule>, RepositoryError> {
        (**self).list_rules().await
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        (**self).save_execution(execution).await
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        (**self).get_execution(id).await
    }

    async fn list_executions_for_instruction(
        &self,
        instruction_id: &str,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        (**self).list_executions_for_instruction(instruction_id).await
    }

    async fn list_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        (**self).list_executions_by_status(statuses).await
    }

    async fn list_executions_started_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        (**self).list_executions_started_between(from, to).await
    }
}
