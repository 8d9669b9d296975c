//! In-memory `MitigationRepository` backed by `DashMap`.
//!
//! The default store for tests and one-shot CLI runs. Registration order of
//! definitions and rules is preserved with a monotonically increasing
//! sequence number.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mitigate_types::definition::WorkflowDefinition;
use mitigate_types::error::RepositoryError;
use mitigate_types::escalation::EscalationRule;
use mitigate_types::execution::{ExecutionStatus, WorkflowExecution};
use uuid::Uuid;

use super::mitigation::MitigationRepository;

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    seq: AtomicU64,
    definitions: DashMap<Uuid, (u64, WorkflowDefinition)>,
    rules: DashMap<Uuid, (u64, EscalationRule)>,
    executions: DashMap<Uuid, WorkflowExecution>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn collect_executions<F>(&self, filter: F) -> Vec<WorkflowExecution>
    where
        F: Fn(&WorkflowExecution) -> bool,
    {
        let mut found: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        found
    }
}

impl MitigationRepository for InMemoryRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let seq = match self.definitions.get(&def.id) {
            Some(existing) => existing.0,
            None => self.next_seq(),
        };
        self.definitions.insert(def.id, (seq, def.clone()));
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.get(id).map(|entry| entry.1.clone()))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<(u64, WorkflowDefinition)> = self
            .definitions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        defs.sort_by_key(|(seq, _)| *seq);
        Ok(defs.into_iter().map(|(_, def)| def).collect())
    }

    async fn save_rule(&self, rule: &EscalationRule) -> Result<(), RepositoryError> {
        let seq = match self.rules.get(&rule.id) {
            Some(existing) => existing.0,
            None => self.next_seq(),
        };
        self.rules.insert(rule.id, (seq, rule.clone()));
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<EscalationRule>, RepositoryError> {
        let mut rules: Vec<(u64, EscalationRule)> =
            self.rules.iter().map(|entry| entry.value().clone()).collect();
        rules.sort_by_key(|(seq, _)| *seq);
        Ok(rules.into_iter().map(|(_, rule)| rule).collect())
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.executions.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_executions_for_instruction(
        &self,
        instruction_id: &str,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self.collect_executions(|e| e.instruction_id == instruction_id))
    }

    async fn list_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self.collect_executions(|e| statuses.contains(&e.status)))
    }

    async fn list_executions_started_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self.collect_executions(|e| e.started_at >= from && e.started_at < to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitigate_types::signal::Signals;

    fn execution(instruction: &str, status: ExecutionStatus) -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::now_v7(),
            definition_id: Uuid::now_v7(),
            definition_name: "test".to_string(),
            instruction_id: instruction.to_string(),
            trigger_reason: "manual".to_string(),
            triggered_by: "tester".to_string(),
            match_score: None,
            signals: Signals::new(),
            status,
            cursor: 0,
            total_steps: 1,
            steps: vec![],
            escalations: vec![],
            started_at: Utc::now(),
            completed_at: None,
            effectiveness: None,
            status_reason: None,
        }
    }

    #[tokio::test]
    async fn execution_snapshot_upsert_replaces() {
        let repo = InMemoryRepository::new();
        let mut exec = execution("INS-1", ExecutionStatus::InProgress);
        repo.save_execution(&exec).await.unwrap();

        exec.status = ExecutionStatus::Completed;
        repo.save_execution(&exec).await.unwrap();

        let loaded = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert!(repo.get_execution(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queries_filter_by_instruction_status_and_window() {
        let repo = InMemoryRepository::new();
        let a = execution("INS-1", ExecutionStatus::InProgress);
        let b = execution("INS-1", ExecutionStatus::Failed);
        let mut c = execution("INS-2", ExecutionStatus::Paused);
        c.started_at = Utc::now() - chrono::Duration::days(2);
        for e in [&a, &b, &c] {
            repo.save_execution(e).await.unwrap();
        }

        assert_eq!(repo.list_executions_for_instruction("INS-1").await.unwrap().len(), 2);

        let active = repo
            .list_executions_by_status(&[ExecutionStatus::InProgress, ExecutionStatus::Paused])
            .await
            .unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, c.id, "ordered by started_at");

        let recent = repo
            .list_executions_started_between(Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn rules_keep_registration_order_across_upserts() {
        let repo = InMemoryRepository::new();
        let mut first: EscalationRule = serde_json::from_value(serde_json::json!({
            "name": "first", "levels": []
        }))
        .unwrap();
        let second: EscalationRule = serde_json::from_value(serde_json::json!({
            "name": "second", "levels": []
        }))
        .unwrap();
        repo.save_rule(&first).await.unwrap();
        repo.save_rule(&second).await.unwrap();

        first.active = false;
        repo.save_rule(&first).await.unwrap();

        let rules = repo.list_rules().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "first");
        assert!(!rules[0].active);
    }
}
