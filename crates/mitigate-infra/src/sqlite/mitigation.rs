//! SQLite mitigation repository implementation.
//!
//! Implements `MitigationRepository` from `mitigate-core` using sqlx with
//! split read/write pools. Definitions, rules and execution snapshots are
//! stored as JSON blobs; `instruction_id`, `status` and `started_at_us` are
//! indexed columns kept in step with the blob on every upsert.

use chrono::{DateTime, Utc};
use mitigate_core::repository::MitigationRepository;
use mitigate_types::definition::WorkflowDefinition;
use mitigate_types::error::RepositoryError;
use mitigate_types::escalation::EscalationRule;
use mitigate_types::execution::{ExecutionStatus, WorkflowExecution};
use serde::de::DeserializeOwned;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `MitigationRepository`.
pub struct SqliteMitigationRepository {
    pool: DatabasePool,
}

impl SqliteMitigationRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

/// Decode the JSON blob in `column` of every row.
fn decode_rows<T: DeserializeOwned>(
    rows: &[sqlx::sqlite::SqliteRow],
    column: &str,
) -> Result<Vec<T>, RepositoryError> {
    rows.iter().map(|row| decode_row(row, column)).collect()
}

fn decode_row<T: DeserializeOwned>(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> Result<T, RepositoryError> {
    let blob: String = row
        .try_get(column)
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(&blob)
        .map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn micros(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_micros()
}

// ---------------------------------------------------------------------------
// MitigationRepository impl
// ---------------------------------------------------------------------------

impl MitigationRepository for SqliteMitigationRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def, "definition")?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, name, seq, active, definition, created_at, updated_at)
               VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM workflow_definitions), ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 active = excluded.active,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(def.active)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::Conflict(format!("definition name '{}' is taken", def.name))
            }
            other => RepositoryError::Query(other.to_string()),
        })?;

        tracing::debug!(definition_id = %def.id, name = %def.name, "saved definition");
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| decode_row(&row, "definition")).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflow_definitions ORDER BY seq ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_rows(&rows, "definition")
    }

    async fn save_rule(&self, rule: &EscalationRule) -> Result<(), RepositoryError> {
        let rule_json = to_json(rule, "rule")?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO escalation_rules (id, name, seq, active, rule, created_at, updated_at)
               VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM escalation_rules), ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 active = excluded.active,
                 rule = excluded.rule,
                 updated_at = excluded.updated_at"#,
        )
        .bind(rule.id.to_string())
        .bind(&rule.name)
        .bind(rule.active)
        .bind(&rule_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<EscalationRule>, RepositoryError> {
        let rows = sqlx::query("SELECT rule FROM escalation_rules ORDER BY seq ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_rows(&rows, "rule")
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let execution_json = to_json(execution, "execution")?;

        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, definition_id, definition_name, instruction_id, status, cursor,
                started_at_us, completed_at, execution, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 cursor = excluded.cursor,
                 completed_at = excluded.completed_at,
                 execution = excluded.execution,
                 updated_at = excluded.updated_at"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.definition_id.to_string())
        .bind(&execution.definition_name)
        .bind(&execution.instruction_id)
        .bind(execution.status.as_str())
        .bind(execution.cursor as i64)
        .bind(micros(&execution.started_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution_json)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution.id,
            status = %execution.status,
            cursor = execution.cursor,
            "checkpointed execution"
        );
        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT execution FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| decode_row(&row, "execution")).transpose()
    }

    async fn list_executions_for_instruction(
        &self,
        instruction_id: &str,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT execution FROM workflow_executions WHERE instruction_id = ? ORDER BY started_at_us ASC, id ASC",
        )
        .bind(instruction_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_rows(&rows, "execution")
    }

    async fn list_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT execution FROM workflow_executions WHERE status IN ({placeholders}) ORDER BY started_at_us ASC, id ASC"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_rows(&rows, "execution")
    }

    async fn list_executions_started_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT execution FROM workflow_executions
               WHERE started_at_us >= ? AND started_at_us < ?
               ORDER BY started_at_us ASC, id ASC"#,
        )
        .bind(micros(&from))
        .bind(micros(&to))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_rows(&rows, "execution")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use mitigate_core::workflow::defaults::{default_definitions, default_escalation_rule};
    use mitigate_types::execution::{StepExecution, StepStatus};
    use mitigate_types::signal::Signals;

    async fn test_repo() -> SqliteMitigationRepository {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteMitigationRepository::new(DatabasePool::new(&url).await.unwrap())
    }

    fn execution(def: &WorkflowDefinition, instruction: &str, status: ExecutionStatus) -> WorkflowExecution {
        WorkflowExecution {
            id: Uuid::now_v7(),
            definition_id: def.id,
            definition_name: def.name.clone(),
            instruction_id: instruction.to_string(),
            trigger_reason: "failure_probability > 0.7".to_string(),
            triggered_by: "tester".to_string(),
            match_score: Some(0.8),
            signals: Signals::new(),
            status,
            cursor: 0,
            total_steps: def.steps.len(),
            steps: vec![],
            escalations: vec![],
            started_at: Utc::now(),
            completed_at: None,
            effectiveness: None,
            status_reason: None,
        }
    }

    #[tokio::test]
    async fn test_definitions_keep_registration_order() {
        let repo = test_repo().await;
        let defs = default_definitions().unwrap();
        for def in defs.iter().rev() {
            repo.save_definition(def).await.unwrap();
        }

        // Re-saving keeps the original position.
        let mut revised = defs[2].clone();
        revised.active = false;
        repo.save_definition(&revised).await.unwrap();

        let listed = repo.list_definitions().await.unwrap();
        let names: Vec<&str> = listed.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "counterparty-downgrade-recovery",
                "liquidity-shortfall-response",
                "settlement-failure-response"
            ]
        );
        assert!(!listed[0].active);

        let fetched = repo.get_definition(&defs[1].id).await.unwrap().unwrap();
        assert_eq!(fetched.steps.len(), defs[1].steps.len());
        assert!(repo.get_definition(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_definition_name_conflict() {
        let repo = test_repo().await;
        let def = default_definitions().unwrap().remove(0);
        repo.save_definition(&def).await.unwrap();

        let mut clash = def.clone();
        clash.id = Uuid::now_v7();
        let err = repo.save_definition(&clash).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_rules_roundtrip() {
        let repo = test_repo().await;
        let rule = default_escalation_rule().unwrap();
        repo.save_rule(&rule).await.unwrap();
        repo.save_rule(&rule).await.unwrap();

        let rules = repo.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].levels.len(), 3);
    }

    #[tokio::test]
    async fn test_execution_upsert_and_queries() {
        let repo = test_repo().await;
        let def = default_definitions().unwrap().remove(0);

        let mut running = execution(&def, "INS-1", ExecutionStatus::InProgress);
        running.steps.push(StepExecution::start(&def.steps[0].id, 0));
        repo.save_execution(&running).await.unwrap();

        let mut paused = execution(&def, "INS-1", ExecutionStatus::Paused);
        paused.started_at = running.started_at + Duration::seconds(1);
        repo.save_execution(&paused).await.unwrap();

        let mut old = execution(&def, "INS-2", ExecutionStatus::Completed);
        old.started_at = Utc::now() - Duration::days(2);
        repo.save_execution(&old).await.unwrap();

        // Upsert: the step finishes and the cursor moves.
        running.steps[0].finish(StepStatus::Completed);
        running.cursor = 1;
        repo.save_execution(&running).await.unwrap();

        let loaded = repo.get_execution(&running.id).await.unwrap().unwrap();
        assert_eq!(loaded.cursor, 1);
        assert_eq!(loaded.steps[0].status, StepStatus::Completed);

        let for_instruction = repo.list_executions_for_instruction("INS-1").await.unwrap();
        let ids: Vec<Uuid> = for_instruction.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![running.id, paused.id]);

        let unfinished = repo
            .list_executions_by_status(&[ExecutionStatus::InProgress, ExecutionStatus::Paused])
            .await
            .unwrap();
        assert_eq!(unfinished.len(), 2);
        assert!(repo.list_executions_by_status(&[]).await.unwrap().is_empty());

        let now = Utc::now();
        let recent = repo
            .list_executions_started_between(now - Duration::hours(1), now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|e| e.instruction_id == "INS-1"));
    }

    #[tokio::test]
    async fn test_engine_checkpoints_through_sqlite() {
        use mitigate_core::engine::{MitigationEngine, TriggerRequest};

        let repo = test_repo().await;
        let engine = MitigationEngine::builder(repo).build();
        engine.load_default_playbooks().await.unwrap();

        let signals: Signals =
            serde_json::from_value(serde_json::json!({"liquidity_ratio": 0.8, "exposure_breach": true}))
                .unwrap();
        let execution = engine
            .trigger_workflow(TriggerRequest::new("INS-9", signals))
            .await
            .unwrap();
        engine.wait_settled(execution.id).await;

        let runs = engine.list_for_instruction("INS-9").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].definition_name, "liquidity-shortfall-response");
        assert!(!runs[0].steps.is_empty());
    }
}
