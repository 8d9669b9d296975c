//! Connection pools for the mitigation store.
//!
//! The engine persists on every step transition from many driver tasks, so
//! all writes go through one connection and reads share a small read-only
//! pool. WAL keeps readers from blocking on that writer.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

const DATABASE_FILE: &str = "mitigate.db";
const READ_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    /// Single connection; every write is serialized here.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if needed) the database at `database_url` and bring its
    /// schema up to date before any reader connects.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = connect_options(database_url)?;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READ_CONNECTIONS)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(database_url, "mitigation store opened");
        Ok(Self { reader, writer })
    }

    /// Open the store file inside `data_dir`.
    pub async fn in_dir(data_dir: &Path) -> Result<Self, sqlx::Error> {
        Self::new(&database_url(data_dir)).await
    }
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true))
}

/// `sqlite://` URL of the store file inside `data_dir`.
pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join(DATABASE_FILE).display())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::in_dir(dir.path()).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_schema_is_migrated() {
        let (_dir, pool) = open_temp().await;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(
            names,
            vec!["escalation_rules", "workflow_definitions", "workflow_executions"]
        );
    }

    #[tokio::test]
    async fn test_journal_mode_is_wal() {
        let (_dir, pool) = open_temp().await;
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_reader_rejects_writes() {
        let (_dir, pool) = open_temp().await;
        let result = sqlx::query("DELETE FROM workflow_executions")
            .execute(&pool.reader)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reopen_skips_applied_migrations() {
        let (dir, pool) = open_temp().await;
        pool.writer.close().await;
        pool.reader.close().await;

        let reopened = DatabasePool::in_dir(dir.path()).await.unwrap();
        let (applied,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(&reopened.reader)
            .await
            .unwrap();
        assert_eq!(applied, 1);
    }

    #[test]
    fn test_database_url() {
        let url = database_url(Path::new("/var/lib/mitigate"));
        assert_eq!(url, "sqlite:///var/lib/mitigate/mitigate.db?mode=rwc");
    }
}
