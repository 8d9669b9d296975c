//! Application state wiring storage, configuration and the engine together.
//!
//! Query commands read the repository directly so they never disturb the
//! executions owned by a running `mitigate serve`. Commands that run
//! workflows build an engine over the same repository.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use mitigate_core::engine::MitigationEngine;
use mitigate_infra::config::{data_dir, load_engine_config};
use mitigate_infra::sqlite::pool::DatabasePool;
use mitigate_infra::sqlite::SqliteMitigationRepository;
use mitigate_types::config::EngineConfig;

/// Engine pinned to the SQLite repository.
pub type ConcreteEngine = MitigationEngine<Arc<SqliteMitigationRepository>>;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<SqliteMitigationRepository>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory, load `config.toml` and open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::in_dir(&data_dir)
            .await
            .context("failed to open the mitigation database")?;
        let repo = Arc::new(SqliteMitigationRepository::new(db_pool));

        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");
        Ok(Self {
            repo,
            config,
            data_dir,
        })
    }

    /// A fresh engine over the shared repository with default handlers and
    /// the tracing notifier. Nothing is loaded yet.
    pub fn engine(&self) -> ConcreteEngine {
        MitigationEngine::builder(Arc::clone(&self.repo))
            .config(self.config.clone())
            .build()
    }

    /// Install built-in and directory playbooks per the configuration.
    pub async fn install_playbooks(&self, engine: &ConcreteEngine) -> anyhow::Result<()> {
        if self.config.load_default_playbooks {
            engine.load_default_playbooks().await?;
        }
        if let Some(dir) = &self.config.definitions_dir {
            if dir.is_dir() {
                engine.load_definitions_dir(dir).await?;
            } else {
                tracing::warn!(dir = %dir.display(), "definitions directory does not exist");
            }
        }
        Ok(())
    }

    /// Engine with stored definitions, rules and configured playbooks loaded.
    /// Stored executions are left untouched.
    pub async fn loaded_engine(&self) -> anyhow::Result<ConcreteEngine> {
        let engine = self.engine();
        let (definitions, rules) = engine.load_stored().await?;
        tracing::debug!(definitions, rules, "loaded stored definitions");
        self.install_playbooks(&engine).await?;
        Ok(engine)
    }
}
