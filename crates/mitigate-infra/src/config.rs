//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.mitigate/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use mitigate_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "MITIGATE_DATA_DIR";

/// Resolve the data directory: `MITIGATE_DATA_DIR`, else `~/.mitigate`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mitigate")
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
/// - A relative `definitions_dir` is resolved against `data_dir`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return EngineConfig::default();
        }
    };

    let mut config = match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            return EngineConfig::default();
        }
    };

    if let Some(dir) = config.definitions_dir.take() {
        config.definitions_dir = Some(if dir.is_relative() {
            data_dir.join(dir)
        } else {
            dir
        });
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitigate_types::config::{DependencyPolicy, RuleSelection};
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.monitor_interval_secs, 300);
        assert!(config.load_default_playbooks);
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
match_threshold = 0.4
retry_backoff_ms = 250
dependency_policy = "block"
rule_selection = "conditions"
definitions_dir = "playbooks"
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert!((config.match_threshold - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.retry_backoff_ms, 250);
        assert_eq!(config.dependency_policy, DependencyPolicy::Block);
        assert_eq!(config.rule_selection, RuleSelection::Conditions);
        assert_eq!(config.definitions_dir, Some(tmp.path().join("playbooks")));
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert!((config.deadline_factor - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.dependency_policy, DependencyPolicy::Skip);
    }

    #[tokio::test]
    async fn absolute_definitions_dir_is_kept() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            "definitions_dir = \"/etc/mitigate/playbooks\"\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(
            config.definitions_dir.as_deref(),
            Some(Path::new("/etc/mitigate/playbooks"))
        );
    }
}
