//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that tunes matching,
//! retry backoff, deadline sweeps and escalation rule selection.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the mitigation engine.
///
/// Loaded from `~/.mitigate/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum (exclusive) trigger match score.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,

    /// Interval between deadline monitor sweeps.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// A step is stalled once it runs longer than this multiple of its
    /// expected duration.
    #[serde(default = "default_deadline_factor")]
    pub deadline_factor: f64,

    /// Base retry backoff, multiplied by the retry number.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Approval wait when the step sets no `approval_timeout_secs` parameter.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,

    #[serde(default)]
    pub dependency_policy: DependencyPolicy,

    #[serde(default)]
    pub rule_selection: RuleSelection,

    /// Event bus channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Extra YAML playbooks loaded at startup.
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,

    /// Register the built-in playbooks and escalation rule at startup.
    #[serde(default = "default_true")]
    pub load_default_playbooks: bool,
}

fn default_match_threshold() -> f64 {
    0.5
}

fn default_monitor_interval_secs() -> u64 {
    300
}

fn default_deadline_factor() -> f64 {
    1.5
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_approval_timeout_secs() -> u64 {
    3600
}

fn default_event_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            monitor_interval_secs: default_monitor_interval_secs(),
            deadline_factor: default_deadline_factor(),
            retry_backoff_ms: default_retry_backoff_ms(),
            approval_timeout_secs: default_approval_timeout_secs(),
            dependency_policy: DependencyPolicy::default(),
            rule_selection: RuleSelection::default(),
            event_capacity: default_event_capacity(),
            definitions_dir: None,
            load_default_playbooks: true,
        }
    }
}

impl EngineConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }
}

/// What the state machine does when a step's prerequisites are not completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Record the step as skipped and advance.
    #[default]
    Skip,
    /// Pause the execution until an operator intervenes.
    Block,
}

/// How an escalation rule is picked for an escalation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSelection {
    /// The first active rule in registration order.
    #[default]
    FirstActive,
    /// Best-scoring active rule against the trigger signals, falling back to
    /// the first active rule.
    Conditions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert!((config.match_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.monitor_interval_secs, 300);
        assert!((config.deadline_factor - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.dependency_policy, DependencyPolicy::Skip);
        assert_eq!(config.rule_selection, RuleSelection::FirstActive);
        assert!(config.load_default_playbooks);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.retry_backoff_ms, 1000);
        assert_eq!(config.approval_timeout_secs, 3600);
        assert_eq!(config.event_capacity, 1024);
        assert!(config.definitions_dir.is_none());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
match_threshold = 0.6
monitor_interval_secs = 60
dependency_policy = "block"
rule_selection = "conditions"
definitions_dir = "/etc/mitigate/playbooks"
load_default_playbooks = false
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert!((config.match_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.monitor_interval(), Duration::from_secs(60));
        assert_eq!(config.dependency_policy, DependencyPolicy::Block);
        assert_eq!(config.rule_selection, RuleSelection::Conditions);
        assert_eq!(
            config.definitions_dir.as_deref(),
            Some(std::path::Path::new("/etc/mitigate/playbooks"))
        );
        assert!(!config.load_default_playbooks);
    }
}
