//! Playbook parsing, validation, and filesystem discovery.
//!
//! Converts between YAML files and `WorkflowDefinition`, validates structural
//! constraints (unique IDs, valid dependencies, name format, condition
//! weights, `skip_to` targets) and normalizes the step list into the stable
//! topological order the execution cursor walks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use mitigate_types::definition::{ConditionOperator, SuccessPolicy, TriggerCondition, WorkflowDefinition};
use mitigate_types::escalation::EscalationRule;
use thiserror::Error;

use super::dag::order_steps;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or registering definitions and rules.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// A definition with the same name is already registered.
    #[error("definition '{0}' already registered")]
    Duplicate(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated, normalized `WorkflowDefinition`.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    prepare_definition(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::ParseError(e.to_string()))
}

/// Parse a YAML string into a validated `EscalationRule`.
pub fn parse_rule_yaml(yaml: &str) -> Result<EscalationRule, DefinitionError> {
    let rule: EscalationRule =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::ParseError(e.to_string()))?;
    validate_rule(&rule)?;
    Ok(rule)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition and put its steps in execution order.
///
/// Every definition entering the store goes through here, so the engine can
/// rely on `steps` being topologically ordered and on `skip_to` targets lying
/// strictly after their step.
pub fn prepare_definition(mut def: WorkflowDefinition) -> Result<WorkflowDefinition, DefinitionError> {
    validate_definition(&def)?;
    def.steps = order_steps(&def.steps)?;

    for (idx, step) in def.steps.iter().enumerate() {
        if step.on_success != SuccessPolicy::SkipTo {
            continue;
        }
        let target = step.skip_to.as_deref().unwrap_or_default();
        match def.step_index(target) {
            Some(target_idx) if target_idx > idx => {}
            _ => {
                return Err(DefinitionError::ValidationError(format!(
                    "step '{}' skips to '{}', which is not a later step",
                    step.id, target
                )));
            }
        }
    }

    Ok(def)
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters and hyphens
/// - At least one step exists, step IDs are non-empty and unique
/// - All `depends_on` references point to existing step IDs, with no cycles
/// - Every `skip_to` policy names an existing step
/// - Expected durations are > 0
/// - Trigger conditions are well formed
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    validate_name("definition", &def.name)?;

    if def.steps.is_empty() {
        return Err(DefinitionError::ValidationError(
            "definition must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() {
            return Err(DefinitionError::ValidationError(
                "step ID must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        for dep in &step.depends_on {
            if !seen_ids.contains(dep.as_str()) {
                return Err(DefinitionError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }

        if step.expected_duration_secs == 0 {
            return Err(DefinitionError::ValidationError(format!(
                "step '{}' must have an expected duration > 0",
                step.id
            )));
        }

        if step.on_success == SuccessPolicy::SkipTo {
            match step.skip_to.as_deref() {
                Some(target) if seen_ids.contains(target) => {}
                Some(target) => {
                    return Err(DefinitionError::ValidationError(format!(
                        "step '{}' skips to unknown step '{}'",
                        step.id, target
                    )));
                }
                None => {
                    return Err(DefinitionError::ValidationError(format!(
                        "step '{}' uses on_success: skip_to without a skip_to target",
                        step.id
                    )));
                }
            }
        }
    }

    validate_conditions(&def.triggers)?;
    super::dag::validate_dag(&def.steps)
}

/// Validate an escalation rule: at least one level, unique ranks, every level
/// names a role and has a positive timeout.
pub fn validate_rule(rule: &EscalationRule) -> Result<(), DefinitionError> {
    validate_name("rule", &rule.name)?;

    if rule.levels.is_empty() {
        return Err(DefinitionError::ValidationError(format!(
            "rule '{}' must have at least one level",
            rule.name
        )));
    }

    let mut ranks = HashSet::new();
    for level in &rule.levels {
        if !ranks.insert(level.rank) {
            return Err(DefinitionError::ValidationError(format!(
                "rule '{}' has duplicate rank {}",
                rule.name, level.rank
            )));
        }
        if level.roles.is_empty() {
            return Err(DefinitionError::ValidationError(format!(
                "rule '{}' level {} has no roles",
                rule.name, level.rank
            )));
        }
        if level.timeout_secs == 0 {
            return Err(DefinitionError::ValidationError(format!(
                "rule '{}' level {} must have a timeout > 0",
                rule.name, level.rank
            )));
        }
    }

    validate_conditions(&rule.conditions)
}

fn validate_name(kind: &str, name: &str) -> Result<(), DefinitionError> {
    if name.is_empty() {
        return Err(DefinitionError::ValidationError(format!(
            "{kind} name must not be empty"
        )));
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return Err(DefinitionError::ValidationError(format!(
            "{kind} name '{name}' contains invalid characters (only alphanumeric and hyphens allowed)"
        )));
    }
    Ok(())
}

fn validate_conditions(conditions: &[TriggerCondition]) -> Result<(), DefinitionError> {
    for cond in conditions {
        if cond.field.is_empty() {
            return Err(DefinitionError::ValidationError(
                "condition field must not be empty".to_string(),
            ));
        }
        if !cond.weight.is_finite() || !(0.0..=1.0).contains(&cond.weight) {
            return Err(DefinitionError::ValidationError(format!(
                "condition on '{}' has weight {} outside [0, 1]",
                cond.field, cond.weight
            )));
        }
        if cond.operator != ConditionOperator::Exists && cond.value.is_none() {
            return Err(DefinitionError::ValidationError(format!(
                "condition on '{}' with operator '{}' needs a value",
                cond.field, cond.operator
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a definition from a YAML file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition_yaml(&content)
}

/// Save a definition to a YAML file, creating parent directories.
pub fn save_definition_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_definition_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all playbook YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively, in file-name order so that
/// registration order is deterministic. Files that fail to parse are logged
/// and skipped.
pub fn discover_definitions(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    let mut paths = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.sort();

    for path in paths {
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_definition_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "skipping invalid playbook file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml_with_steps(steps: &str) -> String {
        format!(
            r#"
name: test-playbook
category: reactive
triggers:
  - field: failure_probability
    operator: ">"
    value: 0.7
    weight: 0.8
steps:
{steps}
"#
        )
    }

    const TWO_STEPS: &str = r#"
  - id: notify
    name: Notify
    sequence: 1
    type: notification
    expected_duration_secs: 60
    responsible_role: operations
  - id: hold
    name: Hold
    sequence: 2
    type: action
    expected_duration_secs: 60
    responsible_role: operations
    depends_on: [notify]
"#;

    #[test]
    fn test_parse_valid_definition() {
        let def = parse_definition_yaml(&yaml_with_steps(TWO_STEPS)).unwrap();
        assert_eq!(def.name, "test-playbook");
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].id, "notify");
    }

    #[test]
    fn test_parse_reorders_steps_topologically() {
        let steps = r#"
  - id: hold
    name: Hold
    sequence: 1
    type: action
    expected_duration_secs: 60
    responsible_role: operations
    depends_on: [notify]
  - id: notify
    name: Notify
    sequence: 2
    type: notification
    expected_duration_secs: 60
    responsible_role: operations
"#;
        let def = parse_definition_yaml(&yaml_with_steps(steps)).unwrap();
        assert_eq!(def.steps[0].id, "notify");
        assert_eq!(def.steps[1].id, "hold");
    }

    #[test]
    fn test_parse_rejects_malformed_yaml() {
        let err = parse_definition_yaml("name: [unclosed").unwrap_err();
        assert!(matches!(err, DefinitionError::ParseError(_)));
    }

    #[test]
    fn test_validation_rejects_invalid_name() {
        let yaml = yaml_with_steps(TWO_STEPS).replace("test-playbook", "bad name!");
        let err = parse_definition_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("invalid characters"));
    }

    #[test]
    fn test_validation_rejects_empty_steps() {
        let yaml = "name: empty\ncategory: preventive\nsteps: []\n";
        let err = parse_definition_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_validation_rejects_duplicate_step_ids() {
        let steps = TWO_STEPS.replace("id: hold", "id: notify").replace("depends_on: [notify]", "");
        let err = parse_definition_yaml(&yaml_with_steps(&steps)).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn test_validation_rejects_unknown_dependency() {
        let steps = TWO_STEPS.replace("depends_on: [notify]", "depends_on: [ghost]");
        let err = parse_definition_yaml(&yaml_with_steps(&steps)).unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownDependency(_)));
    }

    #[test]
    fn test_validation_rejects_cycle() {
        let steps = r#"
  - id: a
    name: A
    type: action
    expected_duration_secs: 60
    responsible_role: operations
    depends_on: [b]
  - id: b
    name: B
    type: action
    expected_duration_secs: 60
    responsible_role: operations
    depends_on: [a]
"#;
        let err = parse_definition_yaml(&yaml_with_steps(steps)).unwrap_err();
        assert!(matches!(err, DefinitionError::CycleDetected(_)));
    }

    #[test]
    fn test_validation_rejects_weight_out_of_range() {
        let yaml = yaml_with_steps(TWO_STEPS).replace("weight: 0.8", "weight: 1.5");
        let err = parse_definition_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("outside [0, 1]"));
    }

    #[test]
    fn test_validation_rejects_missing_threshold() {
        let yaml = yaml_with_steps(TWO_STEPS).replace("    value: 0.7\n", "");
        let err = parse_definition_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("needs a value"));
    }

    #[test]
    fn test_validation_rejects_backward_skip_to() {
        let steps = format!(
            "{TWO_STEPS}    on_success: skip_to\n    skip_to: notify\n"
        );
        let err = parse_definition_yaml(&yaml_with_steps(&steps)).unwrap_err();
        assert!(err.to_string().contains("not a later step"));
    }

    #[test]
    fn test_validation_rejects_skip_to_without_target() {
        let steps = TWO_STEPS.replace(
            "    sequence: 1\n",
            "    sequence: 1\n    on_success: skip_to\n",
        );
        let err = parse_definition_yaml(&yaml_with_steps(&steps)).unwrap_err();
        assert!(err.to_string().contains("without a skip_to target"));
    }

    #[test]
    fn test_rule_validation() {
        let yaml = r#"
name: default-escalation
levels:
  - rank: 1
    roles: [operations]
    timeout_secs: 900
  - rank: 1
    roles: [risk]
    timeout_secs: 900
"#;
        let err = parse_rule_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate rank"));

        let ok = yaml.replacen("rank: 1\n    roles: [risk]", "rank: 2\n    roles: [risk]", 1);
        let rule = parse_rule_yaml(&ok).unwrap();
        assert_eq!(rule.levels.len(), 2);
    }

    #[test]
    fn test_save_load_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        let def = parse_definition_yaml(&yaml_with_steps(TWO_STEPS)).unwrap();

        save_definition_file(&dir.path().join("a.yaml"), &def).unwrap();
        let mut other = def.clone();
        other.name = "other-playbook".to_string();
        save_definition_file(&dir.path().join("nested/b.yml"), &other).unwrap();
        std::fs::write(dir.path().join("not-a-playbook.yaml"), "key: value").unwrap();

        let loaded = load_definition_file(&dir.path().join("a.yaml")).unwrap();
        assert_eq!(loaded.id, def.id);

        let found = discover_definitions(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1.name, "test-playbook");
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let found = discover_definitions(Path::new("/nonexistent/path")).unwrap();
        assert!(found.is_empty());
    }
}
