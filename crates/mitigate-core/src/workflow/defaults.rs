//! Built-in playbooks and escalation rule.
//!
//! Embedded at compile time and parsed through the same validation path as
//! user playbooks. Each carries a fixed ID so that re-installing them on
//! every start replaces rather than duplicates.

use mitigate_types::definition::WorkflowDefinition;
use mitigate_types::escalation::EscalationRule;

use super::definition::{DefinitionError, parse_definition_yaml, parse_rule_yaml};

const PLAYBOOKS: [&str; 3] = [
    include_str!("../../playbooks/settlement-failure-response.yaml"),
    include_str!("../../playbooks/liquidity-shortfall-response.yaml"),
    include_str!("../../playbooks/counterparty-downgrade-recovery.yaml"),
];

const DEFAULT_ESCALATION: &str = include_str!("../../playbooks/escalation-default.yaml");

/// The built-in playbooks, validated and in execution order.
pub fn default_definitions() -> Result<Vec<WorkflowDefinition>, DefinitionError> {
    PLAYBOOKS.iter().map(|yaml| parse_definition_yaml(yaml)).collect()
}

/// Operations, then risk management, then executive.
pub fn default_escalation_rule() -> Result<EscalationRule, DefinitionError> {
    parse_rule_yaml(DEFAULT_ESCALATION)
}

#[cfg(test)]
mod tests {
    use mitigate_types::definition::{StepType, WorkflowCategory};
    use mitigate_types::signal::Signals;

    use super::*;
    use crate::workflow::matcher::TriggerMatcher;

    #[test]
    fn builtin_playbooks_parse() {
        let defs = default_definitions().unwrap();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "settlement-failure-response",
                "liquidity-shortfall-response",
                "counterparty-downgrade-recovery"
            ]
        );
        assert_eq!(defs[0].category, WorkflowCategory::Reactive);
        assert_eq!(defs[1].category, WorkflowCategory::Preventive);
        assert_eq!(defs[2].category, WorkflowCategory::Recovery);
        assert!(
            defs[2]
                .steps
                .iter()
                .any(|s| s.step_type == StepType::Escalation)
        );
    }

    #[test]
    fn builtin_ids_are_stable() {
        let first = default_definitions().unwrap();
        let second = default_definitions().unwrap();
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.id, b.id);
        }
        assert_eq!(
            default_escalation_rule().unwrap().id,
            default_escalation_rule().unwrap().id
        );
    }

    #[test]
    fn default_rule_escalates_upwards() {
        let rule = default_escalation_rule().unwrap();
        let roles: Vec<&str> = rule
            .ordered_levels()
            .iter()
            .map(|l| l.roles[0].as_str())
            .collect();
        assert_eq!(roles, vec!["operations", "risk_management", "executive"]);
        assert!(!rule.levels[0].can_approve);
        assert!(rule.levels[2].can_abort);
    }

    #[test]
    fn builtin_triggers_select_their_playbook() {
        let defs: Vec<_> = default_definitions()
            .unwrap()
            .into_iter()
            .map(std::sync::Arc::new)
            .collect();
        let matcher = TriggerMatcher::default();

        let cases: [(&str, serde_json::Value); 3] = [
            (
                "settlement-failure-response",
                serde_json::json!({"failure_probability": 0.9, "risk_score": 0.85}),
            ),
            (
                "liquidity-shortfall-response",
                serde_json::json!({"liquidity_ratio": 0.8, "exposure_breach": true}),
            ),
            (
                "counterparty-downgrade-recovery",
                serde_json::json!({"counterparty_rating": "downgraded", "counterparty_flags": ["watchlist"]}),
            ),
        ];
        for (expected, signals) in cases {
            let signals: Signals = serde_json::from_value(signals).unwrap();
            let selected = matcher.select(&defs, &signals).unwrap();
            assert_eq!(selected.definition.name, expected);
        }
    }
}
