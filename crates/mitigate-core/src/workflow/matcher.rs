//! Trigger Matcher: weighted scoring of trigger conditions against signals.
//!
//! For a definition, score = Σ weight(satisfied) / Σ weight(all), or 0 when
//! the weights sum to 0. The best-scoring active definition wins if its score
//! is strictly above the match threshold; ties go to the first registered.

use std::sync::Arc;

use mitigate_types::definition::{ConditionOperator, TriggerCondition, WorkflowDefinition};
use mitigate_types::signal::{SignalValue, Signals};

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

/// Evaluate one condition against a signal set.
///
/// A missing field fails every operator. `>` and `<` need both sides to be
/// numeric; `=` and `contains` use loose comparison (see [`SignalValue`]).
pub fn evaluate_condition(condition: &TriggerCondition, signals: &Signals) -> bool {
    let Some(actual) = signals.get(&condition.field) else {
        return false;
    };

    match condition.operator {
        ConditionOperator::Exists => true,
        ConditionOperator::GreaterThan => compare(actual, condition.value.as_ref(), |a, b| a > b),
        ConditionOperator::LessThan => compare(actual, condition.value.as_ref(), |a, b| a < b),
        ConditionOperator::Equals => condition
            .value
            .as_ref()
            .is_some_and(|expected| actual.loosely_equals(expected)),
        ConditionOperator::Contains => condition
            .value
            .as_ref()
            .is_some_and(|needle| actual.contains(needle)),
    }
}

fn compare(actual: &SignalValue, threshold: Option<&SignalValue>, op: fn(f64, f64) -> bool) -> bool {
    match (actual.as_f64(), threshold.and_then(SignalValue::as_f64)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// Weighted fraction of satisfied conditions, in `[0, 1]`.
pub fn match_score(conditions: &[TriggerCondition], signals: &Signals) -> f64 {
    let mut satisfied = 0.0;
    let mut total = 0.0;
    for condition in conditions {
        total += condition.weight;
        if evaluate_condition(condition, signals) {
            satisfied += condition.weight;
        }
    }
    if total <= 0.0 {
        return 0.0;
    }
    (satisfied / total).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// A definition selected for a signal set.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub definition: Arc<WorkflowDefinition>,
    pub score: f64,
    /// Descriptions of the satisfied conditions, in declaration order.
    pub matched: Vec<String>,
}

impl MatchResult {
    /// Human-readable union of the matched condition descriptions.
    pub fn trigger_reason(&self) -> String {
        self.matched.join("; ")
    }
}

/// Selects the best-matching definition for a signal set.
#[derive(Debug, Clone, Copy)]
pub struct TriggerMatcher {
    threshold: f64,
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

impl TriggerMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Score one definition and collect the satisfied condition descriptions.
    pub fn score(&self, definition: &Arc<WorkflowDefinition>, signals: &Signals) -> MatchResult {
        let matched = definition
            .triggers
            .iter()
            .filter(|c| evaluate_condition(c, signals))
            .map(TriggerCondition::describe)
            .collect();
        MatchResult {
            definition: Arc::clone(definition),
            score: match_score(&definition.triggers, signals),
            matched,
        }
    }

    /// Best active candidate strictly above the threshold.
    ///
    /// `candidates` must be in registration order; only a strictly higher
    /// score displaces an earlier candidate.
    pub fn select(
        &self,
        candidates: &[Arc<WorkflowDefinition>],
        signals: &Signals,
    ) -> Option<MatchResult> {
        let mut best: Option<MatchResult> = None;
        for definition in candidates.iter().filter(|d| d.active) {
            let result = self.score(definition, signals);
            tracing::trace!(
                definition = %definition.name,
                score = result.score,
                "scored definition"
            );
            if result.score <= self.threshold {
                continue;
            }
            if best.as_ref().is_none_or(|b| result.score > b.score) {
                best = Some(result);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(pairs: &[(&str, SignalValue)]) -> Signals {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn cond(field: &str, op: ConditionOperator, value: Option<SignalValue>, weight: f64) -> TriggerCondition {
        TriggerCondition::new(field, op, value, weight)
    }

    fn definition(name: &str, triggers: Vec<TriggerCondition>) -> Arc<WorkflowDefinition> {
        let mut def: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "name": name,
            "category": "reactive",
            "steps": [{
                "id": "notify",
                "name": "Notify",
                "type": "notification",
                "expected_duration_secs": 60,
                "responsible_role": "operations"
            }]
        }))
        .unwrap();
        def.triggers = triggers;
        Arc::new(def)
    }

    fn settlement_definition() -> Arc<WorkflowDefinition> {
        definition(
            "settlement-failure-response",
            vec![
                cond("failure_probability", ConditionOperator::GreaterThan, Some(0.7.into()), 0.8),
                cond("risk_score", ConditionOperator::GreaterThan, Some(0.8.into()), 0.6),
            ],
        )
    }

    #[test]
    fn partial_match_above_threshold_is_selected() {
        let def = settlement_definition();
        let s = signals(&[("failure_probability", 0.75.into()), ("risk_score", 0.5.into())]);

        let score = match_score(&def.triggers, &s);
        assert!((score - 0.8 / 1.4).abs() < 1e-9);

        let result = TriggerMatcher::default().select(&[def], &s).unwrap();
        assert!((result.score - 0.571).abs() < 1e-3);
        assert_eq!(result.trigger_reason(), "failure_probability > 0.7");
    }

    #[test]
    fn no_conditions_satisfied_is_no_match() {
        let def = settlement_definition();
        let s = signals(&[("failure_probability", 0.5.into()), ("risk_score", 0.5.into())]);
        assert_eq!(match_score(&def.triggers, &s), 0.0);
        assert!(TriggerMatcher::default().select(&[def], &s).is_none());
    }

    #[test]
    fn score_exactly_at_threshold_is_not_a_match() {
        let def = definition(
            "half",
            vec![
                cond("a", ConditionOperator::Exists, None, 0.5),
                cond("b", ConditionOperator::Exists, None, 0.5),
            ],
        );
        let s = signals(&[("a", true.into())]);
        assert!((match_score(&def.triggers, &s) - 0.5).abs() < f64::EPSILON);
        assert!(TriggerMatcher::default().select(&[def], &s).is_none());
    }

    #[test]
    fn zero_weights_score_zero() {
        let def = definition("weightless", vec![cond("a", ConditionOperator::Exists, None, 0.0)]);
        let s = signals(&[("a", true.into())]);
        assert_eq!(match_score(&def.triggers, &s), 0.0);
        assert_eq!(match_score(&[], &s), 0.0);
    }

    #[test]
    fn highest_score_wins_and_ties_go_to_first_registered() {
        let first = definition("first", vec![cond("x", ConditionOperator::Exists, None, 1.0)]);
        let second = definition("second", vec![cond("x", ConditionOperator::Exists, None, 0.4)]);
        let better = definition(
            "better",
            vec![
                cond("x", ConditionOperator::Exists, None, 1.0),
                cond("y", ConditionOperator::Exists, None, 1.0),
            ],
        );
        let s = signals(&[("x", 1.0.into())]);

        let picked = TriggerMatcher::default()
            .select(&[Arc::clone(&first), Arc::clone(&second)], &s)
            .unwrap();
        assert_eq!(picked.definition.name, "first");

        let s2 = signals(&[("x", 1.0.into()), ("y", 1.0.into())]);
        let picked = TriggerMatcher::default()
            .select(&[first, second, better], &s2)
            .unwrap();
        assert_eq!(picked.definition.name, "first", "1.0 tie keeps the earlier definition");
    }

    #[test]
    fn inactive_definitions_are_ignored() {
        let mut def = (*settlement_definition()).clone();
        def.active = false;
        let s = signals(&[("failure_probability", 0.9.into()), ("risk_score", 0.9.into())]);
        assert!(TriggerMatcher::default().select(&[Arc::new(def)], &s).is_none());
    }

    #[test]
    fn operators() {
        let s = signals(&[
            ("ratio", 0.8.into()),
            ("rating", "Downgraded".into()),
            ("flags", SignalValue::List(vec!["watchlist".into()])),
            ("count", "3".into()),
        ]);

        assert!(evaluate_condition(&cond("ratio", ConditionOperator::LessThan, Some(1.0.into()), 1.0), &s));
        assert!(!evaluate_condition(&cond("ratio", ConditionOperator::GreaterThan, Some(1.0.into()), 1.0), &s));
        assert!(evaluate_condition(&cond("count", ConditionOperator::GreaterThan, Some(2.0.into()), 1.0), &s));
        assert!(evaluate_condition(&cond("rating", ConditionOperator::Equals, Some("downgraded".into()), 1.0), &s));
        assert!(evaluate_condition(&cond("flags", ConditionOperator::Contains, Some("watchlist".into()), 1.0), &s));
        assert!(evaluate_condition(&cond("rating", ConditionOperator::Exists, None, 1.0), &s));
        assert!(!evaluate_condition(&cond("missing", ConditionOperator::Exists, None, 1.0), &s));
        assert!(!evaluate_condition(&cond("rating", ConditionOperator::GreaterThan, Some(1.0.into()), 1.0), &s));
    }

    #[test]
    fn score_bounded_for_arbitrary_inputs() {
        let defs = [settlement_definition()];
        for fp in [0.0, 0.5, 0.71, 0.9, 1.0] {
            for rs in [0.0, 0.81, 1.0] {
                let s = signals(&[("failure_probability", fp.into()), ("risk_score", rs.into())]);
                let score = match_score(&defs[0].triggers, &s);
                assert!((0.0..=1.0).contains(&score));
            }
        }
    }
}
