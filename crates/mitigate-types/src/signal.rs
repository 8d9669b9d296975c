//! Risk signal values supplied to the trigger matcher.
//!
//! A signal set is a flat mapping of semantic field names
//! (`failure_probability`, `liquidity_ratio`, ...) to scalar values. No schema
//! is enforced beyond field-name lookup.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A flat bag of named signal values describing a triggering event.
pub type Signals = BTreeMap<String, SignalValue>;

/// A single signal (or condition threshold) value.
///
/// Untagged so that plain JSON/YAML scalars deserialize directly:
/// `0.75` -> `Number`, `true` -> `Bool`, `"downgraded"` -> `Text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<SignalValue>),
}

impl SignalValue {
    /// Numeric view of the value. Booleans map to 0/1, numeric strings parse.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Number(n) => Some(*n),
            SignalValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            SignalValue::Text(s) => s.trim().parse().ok(),
            SignalValue::List(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SignalValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Loose equality used by the `=` operator.
    ///
    /// Numbers compare numerically (so `"0.5"` equals `0.5`), text compares
    /// case-insensitively, everything else structurally.
    pub fn loosely_equals(&self, other: &SignalValue) -> bool {
        match (self, other) {
            (SignalValue::Text(a), SignalValue::Text(b)) => a.eq_ignore_ascii_case(b),
            (SignalValue::Bool(a), SignalValue::Bool(b)) => a == b,
            (SignalValue::List(a), SignalValue::List(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => false,
            },
        }
    }

    /// Membership test used by the `contains` operator.
    ///
    /// Lists test element equality, text tests case-insensitive substring.
    pub fn contains(&self, needle: &SignalValue) -> bool {
        match self {
            SignalValue::List(items) => items.iter().any(|item| item.loosely_equals(needle)),
            SignalValue::Text(haystack) => match needle {
                SignalValue::Text(n) => haystack.to_lowercase().contains(&n.to_lowercase()),
                other => haystack.contains(&other.to_string()),
            },
            _ => false,
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Bool(b) => write!(f, "{b}"),
            SignalValue::Number(n) => write!(f, "{n}"),
            SignalValue::Text(s) => write!(f, "\"{s}\""),
            SignalValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<f64> for SignalValue {
    fn from(value: f64) -> Self {
        SignalValue::Number(value)
    }
}

impl From<bool> for SignalValue {
    fn from(value: bool) -> Self {
        SignalValue::Bool(value)
    }
}

impl From<&str> for SignalValue {
    fn from(value: &str) -> Self {
        SignalValue::Text(value.to_string())
    }
}

impl From<String> for SignalValue {
    fn from(value: String) -> Self {
        SignalValue::Text(value)
    }
}
