pub mod action;
pub mod automation;
pub mod condition;
pub mod device;
pub mod trigger;

pub use action::{Action, ActionKind, ActionList, PropertyStatement};
pub use automation::{Automation, Mode};
pub use condition::Condition;
pub use device::{split_endpoint_spec, Device};
pub use trigger::{Trigger, TriggerKind};

use serde::{Deserialize, Serialize};

/// Comparator tag attached to a trigger or condition leaf.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Statement {
    Equals,
    Differs,
    Above,
    Below,
    Between,
    Changes,
    Updates,
}

/// A value observed or compared against: property readings, condition
/// operands, and pattern-expansion results are all one of these.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Null => None,
        }
    }

    pub fn as_bool_coerced(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::String(s) => matches!(
                s.to_lowercase().as_str(),
                "detected" | "low" | "occupied" | "on" | "open" | "wet" | "true"
            ),
            Value::Number(n) => *n != 0.0,
            Value::Null => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "_NULL_"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
        }
    }
}
