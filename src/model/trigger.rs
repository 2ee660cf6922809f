use serde::{Deserialize, Serialize};

use crate::model::{Statement, Value};

/// A tagged variant deciding whether an automation fires, given an event.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TriggerKind {
    Property {
        endpoint: String,
        property: String,
        statement: Statement,
        value: Value,
        #[serde(default)]
        force: bool,
    },
    Mqtt {
        topic: String,
        #[serde(default)]
        sub_field: Option<String>,
        statement: Statement,
        value: Value,
        #[serde(default)]
        force: bool,
    },
    Telegram {
        message: String,
        default_chat: i64,
        #[serde(default)]
        allowed_chats: Vec<i64>,
    },
    /// Literal `HH:MM` or `sunrise±N` / `sunset±N` minutes.
    Time { spec: String },
    Interval { minutes: u32, offset_minutes: u32 },
    Startup,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Trigger {
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Trigger {
    /// Evaluates the match predicate in spec.md §4.3 for a Property/Mqtt
    /// transition from `old` to `new`.
    pub fn matches_transition(
        statement: Statement,
        old: Option<&Value>,
        new: &Value,
        threshold: &Value,
        force: bool,
    ) -> bool {
        let coerced_threshold = coerce_threshold(new, threshold);

        match statement {
            Statement::Equals => {
                old.map(|o| o != &coerced_threshold).unwrap_or(true) && new == &coerced_threshold
            }
            Statement::Above => {
                let o_lt_v = match old {
                    None => true,
                    Some(o) => force || o.as_f64().unwrap_or(f64::NEG_INFINITY) < coerced_threshold.as_f64().unwrap_or(f64::INFINITY),
                };
                let crossed = match old {
                    Some(o) => !force || o != new,
                    None => true,
                };
                crossed && o_lt_v && new.as_f64().unwrap_or(f64::NEG_INFINITY) >= coerced_threshold.as_f64().unwrap_or(f64::INFINITY)
            }
            Statement::Below => {
                let o_gt_v = match old {
                    None => true,
                    Some(o) => force || o.as_f64().unwrap_or(f64::INFINITY) > coerced_threshold.as_f64().unwrap_or(f64::NEG_INFINITY),
                };
                let crossed = match old {
                    Some(o) => !force || o != new,
                    None => true,
                };
                crossed && o_gt_v && new.as_f64().unwrap_or(f64::INFINITY) <= coerced_threshold.as_f64().unwrap_or(f64::NEG_INFINITY)
            }
            Statement::Between => false,
            Statement::Differs => new != &coerced_threshold,
            Statement::Changes => {
                let o = old.and_then(Value::as_f64).unwrap_or(0.0);
                let n = new.as_f64().unwrap_or(0.0);
                let v = coerced_threshold.as_f64().unwrap_or(0.0);
                (n - o).abs() >= v
            }
            Statement::Updates => old.map(|o| o != new).unwrap_or(true),
        }
    }

    /// `between` uses a two-element threshold, so it is handled separately
    /// from the scalar match above (mirrors the source's list-valued case).
    pub fn matches_between(old: Option<&Value>, new: &Value, min: f64, max: f64, force: bool) -> bool {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let n = new.as_f64().unwrap_or(f64::NAN);
        let inside_now = n >= lo && n <= hi;

        let was_outside = match old {
            None => true,
            Some(o) => {
                force
                    || o.as_f64()
                        .map(|o| o < lo || o > hi)
                        .unwrap_or(true)
            }
        };

        was_outside && inside_now
    }
}

fn coerce_threshold(new: &Value, threshold: &Value) -> Value {
    if let Value::Bool(_) = new {
        Value::Bool(threshold.as_bool_coerced())
    } else {
        threshold.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equals_fires_only_on_transition_into_value() {
        let threshold = Value::Bool(true);
        assert!(Trigger::matches_transition(
            Statement::Equals,
            Some(&Value::Bool(false)),
            &Value::Bool(true),
            &threshold,
            false
        ));
        assert!(!Trigger::matches_transition(
            Statement::Equals,
            Some(&Value::Bool(true)),
            &Value::Bool(true),
            &threshold,
            false
        ));
    }

    #[test]
    fn above_boolean_coercion_from_string_threshold() {
        let threshold = Value::String("detected".to_string());
        assert!(Trigger::matches_transition(
            Statement::Above,
            Some(&Value::Bool(false)),
            &Value::Bool(true),
            &threshold,
            false
        ));
    }

    #[test]
    fn between_fires_on_entering_the_range() {
        assert!(Trigger::matches_between(
            Some(&Value::Number(1.0)),
            &Value::Number(5.0),
            3.0,
            10.0,
            false
        ));
        assert!(!Trigger::matches_between(
            Some(&Value::Number(5.0)),
            &Value::Number(6.0),
            3.0,
            10.0,
            false
        ));
    }

    #[test]
    fn interval_fires_on_offset_aligned_minutes() {
        let fires = |minute: u32, interval: u32, offset: u32| {
            minute >= offset && (minute - offset) % interval == 0
        };
        assert!(fires(3, 15, 3));
        assert!(fires(18, 15, 3));
        assert!(!fires(0, 15, 3));
        assert!(!fires(15, 15, 3));
    }
}
