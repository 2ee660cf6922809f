use std::str::FromStr;

use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};

use crate::expr::pattern::{expand_pattern, PatternContext, PatternMeta};
use crate::model::{Statement, Value};

/// Recursive tree over AND/OR/NOT with leaf predicates over properties,
/// topics, named states, date, time-of-day, weekday, and computed patterns.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Condition {
    And { children: Vec<Condition> },
    Or { children: Vec<Condition> },
    Not { children: Vec<Condition> },
    Property {
        endpoint: String,
        property: String,
        statement: Statement,
        value: Value,
        #[serde(default = "default_active")]
        active: bool,
    },
    Mqtt {
        topic: String,
        #[serde(default)]
        sub_field: Option<String>,
        statement: Statement,
        value: Value,
        #[serde(default = "default_active")]
        active: bool,
    },
    State {
        name: String,
        statement: Statement,
        value: Value,
        #[serde(default = "default_active")]
        active: bool,
    },
    /// `dd.MM` or `dd.MM.yyyy`, between is wrap-around aware.
    Date {
        from: String,
        to: Option<String>,
        #[serde(default = "default_active")]
        active: bool,
    },
    /// Sun-offset aware, wrap-around supported.
    Time {
        from: String,
        to: Option<String>,
        #[serde(default = "default_active")]
        active: bool,
    },
    /// ISO weekday set, 1..7.
    Weekday {
        days: Vec<u8>,
        #[serde(default = "default_active")]
        active: bool,
    },
    Pattern {
        lhs: String,
        statement: Statement,
        rhs: String,
        #[serde(default = "default_active")]
        active: bool,
    },
}

fn default_active() -> bool {
    true
}

/// Leaf scalar comparison, shared by Property/Mqtt/State/Pattern leaves.
/// equals/differs use the bool/string coercion from the original condition
/// evaluator and treat `null` as equal to the `_NULL_` sentinel.
pub fn match_scalar(value: &Value, match_value: &Value, statement: Statement) -> bool {
    match statement {
        Statement::Equals => scalar_eq(value, match_value),
        Statement::Differs => !scalar_eq(value, match_value),
        Statement::Above => value.as_f64().unwrap_or(f64::NAN) >= match_value.as_f64().unwrap_or(f64::NAN),
        Statement::Below => value.as_f64().unwrap_or(f64::NAN) <= match_value.as_f64().unwrap_or(f64::NAN),
        Statement::Between => false,
        Statement::Changes | Statement::Updates => false,
    }
}

fn scalar_eq(value: &Value, match_value: &Value) -> bool {
    if value.is_null() && matches!(match_value, Value::String(s) if s == "_NULL_") {
        return true;
    }
    match (value, match_value) {
        (Value::Bool(_), _) | (_, Value::Bool(_)) => value.as_bool_coerced() == match_value.as_bool_coerced(),
        _ => value == match_value,
    }
}

/// Inclusive, auto-ordering list-of-two comparison used by `between`.
pub fn match_between(value: f64, a: f64, b: f64) -> bool {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    value >= lo && value <= hi
}

/// Date/time wrap-around comparison carried verbatim from the original:
/// `start > end ? value >= start || value <= end : value >= start && value <= end`.
pub fn match_wraparound(value: f64, start: f64, end: f64) -> bool {
    if start > end {
        value >= start || value <= end
    } else {
        value >= start && value <= end
    }
}

impl Condition {
    pub fn is_active(&self) -> bool {
        match self {
            Condition::And { .. } | Condition::Or { .. } | Condition::Not { .. } => true,
            Condition::Property { active, .. }
            | Condition::Mqtt { active, .. }
            | Condition::State { active, .. }
            | Condition::Date { active, .. }
            | Condition::Time { active, .. }
            | Condition::Weekday { active, .. }
            | Condition::Pattern { active, .. } => *active,
        }
    }
}

/// `evaluate(node, meta) -> bool`, recursing over the tagged tree (spec
/// §4.4). NOT is count-based ("zero children true"), never rewritten to
/// first-child-negation — see the Open Question resolution in spec §9.
pub fn evaluate_condition(node: &Condition, meta: &PatternMeta, ctx: &dyn PatternContext) -> bool {
    if !node.is_active() {
        return false;
    }

    match node {
        Condition::And { children } => children.iter().all(|c| evaluate_condition(c, meta, ctx)),
        Condition::Or { children } => children.iter().any(|c| evaluate_condition(c, meta, ctx)),
        Condition::Not { children } => {
            children.iter().filter(|c| evaluate_condition(c, meta, ctx)).count() == 0
        }
        Condition::Property { endpoint, property, statement, value, .. } => {
            let observed = ctx.property(endpoint, property).unwrap_or(Value::Null);
            eval_leaf(&observed, value, *statement)
        }
        Condition::Mqtt { topic, sub_field, statement, value, .. } => {
            let observed = match ctx.mqtt_payload(topic) {
                Some(payload) => mqtt_leaf_value(&payload, sub_field.as_deref()),
                None => Value::Null,
            };
            eval_leaf(&observed, value, *statement)
        }
        Condition::State { name, statement, value, .. } => {
            let observed = ctx.state(name).unwrap_or(Value::Null);
            eval_leaf(&observed, value, *statement)
        }
        Condition::Date { from, to, .. } => {
            let today = ctx.now();
            let today_key = (today.month() * 100 + today.day()) as f64;
            match (parse_date_key(from), to.as_deref().and_then(parse_date_key)) {
                (Some(start), Some(end)) => match_wraparound(today_key, start, end),
                (Some(start), None) => today_key == start,
                _ => false,
            }
        }
        Condition::Time { from, to, .. } => {
            let now_minutes = (ctx.now().hour() * 60 + ctx.now().minute()) as f64;
            let sunrise_minutes = ctx.sunrise_today().map(|t| (t.hour() * 60 + t.minute()) as f64);
            let sunset_minutes = ctx.sunset_today().map(|t| (t.hour() * 60 + t.minute()) as f64);
            match (
                parse_time_key(from, sunrise_minutes, sunset_minutes),
                to.as_deref().and_then(|t| parse_time_key(t, sunrise_minutes, sunset_minutes)),
            ) {
                (Some(start), Some(end)) => match_wraparound(now_minutes, start, end),
                (Some(start), None) => (now_minutes - start).abs() < 1.0,
                _ => false,
            }
        }
        Condition::Weekday { days, .. } => {
            let iso_weekday = ctx.now().weekday().number_from_monday() as u8;
            days.contains(&iso_weekday)
        }
        Condition::Pattern { lhs, statement, rhs, .. } => {
            let lhs_value = expand_pattern(lhs, meta, ctx, true);
            let rhs_value = expand_pattern(rhs, meta, ctx, true);
            match_scalar(&lhs_value, &rhs_value, *statement)
        }
    }
}

fn eval_leaf(observed: &Value, expected: &Value, statement: Statement) -> bool {
    match statement {
        Statement::Between => {
            if let Value::String(list) = expected {
                let bounds: Vec<f64> = list.split(',').filter_map(|s| s.trim().parse().ok()).collect();
                if let (Some(&a), Some(&b)) = (bounds.first(), bounds.get(1)) {
                    return observed.as_f64().map(|v| match_between(v, a, b)).unwrap_or(false);
                }
                false
            } else {
                false
            }
        }
        other => match_scalar(observed, expected, other),
    }
}

pub(crate) fn mqtt_leaf_value(payload: &[u8], sub_field: Option<&str>) -> Value {
    let text = String::from_utf8_lossy(payload).into_owned();
    match sub_field {
        None => Value::String(text),
        Some(path) => {
            let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) else {
                return Value::String(text);
            };
            match jsonpath_rust::JsonPath::from_str(&format!("$.{path}"))
                .ok()
                .and_then(|p| p.find_slice(&json).first().map(|v| v.clone().to_data()))
            {
                Some(serde_json::Value::String(s)) => Value::String(s),
                Some(serde_json::Value::Number(n)) => {
                    Value::Number(n.as_f64().unwrap_or(f64::NAN))
                }
                Some(serde_json::Value::Bool(b)) => Value::Bool(b),
                Some(other) => Value::String(other.to_string()),
                None => Value::Null,
            }
        }
    }
}

/// `dd.MM` or `dd.MM.yyyy` encoded as `MM*100 + dd` for wrap-around compare;
/// the year component (if present) is ignored, matching the leaf's scope.
fn parse_date_key(spec: &str) -> Option<f64> {
    let parts: Vec<&str> = spec.split('.').collect();
    let day: u32 = parts.first()?.parse().ok()?;
    let month: u32 = parts.get(1)?.parse().ok()?;
    Some((month * 100 + day) as f64)
}

fn parse_time_key(spec: &str, sunrise_minutes: Option<f64>, sunset_minutes: Option<f64>) -> Option<f64> {
    if let Some(offset) = spec.strip_prefix("sunrise") {
        return Some(sunrise_minutes? + parse_signed_minutes(offset)?);
    }
    if let Some(offset) = spec.strip_prefix("sunset") {
        return Some(sunset_minutes? + parse_signed_minutes(offset)?);
    }
    let (h, m) = spec.split_once(':')?;
    Some(f64::from_str(h).ok()? * 60.0 + f64::from_str(m).ok()?)
}

fn parse_signed_minutes(offset: &str) -> Option<f64> {
    if offset.is_empty() {
        return Some(0.0);
    }
    offset.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equals_coerces_bool_and_string() {
        assert!(match_scalar(
            &Value::Bool(true),
            &Value::String("on".to_string()),
            Statement::Equals
        ));
        assert!(!match_scalar(
            &Value::Bool(false),
            &Value::String("on".to_string()),
            Statement::Equals
        ));
    }

    #[test]
    fn null_equals_null_sentinel() {
        assert!(match_scalar(
            &Value::Null,
            &Value::String("_NULL_".to_string()),
            Statement::Equals
        ));
    }

    #[test]
    fn mqtt_leaf_value_extracts_json_path_sub_field() {
        let payload = br#"{"state": "on", "brightness": 42}"#;
        assert_eq!(mqtt_leaf_value(payload, Some("brightness")), Value::Number(42.0));
        assert_eq!(mqtt_leaf_value(payload, Some("state")), Value::String("on".to_string()));
    }

    #[test]
    fn mqtt_leaf_value_without_sub_field_is_raw_payload_string() {
        assert_eq!(mqtt_leaf_value(b"42", None), Value::String("42".to_string()));
    }

    #[test]
    fn wraparound_handles_overnight_range() {
        assert!(match_wraparound(23.5, 22.0, 6.0));
        assert!(match_wraparound(1.0, 22.0, 6.0));
        assert!(!match_wraparound(12.0, 22.0, 6.0));
    }

    #[test]
    fn between_auto_orders_bounds() {
        assert!(match_between(5.0, 10.0, 1.0));
        assert!(!match_between(11.0, 10.0, 1.0));
    }
}
