//! `{{ ... }}` / `[[ ... ]]` placeholder expansion, described in spec §4.2.

use chrono::{DateTime, Timelike, Utc};
use jsonpath_rust::JsonPath;
use regex::Regex;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::expr::expression::evaluate_expression;
use crate::model::Value;

const NULL_SENTINEL: &str = "_NULL_";

#[derive(Clone, Debug, Default)]
pub struct PatternMeta {
    pub trigger_name: Option<String>,
    pub trigger_endpoint: Option<String>,
    pub trigger_property: Option<String>,
    pub shell_output: Option<String>,
}

/// Narrow read interface the pattern expander needs from the Controller's
/// device catalog, MQTT retained payloads, and named-state map.
pub trait PatternContext: Send + Sync {
    fn property(&self, endpoint: &str, prop: &str) -> Option<Value>;
    fn mqtt_payload(&self, topic: &str) -> Option<Vec<u8>>;
    fn state(&self, name: &str) -> Option<Value>;
    fn file_contents(&self, path: &str) -> Option<String>;
    fn sunrise_today(&self) -> Option<DateTime<Utc>>;
    fn sunset_today(&self) -> Option<DateTime<Utc>>;
    fn now(&self) -> DateTime<Utc>;
}

fn expr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[(?s)(.*?)\]\]").unwrap())
}

fn spec_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(?s)(.*?)\}\}").unwrap())
}

/// Expands every `[[expr]]` and `{{spec}}` placeholder in `input`, then
/// coerces the resulting string to a typed value.
pub fn expand_pattern(
    input: &str,
    meta: &PatternMeta,
    ctx: &dyn PatternContext,
    condition: bool,
) -> Value {
    let is_shell_escape = input.starts_with("#!");

    let after_expr = if is_shell_escape {
        input.to_string()
    } else {
        expr_regex()
            .replace_all(input, |caps: &regex::Captures| {
                let value = evaluate_expression(caps[1].trim());
                format_number_trimmed(value)
            })
            .into_owned()
    };

    let after_spec = spec_regex()
        .replace_all(&after_expr, |caps: &regex::Captures| {
            expand_spec(caps[1].trim(), meta, ctx)
        })
        .into_owned();

    let after_conditional = expand_inline_conditional(&after_spec, meta, ctx);

    coerce(after_conditional.trim(), condition)
}

fn format_number_trimmed(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    let text = format!("{value:.6}");
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

/// Coerces a bare string to a scalar `Value` (`"true"`/`"false"` -> bool,
/// parseable number -> number, else string). Shared with the Property
/// action's comma-split-to-JSON-array handling in runner.rs.
pub(crate) fn coerce_scalar(text: &str) -> Value {
    coerce(text, false)
}

fn coerce(text: &str, condition: bool) -> Value {
    if text.is_empty() {
        return if condition {
            Value::Null
        } else {
            Value::String(NULL_SENTINEL.to_string())
        };
    }
    match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match text.parse::<f64>() {
            Ok(n) => Value::Number(n),
            Err(_) => Value::String(text.to_string()),
        },
    }
}

/// Splits on `|`, honoring single-quoted tokens that preserve whitespace.
fn split_tokens(spec: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in spec.chars() {
        match c {
            '\'' => in_quotes = !in_quotes,
            '|' if !in_quotes => {
                tokens.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    tokens.push(current.trim().to_string());
    tokens
}

fn expand_spec(spec: &str, meta: &PatternMeta, ctx: &dyn PatternContext) -> String {
    let tokens = split_tokens(spec);
    let head = tokens.first().map(String::as_str).unwrap_or("");

    match head {
        "property" => {
            let endpoint = tokens.get(1).map(String::as_str).unwrap_or("");
            let prop = tokens.get(2).map(String::as_str).unwrap_or("");
            let default = tokens.get(3).cloned().unwrap_or_default();
            ctx.property(endpoint, prop)
                .map(|v| v.to_string())
                .unwrap_or(default)
        }
        "mqtt" => {
            let topic = tokens.get(1).map(String::as_str).unwrap_or("");
            let json_path = tokens.get(2).map(String::as_str);
            let Some(payload) = ctx.mqtt_payload(topic) else {
                return String::new();
            };
            match json_path {
                Some(path) if !path.is_empty() => extract_json_path(&payload, path),
                _ => String::from_utf8_lossy(&payload).into_owned(),
            }
        }
        "state" => {
            let name = tokens.get(1).map(String::as_str).unwrap_or("");
            ctx.state(name).map(|v| v.to_string()).unwrap_or_default()
        }
        "file" => {
            let path = tokens.get(1).map(String::as_str).unwrap_or("");
            ctx.file_contents(path).unwrap_or_default()
        }
        "timestamp" => {
            let fmt = tokens.get(1).map(String::as_str).unwrap_or("");
            let now = ctx.now();
            if fmt.is_empty() {
                now.timestamp().to_string()
            } else {
                now.format(fmt).to_string()
            }
        }
        "sunrise" => format_solar(ctx.sunrise_today(), tokens.get(1)),
        "sunset" => format_solar(ctx.sunset_today(), tokens.get(1)),
        "triggerName" => meta.trigger_name.clone().unwrap_or_default(),
        "triggerProperty" => meta.trigger_property.clone().unwrap_or_default(),
        "colorTemperature" => {
            let min: f64 = tokens.get(1).and_then(|s| s.parse().ok()).unwrap_or(153.0);
            let max: f64 = tokens.get(2).and_then(|s| s.parse().ok()).unwrap_or(500.0);
            interpolate_color_temperature(ctx, min, max).to_string()
        }
        _ => expand_inline_conditional(spec, meta, ctx),
    }
}

fn format_solar(value: Option<DateTime<Utc>>, fmt: Option<&String>) -> String {
    let Some(value) = value else {
        return String::new();
    };
    match fmt.map(String::as_str) {
        None | Some("") => value.timestamp().to_string(),
        Some(fmt) => value.format(fmt).to_string(),
    }
}

fn extract_json_path(payload: &[u8], path: &str) -> String {
    let Ok(text) = std::str::from_utf8(payload) else {
        return String::new();
    };
    let Ok(json) = serde_json::Value::from_str(text) else {
        return String::new();
    };
    let full_path = format!("$.{path}");
    match JsonPath::from_str(&full_path) {
        Ok(jsonpath) => jsonpath
            .find_slice(&json)
            .first()
            .map(|v| match v.clone().to_data() {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// Linear interpolation between `min`/`max` mireds based on how far the sun
/// is above or below the horizon right now.
fn interpolate_color_temperature(ctx: &dyn PatternContext, min: f64, max: f64) -> u32 {
    let now = ctx.now();
    let minute_of_day = (now.hour() * 60 + now.minute()) as f64;
    let sunrise_minute = ctx
        .sunrise_today()
        .map(|t| (t.hour() * 60 + t.minute()) as f64)
        .unwrap_or(360.0);
    let sunset_minute = ctx
        .sunset_today()
        .map(|t| (t.hour() * 60 + t.minute()) as f64)
        .unwrap_or(1080.0);

    if minute_of_day <= sunrise_minute || minute_of_day >= sunset_minute {
        return max as u32;
    }

    let midday = (sunrise_minute + sunset_minute) / 2.0;
    let half_span = (sunset_minute - sunrise_minute) / 2.0;
    let distance_from_midday = (minute_of_day - midday).abs();
    let fraction = (distance_from_midday / half_span).clamp(0.0, 1.0);

    (min + (max - min) * fraction) as u32
}

/// `A if X OP Y else B`, iterated while the pattern keeps matching.
fn expand_inline_conditional(spec: &str, meta: &PatternMeta, ctx: &dyn PatternContext) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?s)^(.*?)\s+if\s+(.+?)\s+(is|==|!=|>=|<=|>|<)\s+(.+?)\s+else\s+(.*)$",
        )
        .unwrap()
    });

    let mut current = spec.to_string();
    loop {
        let Some(caps) = re.captures(&current) else {
            return current;
        };
        let head = caps[1].to_string();
        let lhs = expand_operand(caps[2].trim(), meta, ctx);
        let op = caps[3].to_string();
        let rhs_raw = caps[4].trim();
        let tail = caps[5].to_string();

        let matched = if op == "is" {
            match rhs_raw {
                "defined" => lhs != NULL_SENTINEL,
                "undefined" => lhs == NULL_SENTINEL,
                _ => lhs == rhs_raw,
            }
        } else {
            let rhs = expand_operand(rhs_raw, meta, ctx);
            compare(&lhs, op.as_str(), &rhs)
        };

        current = if matched { head } else { tail };
        if !re.is_match(&current) {
            return current;
        }
    }
}

fn expand_operand(token: &str, meta: &PatternMeta, ctx: &dyn PatternContext) -> String {
    if token.contains("{{") {
        spec_regex()
            .replace_all(token, |caps: &regex::Captures| {
                expand_spec(caps[1].trim(), meta, ctx)
            })
            .into_owned()
    } else {
        token.to_string()
    }
}

fn compare(lhs: &str, op: &str, rhs: &str) -> bool {
    if let (Ok(a), Ok(b)) = (lhs.parse::<f64>(), rhs.parse::<f64>()) {
        return match op {
            "==" => a == b,
            "!=" => a != b,
            ">" => a > b,
            ">=" => a >= b,
            "<" => a < b,
            "<=" => a <= b,
            _ => false,
        };
    }
    match op {
        "==" => lhs == rhs,
        "!=" => lhs != rhs,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullContext;

    impl PatternContext for NullContext {
        fn property(&self, _endpoint: &str, _prop: &str) -> Option<Value> {
            None
        }
        fn mqtt_payload(&self, _topic: &str) -> Option<Vec<u8>> {
            None
        }
        fn state(&self, _name: &str) -> Option<Value> {
            None
        }
        fn file_contents(&self, _path: &str) -> Option<String> {
            None
        }
        fn sunrise_today(&self) -> Option<DateTime<Utc>> {
            None
        }
        fn sunset_today(&self) -> Option<DateTime<Utc>> {
            None
        }
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    struct LampContext;

    impl PatternContext for LampContext {
        fn property(&self, endpoint: &str, prop: &str) -> Option<Value> {
            if endpoint == "lamp/1" && prop == "brightness" {
                Some(Value::Number(75.0))
            } else {
                None
            }
        }
        fn mqtt_payload(&self, _topic: &str) -> Option<Vec<u8>> {
            None
        }
        fn state(&self, _name: &str) -> Option<Value> {
            None
        }
        fn file_contents(&self, _path: &str) -> Option<String> {
            None
        }
        fn sunrise_today(&self) -> Option<DateTime<Utc>> {
            None
        }
        fn sunset_today(&self) -> Option<DateTime<Utc>> {
            None
        }
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    #[test]
    fn expands_expression_and_property() {
        let value = expand_pattern(
            "[[ 2 + 3 * 4 ]] {{property|lamp/1|brightness|0}}",
            &PatternMeta::default(),
            &LampContext,
            false,
        );
        assert_eq!(value, Value::String("14 75".to_string()));
    }

    #[test]
    fn missing_property_falls_back_to_default() {
        let value = expand_pattern(
            "{{property|missing/1|brightness|42}}",
            &PatternMeta::default(),
            &NullContext,
            false,
        );
        assert_eq!(value, Value::Number(42.0));
    }

    #[test]
    fn empty_result_outside_condition_is_null_sentinel_string() {
        let value = expand_pattern("{{state|missing}}", &PatternMeta::default(), &NullContext, false);
        assert_eq!(value, Value::String(NULL_SENTINEL.to_string()));
    }

    #[test]
    fn shell_escape_skips_expression_expansion() {
        let value = expand_pattern("#![[1+1]]", &PatternMeta::default(), &NullContext, false);
        assert_eq!(value, Value::String("#![[1+1]]".to_string()));
    }

    #[test]
    fn inline_conditional_picks_matching_branch() {
        let value = expand_pattern(
            "on if {{property|lamp/1|brightness|0}} > 50 else off",
            &PatternMeta::default(),
            &LampContext,
            false,
        );
        assert_eq!(value, Value::String("on".to_string()));
    }
}
