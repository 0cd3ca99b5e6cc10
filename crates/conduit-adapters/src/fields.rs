//! Sentinel-filling coercions shared by the normalizers.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

pub(crate) type Object = Map<String, Value>;

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Trimmed text; null, absent and structured values become `""`.
pub(crate) fn text(obj: &Object, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Loose boolean: `yes`, `y`, `true`, `1` (any case) and non-zero numbers are true.
pub(crate) fn flag(obj: &Object, key: &str) -> bool {
    match obj.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "yes" | "y" | "true" | "1"
        ),
        _ => false,
    }
}

/// RFC 3339 UTC rendering when the value parses; otherwise the trimmed text as delivered.
pub(crate) fn timestamp(obj: &Object, key: &str) -> (String, Option<DateTime<Utc>>) {
    let raw = text(obj, key);
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(parsed) => {
            let utc = parsed.with_timezone(&Utc);
            (utc.to_rfc3339_opts(SecondsFormat::AutoSi, true), Some(utc))
        }
        Err(_) => (raw, None),
    }
}

pub(crate) fn nested<'a>(obj: &'a Object, key: &str) -> Option<&'a Object> {
    obj.get(key).and_then(Value::as_object)
}
