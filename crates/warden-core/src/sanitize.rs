//! Sanitization of tool parameters before they are recorded in a span.
//!
//! Two separate concerns:
//! - **Redaction**: values under sensitive keys are replaced wholesale
//! - **Bounding**: everything else is truncated so a span stays small
//!
//! Truncation alone is never treated as redaction. A 20-character API key
//! survives a 512-character truncation intact.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};

/// Marker written in place of a sensitive value.
pub const REDACTED: &str = "[REDACTED]";

const TRUNCATION_MARKER: &str = "…[truncated]";

lazy_static! {
    /// Parameter names whose values must never be recorded.
    /// Matches anywhere in the key: `x_api_key`, `refreshToken`, `db_password`.
    static ref SENSITIVE_KEY_PATTERN: Regex = Regex::new(
        r"(?i)(api[_-]?key|token|password|passwd|secret|authorization|credential|cookie)"
    ).unwrap();
}

/// Bounds applied while sanitizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeOptions {
    /// Maximum characters kept from any string value
    pub max_value_len: usize,

    /// Nesting depth below which values are summarized
    pub max_depth: usize,

    /// Maximum array elements kept
    pub max_array_len: usize,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            max_value_len: 512,
            max_depth: 4,
            max_array_len: 32,
        }
    }
}

/// Check if a parameter name refers to a credential.
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY_PATTERN.is_match(key)
}

/// Truncate to at most `max_chars` characters, on a char boundary.
pub fn truncate(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        None => value.to_string(),
        Some((byte_idx, _)) => format!("{}{}", &value[..byte_idx], TRUNCATION_MARKER),
    }
}

/// Produce a copy of `params` that is safe to persist.
pub fn sanitize_params(params: &Value, options: &SanitizeOptions) -> Value {
    sanitize_value(params, options, 0)
}

fn sanitize_value(value: &Value, options: &SanitizeOptions, depth: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s, options.max_value_len)),
        Value::Object(map) => {
            if depth >= options.max_depth {
                return Value::String(format!("{{…{} keys}}", map.len()));
            }
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let sanitized = if is_sensitive_key(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    sanitize_value(inner, options, depth + 1)
                };
                out.insert(key.clone(), sanitized);
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if depth >= options.max_depth {
                return Value::String(format!("[…{} items]", items.len()));
            }
            let mut out: Vec<Value> = items
                .iter()
                .take(options.max_array_len)
                .map(|item| sanitize_value(item, options, depth + 1))
                .collect();
            if items.len() > options.max_array_len {
                out.push(Value::String(format!(
                    "…{} more",
                    items.len() - options.max_array_len
                )));
            }
            Value::Array(out)
        }
        other => other.clone(),
    }
}
