//! Order-independent content fingerprints for change detection.
//!
//! A fingerprint covers `{inputs, metrics, levels, recommendations}` of a
//! computed state. It is never used as a key or for write deduplication.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::StateError;

/// Nesting depth past which values are replaced by [`DEPTH_SENTINEL`].
pub const MAX_STRINGIFY_DEPTH: usize = 64;

pub const DEPTH_SENTINEL: &str = "\"[Truncated]\"";

const FINGERPRINT_COMPONENTS: [&str; 4] = ["inputs", "metrics", "levels", "recommendations"];

/// Serialize `value` with object keys sorted at every level.
///
/// Arrays keep their order. Nesting deeper than [`MAX_STRINGIFY_DEPTH`] is
/// replaced by a sentinel instead of recursing further.
#[must_use]
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, 0, &mut out);
    out
}

fn write_stable(value: &Value, depth: usize, out: &mut String) {
    if depth > MAX_STRINGIFY_DEPTH {
        out.push_str(DEPTH_SENTINEL);
        return;
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => {
            let _ = write!(out, "{number}");
        }
        Value::String(text) => write_json_string(text, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_stable(item, depth + 1, out);
            }
            out.push(']');
        }
        Value::Object(object) => write_sorted_object(object, depth, out),
    }
}

fn write_sorted_object(object: &Map<String, Value>, depth: usize, out: &mut String) {
    let mut keys = object.keys().collect::<Vec<_>>();
    keys.sort_unstable();
    out.push('{');
    for (index, key) in keys.into_iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_json_string(key, out);
        out.push(':');
        if let Some(child) = object.get(key) {
            write_stable(child, depth + 1, out);
        }
    }
    out.push('}');
}

fn write_json_string(text: &str, out: &mut String) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ch if u32::from(ch) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", u32::from(ch));
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
}

fn digest(stable: &str) -> String {
    let hash = Sha256::digest(stable.as_bytes());
    format!("sha256:{}", hex::encode(hash))
}

/// Fingerprint of an empty composite, substituted when fingerprinting fails.
#[must_use]
pub fn empty_fingerprint() -> String {
    digest("{}")
}

/// Fingerprint any serializable state exposing the four material components.
///
/// Missing components default to an empty object.
///
/// # Errors
/// Returns [`StateError::Serialization`] when `state` cannot be represented as JSON.
pub fn try_compute_fingerprint<T: Serialize>(state: &T) -> Result<String, StateError> {
    let value = serde_json::to_value(state)
        .map_err(|err| StateError::Serialization(format!("fingerprint source: {err}")))?;

    let mut composite = Map::new();
    for component in FINGERPRINT_COMPONENTS {
        let part = value
            .get(component)
            .filter(|part| !part.is_null())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        composite.insert(component.to_string(), part);
    }

    Ok(digest(&stable_stringify(&Value::Object(composite))))
}

/// Total variant of [`try_compute_fingerprint`]: failures yield [`empty_fingerprint`].
#[must_use]
pub fn compute_fingerprint<T: Serialize>(state: &T) -> String {
    try_compute_fingerprint(state).unwrap_or_else(|_| empty_fingerprint())
}
