//! Byte-stable canonical JSON for externally witnessed payloads.
//!
//! Every state transition the core produces (selections, exclusions,
//! investigations, pool-mode changes) is rendered through this module before
//! being handed to an external signer. The profile is a strict subset of
//! RFC 8785 (JCS):
//!
//! - object keys sorted lexicographically (byte order)
//! - no insignificant whitespace
//! - integer-only numbers within the signed 64-bit range; ratios such as
//!   confidence are carried as basis points (see [`to_basis_points`])
//! - minimal string escaping (quote, reverse solidus, U+0000..=U+001F)
//!
//! Two equal values therefore always render to identical bytes.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Scale used when converting a `[0, 1]` ratio to integer basis points.
pub const BASIS_POINTS_SCALE: f64 = 10_000.0;

/// Errors that can occur during canonical rendering.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// The value could not be converted to a JSON tree.
    #[error("serialization failed: {message}")]
    Serialize {
        /// Description from `serde_json`.
        message: String,
    },

    /// A floating-point number was encountered.
    #[error("float not allowed at '{path}': canonical payloads are integer-only")]
    FloatNotAllowed {
        /// JSON path of the offending number.
        path: String,
    },

    /// An unsigned number exceeded the signed 64-bit range.
    #[error("number out of range at '{path}': {value}")]
    NumberOutOfRange {
        /// JSON path of the offending number.
        path: String,
        /// Decimal rendering of the number.
        value: String,
    },
}

/// Renders `value` as canonical JSON bytes.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value cannot be serialized or contains
/// numbers outside the integer-only profile.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    to_canonical_string(value).map(String::into_bytes)
}

/// Renders `value` as a canonical JSON string.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value cannot be serialized or contains
/// numbers outside the integer-only profile.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let tree = serde_json::to_value(value).map_err(|e| CanonicalError::Serialize {
        message: e.to_string(),
    })?;
    validate(&tree, "$")?;
    let mut output = String::new();
    emit_value(&tree, &mut output);
    Ok(output)
}

/// Converts a ratio in `[0, 1]` to basis points, clamping out-of-range input.
///
/// `NaN` maps to 0.
#[must_use]
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "input is clamped to [0, 1] so the product fits in u32"
)]
pub fn to_basis_points(ratio: f64) -> u32 {
    if ratio.is_nan() {
        return 0;
    }
    (ratio.clamp(0.0, 1.0) * BASIS_POINTS_SCALE).round() as u32
}

fn validate(value: &Value, path: &str) -> Result<(), CanonicalError> {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(n) => validate_number(n, path),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                validate(item, &format!("{path}[{i}]"))?;
            }
            Ok(())
        },
        Value::Object(obj) => {
            for (key, item) in obj {
                validate(item, &format!("{path}.{key}"))?;
            }
            Ok(())
        },
    }
}

fn validate_number(n: &Number, path: &str) -> Result<(), CanonicalError> {
    if n.is_i64() {
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        if i64::try_from(u).is_err() {
            return Err(CanonicalError::NumberOutOfRange {
                path: path.to_string(),
                value: u.to_string(),
            });
        }
        return Ok(());
    }
    Err(CanonicalError::FloatNotAllowed {
        path: path.to_string(),
    })
}

fn emit_value(value: &Value, output: &mut String) {
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output),
        Value::String(s) => emit_string(s, output),
        Value::Array(items) => {
            output.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                emit_value(item, output);
            }
            output.push(']');
        },
        Value::Object(obj) => emit_object(obj, output),
    }
}

fn emit_number(n: &Number, output: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(output, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(output, "{u}");
    } else {
        output.push_str(&n.to_string());
    }
}

fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if c <= '\u{001F}' => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_object(obj: &Map<String, Value>, output: &mut String) {
    let mut keys: Vec<&String> = obj.keys().collect();
    keys.sort();

    output.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(&obj[*key], output);
    }
    output.push('}');
}
