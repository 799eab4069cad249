//! Value parsing helpers and pattern signature hashing.

use chrono::NaiveDate;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Date formats tried in order when parsing invoice dates.
pub const DATE_FORMATS: [&str; 3] = ["%d.%m.%Y", "%Y-%m-%d", "%m/%d/%Y"];

/// Compute a SHA-256 signature for a learned correction pattern.
///
/// Concatenates field, normalized value and optional vendor scope, then
/// returns the hex-encoded digest.
#[must_use]
pub fn pattern_signature(field: &str, normalized_value: &str, vendor_id: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(field.as_bytes());
    hasher.update(b":");
    hasher.update(normalized_value.as_bytes());
    hasher.update(b":");
    hasher.update(vendor_id.unwrap_or("*").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parse a date using [`DATE_FORMATS`], first match wins.
#[must_use]
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

/// Parse a monetary amount written with either `.` or `,` as decimal separator.
///
/// When both separators appear the last one is the decimal separator. A lone
/// comma followed by exactly three digits is treated as a thousands separator.
#[must_use]
pub fn parse_amount(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(comma)) => {
            let decimals = cleaned.len() - comma - 1;
            if cleaned.matches(',').count() == 1 && decimals != 3 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (Some(_), None) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Numeric view of a JSON value; numeric strings are parsed with [`parse_amount`].
#[must_use]
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_amount(s),
        Value::Object(map) => map.get("amount").and_then(value_as_f64),
        _ => None,
    }
}

/// Text view of a JSON value. Strings are returned without quotes.
#[must_use]
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Whether a value carries no information (null, blank string, empty container).
#[must_use]
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Grouping key for a corrected value: trimmed, lowercased, whitespace collapsed.
#[must_use]
pub fn normalize_value_key(value: &Value) -> String {
    value_to_text(value)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
