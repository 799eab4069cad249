//! Field-mapping transformations and the raw-text fallback scan.

use invoicemem_core::TransformationRule;
use invoicemem_core::util;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use thiserror::Error;

static CURRENCY_CODE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\b([A-Z]{3})\b").ok());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("'{0}' is not a date in DD.MM.YYYY, YYYY-MM-DD or MM/DD/YYYY")]
    InvalidDate(String),
    #[error("no amount found in '{0}'")]
    NoAmount(String),
    #[error("invalid regex '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("group '{group}' did not match '{input}'")]
    NoMatch { group: String, input: String },
}

/// Apply a mapping's transformation to a source value.
pub fn apply(
    rule: &TransformationRule,
    value: &Value,
    default_currency: &str,
) -> Result<Value, TransformError> {
    match rule {
        TransformationRule::Direct => Ok(value.clone()),
        TransformationRule::DateParse => {
            let text = util::value_to_text(value);
            util::parse_date(&text)
                .map(|date| Value::String(date.to_string()))
                .ok_or(TransformError::InvalidDate(text))
        }
        TransformationRule::CurrencyExtraction => extract_currency(value, default_currency),
        TransformationRule::TextNormalization {
            trim,
            lowercase,
            uppercase,
            collapse_whitespace,
        } => {
            let mut text = util::value_to_text(value);
            if *collapse_whitespace {
                text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            }
            if *trim {
                text = text.trim().to_string();
            }
            if *lowercase {
                text = text.to_lowercase();
            } else if *uppercase {
                text = text.to_uppercase();
            }
            Ok(Value::String(text))
        }
        TransformationRule::RegexExtraction { pattern, group } => {
            let re = Regex::new(pattern).map_err(|e| TransformError::InvalidRegex {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            let input = util::value_to_text(value);
            re.captures(&input)
                .and_then(|caps| caps.name(group))
                .map(|m| Value::String(m.as_str().to_string()))
                .ok_or_else(|| TransformError::NoMatch {
                    group: group.clone(),
                    input,
                })
        }
    }
}

fn extract_currency(value: &Value, default_currency: &str) -> Result<Value, TransformError> {
    if let Some(amount) = value.as_f64() {
        return Ok(json!({ "amount": amount, "currency": default_currency }));
    }

    let text = util::value_to_text(value);
    let code = CURRENCY_CODE
        .as_ref()
        .and_then(|re| re.captures(&text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .or_else(|| symbol_currency(&text).map(str::to_string));

    let numeric: String = text
        .chars()
        .filter(|c| !c.is_ascii_alphabetic() && !matches!(c, '€' | '$' | '£'))
        .collect();
    let amount = util::parse_amount(&numeric).ok_or_else(|| TransformError::NoAmount(text.clone()))?;

    Ok(json!({
        "amount": amount,
        "currency": code.unwrap_or_else(|| default_currency.to_string()),
    }))
}

fn symbol_currency(text: &str) -> Option<&'static str> {
    if text.contains('€') {
        Some("EUR")
    } else if text.contains('£') {
        Some("GBP")
    } else if text.contains('$') {
        Some("USD")
    } else {
        None
    }
}

/// Look for `<source> [:=-] value` on a line of the raw text.
#[must_use]
pub fn scan_raw_text(raw_text: &str, source_field: &str) -> Option<Value> {
    if raw_text.is_empty() || source_field.trim().is_empty() {
        return None;
    }
    // Labels ending in a word character must not match a longer label.
    let boundary = if source_field.ends_with(|c: char| c.is_alphanumeric() || c == '_') {
        r"\b"
    } else {
        ""
    };
    let pattern = format!(
        r"(?im)^\s*{}{boundary}\s*[:=\-]?\s*(?P<value>[^\r\n]+?)\s*$",
        regex::escape(source_field)
    );
    let re = Regex::new(&pattern).ok()?;
    re.captures(raw_text)
        .and_then(|caps| caps.name("value"))
        .map(|m| Value::String(m.as_str().to_string()))
}
