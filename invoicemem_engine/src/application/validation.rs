use invoicemem_core::util;
use invoicemem_core::{NormalizedInvoice, ValidationRule};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Outcome of checking one transformation, correction or rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub field: String,
    pub memory_id: Option<String>,
    pub valid: bool,
    pub message: String,
}

impl ValidationResult {
    #[must_use]
    pub fn passed(field: &str, memory_id: &str) -> Self {
        Self {
            field: field.to_string(),
            memory_id: Some(memory_id.to_string()),
            valid: true,
            message: String::new(),
        }
    }

    #[must_use]
    pub fn failed(field: &str, memory_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            memory_id: memory_id.map(str::to_string),
            valid: false,
            message: message.into(),
        }
    }
}

/// Check a correction memory's validation rule against the built invoice.
#[must_use]
pub fn check_rule(
    rule: &ValidationRule,
    invoice: &NormalizedInvoice,
    memory_id: &str,
) -> ValidationResult {
    let (field, outcome) = match rule {
        ValidationRule::Required { field } => (
            field,
            match invoice.field_value(field) {
                Some(value) if !util::is_blank(&value) => Ok(()),
                _ => Err(format!("'{field}' is required")),
            },
        ),
        ValidationRule::Range { field, min, max } => (
            field,
            match invoice.field_value(field).as_ref().and_then(util::value_as_f64) {
                Some(v) if (*min..=*max).contains(&v) => Ok(()),
                Some(v) => Err(format!("'{field}' = {v} outside [{min}, {max}]")),
                None => Err(format!("'{field}' has no numeric value")),
            },
        ),
        ValidationRule::Pattern { field, pattern } => (
            field,
            match (Regex::new(pattern), invoice.field_value(field)) {
                (Err(e), _) => Err(format!("invalid pattern '{pattern}': {e}")),
                (Ok(re), Some(value)) if re.is_match(&util::value_to_text(&value)) => Ok(()),
                (Ok(_), _) => Err(format!("'{field}' does not match '{pattern}'")),
            },
        ),
    };

    match outcome {
        Ok(()) => ValidationResult::passed(field, memory_id),
        Err(message) => ValidationResult::failed(field, Some(memory_id), message),
    }
}
