//! Trigger-condition evaluation and correction actions.

use invoicemem_core::util;
use invoicemem_core::{ActionType, Condition, ConditionOperator, CorrectionAction};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Field values visible to trigger conditions, keyed by field name.
pub type FieldView = BTreeMap<String, Value>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("field '{0}' has no value to operate on")]
    MissingValue(String),
    #[error("field '{field}' value '{value}' is not numeric")]
    NotNumeric { field: String, value: String },
    #[error("'{search}' not found in field '{field}'")]
    SearchNotFound { field: String, search: String },
}

/// Logical AND over all conditions. An empty list never fires.
#[must_use]
pub fn all_match(conditions: &[Condition], view: &FieldView) -> bool {
    !conditions.is_empty() && conditions.iter().all(|c| matches(c, view))
}

#[must_use]
pub fn matches(condition: &Condition, view: &FieldView) -> bool {
    let actual = view.get(&condition.field).filter(|v| !util::is_blank(v));
    let expected = condition.value.as_ref();

    match condition.operator {
        ConditionOperator::Exists => actual.is_some(),
        ConditionOperator::NotExists => actual.is_none(),
        ConditionOperator::Equals => match (actual, expected) {
            (Some(a), Some(e)) => values_equal(a, e),
            _ => false,
        },
        ConditionOperator::NotEquals => match (actual, expected) {
            (Some(a), Some(e)) => !values_equal(a, e),
            (None, Some(_)) => true,
            (_, None) => actual.is_some(),
        },
        ConditionOperator::GreaterThan => compare(actual, expected).is_some_and(|(a, e)| a > e),
        ConditionOperator::LessThan => compare(actual, expected).is_some_and(|(a, e)| a < e),
        ConditionOperator::Contains => match (actual, expected) {
            (Some(Value::Array(items)), Some(e)) => items.iter().any(|item| values_equal(item, e)),
            (Some(a), Some(e)) => util::value_to_text(a)
                .to_lowercase()
                .contains(&util::value_to_text(e).to_lowercase()),
            _ => false,
        },
        ConditionOperator::Matches => match (actual, expected) {
            (Some(a), Some(e)) => Regex::new(&util::value_to_text(e))
                .is_ok_and(|re| re.is_match(&util::value_to_text(a))),
            _ => false,
        },
    }
}

fn strict_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (strict_number(a), strict_number(b)) {
        (Some(x), Some(y)) => (x - y).abs() < 1e-9,
        _ => util::value_to_text(a).trim() == util::value_to_text(b).trim(),
    }
}

fn compare(actual: Option<&Value>, expected: Option<&Value>) -> Option<(f64, f64)> {
    Some((
        util::value_as_f64(actual?)?,
        util::value_as_f64(expected?)?,
    ))
}

/// Compute the corrected value for the action's target field.
pub fn apply_action(
    action: &CorrectionAction,
    current: Option<&Value>,
) -> Result<Value, ActionError> {
    let field = &action.target_field;
    let current = current.filter(|v| !util::is_blank(v));

    match action.action_type {
        ActionType::Set => Ok(action.new_value.clone()),
        ActionType::Multiply | ActionType::Add => {
            let current = current.ok_or_else(|| ActionError::MissingValue(field.clone()))?;
            let base = number(field, current)?;
            let operand = number(field, &action.new_value)?;
            let result = if action.action_type == ActionType::Multiply {
                base * operand
            } else {
                base + operand
            };
            Ok(Value::from(round_cents(result)))
        }
        ActionType::Replace => {
            let replacement = util::value_to_text(&action.new_value);
            match &action.search {
                None => Ok(Value::String(replacement)),
                Some(search) => {
                    let text = current
                        .map(util::value_to_text)
                        .ok_or_else(|| ActionError::MissingValue(field.clone()))?;
                    if text.contains(search.as_str()) {
                        Ok(Value::String(text.replace(search.as_str(), &replacement)))
                    } else {
                        Err(ActionError::SearchNotFound {
                            field: field.clone(),
                            search: search.clone(),
                        })
                    }
                }
            }
        }
    }
}

fn number(field: &str, value: &Value) -> Result<f64, ActionError> {
    util::value_as_f64(value).ok_or_else(|| ActionError::NotNumeric {
        field: field.to_string(),
        value: util::value_to_text(value),
    })
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
