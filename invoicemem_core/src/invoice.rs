//! Invoice records: the immutable raw input, the incrementally built
//! normalized invoice and the result handed to downstream systems.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::audit::AuditStep;
use crate::decision::Decision;
use crate::learning::MemoryUpdate;
use crate::util;

/// Canonical normalized field names understood by [`NormalizedInvoice::set_field`].
pub mod fields {
    pub const INVOICE_NUMBER: &str = "invoiceNumber";
    pub const INVOICE_DATE: &str = "invoiceDate";
    pub const SERVICE_DATE: &str = "serviceDate";
    pub const DUE_DATE: &str = "dueDate";
    pub const TOTAL_AMOUNT: &str = "totalAmount";
    pub const NET_AMOUNT: &str = "netAmount";
    pub const VAT_AMOUNT: &str = "vatAmount";
    pub const CURRENCY: &str = "currency";
    pub const LINE_ITEMS: &str = "lineItems";
    pub const PO_NUMBER: &str = "poNumber";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedField {
    pub name: String,
    pub value: Value,
    pub confidence: f64,
}

impl ExtractedField {
    #[must_use]
    pub fn new(name: &str, value: Value, confidence: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            confidence,
        }
    }
}

/// Invoice as delivered by upstream extraction. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawInvoice {
    pub id: String,
    pub vendor_id: String,
    pub invoice_number: String,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub extracted_fields: Vec<ExtractedField>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl RawInvoice {
    /// Exact-name lookup of an extracted field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.extracted_fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Money {
    pub amount: f64,
    pub currency: String,
}

impl Money {
    #[must_use]
    pub fn zero(currency: &str) -> Self {
        Self {
            amount: 0.0,
            currency: currency.to_string(),
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.amount.abs() < f64::EPSILON
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vat_rate: Option<f64>,
}

impl LineItem {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let number = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| obj.get(*k))
                .and_then(util::value_as_f64)
        };
        let quantity = number(&["quantity", "qty"]).unwrap_or(1.0);
        let unit_price = number(&["unitPrice", "unit_price", "price"]);
        let total_price = number(&["totalPrice", "total_price", "total", "amount"]);
        let (unit_price, total_price) = match (unit_price, total_price) {
            (Some(unit), Some(total)) => (unit, total),
            (Some(unit), None) => (unit, unit * quantity),
            (None, Some(total)) if quantity.abs() > f64::EPSILON => (total / quantity, total),
            (None, Some(total)) => (total, total),
            (None, None) => return None,
        };
        Some(Self {
            description: obj
                .get("description")
                .map(util::value_to_text)
                .unwrap_or_default(),
            quantity,
            unit_price,
            total_price,
            vat_rate: number(&["vatRate", "vat_rate"]),
        })
    }
}

/// Provenance of one normalized value: which memory produced it from what.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedField {
    pub original_field: String,
    pub normalized_field: String,
    pub original_value: Value,
    pub normalized_value: Value,
    pub memory_id: String,
    pub confidence: f64,
}

/// A proposed change to one field, produced by a correction memory or a human.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Correction {
    pub field: String,
    #[serde(default)]
    pub original_value: Value,
    pub corrected_value: Value,
    #[serde(default)]
    pub reason: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
}

impl Correction {
    /// Human correction without memory provenance.
    #[must_use]
    pub fn manual(field: &str, original_value: Value, corrected_value: Value) -> Self {
        Self {
            field: field.to_string(),
            original_value,
            corrected_value,
            reason: "human correction".to_string(),
            confidence: 1.0,
            memory_id: None,
            vendor_id: None,
        }
    }

    #[must_use]
    pub fn for_vendor(mut self, vendor_id: &str) -> Self {
        self.vendor_id = Some(vendor_id.to_string());
        self
    }

    /// Empty fields, blank values and non-positive confidence cannot teach anything.
    #[must_use]
    pub fn is_learnable(&self) -> bool {
        !self.field.trim().is_empty()
            && !util::is_blank(&self.corrected_value)
            && self.confidence > 0.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("field '{field}' expects a date, got {value}")]
    InvalidDate { field: String, value: String },
    #[error("field '{field}' expects an amount, got {value}")]
    InvalidAmount { field: String, value: String },
    #[error("field '{field}' expects a list of line items")]
    InvalidLineItems { field: String },
}

/// Invoice after memories have been applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedInvoice {
    pub id: String,
    pub vendor_id: String,
    pub invoice_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_amount: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vat_amount: Option<Money>,
    pub total_amount: Money,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub po_number: Option<String>,
    #[serde(default)]
    pub additional_fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub normalized_fields: Vec<NormalizedField>,
}

impl NormalizedInvoice {
    /// Seed identifiers and zero amounts from the raw invoice.
    #[must_use]
    pub fn seed(raw: &RawInvoice, default_currency: &str) -> Self {
        Self {
            id: raw.id.clone(),
            vendor_id: raw.vendor_id.clone(),
            invoice_number: raw.invoice_number.clone(),
            invoice_date: None,
            service_date: None,
            due_date: None,
            currency: default_currency.to_string(),
            net_amount: None,
            vat_amount: None,
            total_amount: Money::zero(default_currency),
            line_items: Vec::new(),
            po_number: None,
            additional_fields: BTreeMap::new(),
            normalized_fields: Vec::new(),
        }
    }

    /// Assign a value by normalized field name. Unknown names land in
    /// `additional_fields`.
    pub fn set_field(&mut self, name: &str, value: &Value) -> Result<(), FieldError> {
        match name {
            fields::INVOICE_NUMBER => self.invoice_number = util::value_to_text(value),
            fields::INVOICE_DATE => self.invoice_date = Some(Self::date(name, value)?),
            fields::SERVICE_DATE => self.service_date = Some(Self::date(name, value)?),
            fields::DUE_DATE => self.due_date = Some(Self::date(name, value)?),
            fields::CURRENCY => {
                let currency = util::value_to_text(value).trim().to_uppercase();
                self.total_amount.currency.clone_from(&currency);
                for money in [&mut self.net_amount, &mut self.vat_amount]
                    .into_iter()
                    .flatten()
                {
                    money.currency.clone_from(&currency);
                }
                self.currency = currency;
            }
            fields::TOTAL_AMOUNT => self.total_amount = self.money(name, value)?,
            fields::NET_AMOUNT => self.net_amount = Some(self.money(name, value)?),
            fields::VAT_AMOUNT => self.vat_amount = Some(self.money(name, value)?),
            fields::LINE_ITEMS => {
                let items = value.as_array().ok_or_else(|| FieldError::InvalidLineItems {
                    field: name.to_string(),
                })?;
                self.line_items = items.iter().filter_map(LineItem::from_value).collect();
            }
            fields::PO_NUMBER => self.po_number = Some(util::value_to_text(value)),
            _ => {
                self.additional_fields
                    .insert(name.to_string(), value.clone());
            }
        }
        Ok(())
    }

    /// Current value of a field by normalized name, as JSON.
    #[must_use]
    pub fn field_value(&self, name: &str) -> Option<Value> {
        let date = |d: Option<NaiveDate>| d.map(|d| Value::String(d.to_string()));
        match name {
            fields::INVOICE_NUMBER => Some(Value::String(self.invoice_number.clone()))
                .filter(|_| !self.invoice_number.is_empty()),
            fields::INVOICE_DATE => date(self.invoice_date),
            fields::SERVICE_DATE => date(self.service_date),
            fields::DUE_DATE => date(self.due_date),
            fields::CURRENCY => Some(Value::String(self.currency.clone())),
            fields::TOTAL_AMOUNT => Some(Value::from(self.total_amount.amount)),
            fields::NET_AMOUNT => self.net_amount.as_ref().map(|m| Value::from(m.amount)),
            fields::VAT_AMOUNT => self.vat_amount.as_ref().map(|m| Value::from(m.amount)),
            fields::PO_NUMBER => self.po_number.clone().map(Value::String),
            fields::LINE_ITEMS => serde_json::to_value(&self.line_items).ok(),
            _ => self.additional_fields.get(name).cloned(),
        }
    }

    #[must_use]
    pub fn line_items_total(&self) -> f64 {
        self.line_items.iter().map(|item| item.total_price).sum()
    }

    fn date(field: &str, value: &Value) -> Result<NaiveDate, FieldError> {
        let text = util::value_to_text(value);
        util::parse_date(&text).ok_or_else(|| FieldError::InvalidDate {
            field: field.to_string(),
            value: text,
        })
    }

    fn money(&self, field: &str, value: &Value) -> Result<Money, FieldError> {
        let amount = util::value_as_f64(value).ok_or_else(|| FieldError::InvalidAmount {
            field: field.to_string(),
            value: util::value_to_text(value),
        })?;
        let currency = value
            .get("currency")
            .and_then(Value::as_str)
            .map_or_else(|| self.currency.clone(), str::to_uppercase);
        Ok(Money { amount, currency })
    }
}

/// Output handed to downstream systems. Always fully populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingResult {
    pub normalized_invoice: NormalizedInvoice,
    pub proposed_corrections: Vec<Correction>,
    pub requires_human_review: bool,
    pub reasoning: String,
    pub confidence_score: f64,
    pub memory_updates: Vec<MemoryUpdate>,
    pub audit_trail: Vec<AuditStep>,
    pub decision: Decision,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw() -> RawInvoice {
        RawInvoice {
            id: "inv-1".to_string(),
            vendor_id: "v1".to_string(),
            invoice_number: "R-100".to_string(),
            raw_text: String::new(),
            extracted_fields: vec![ExtractedField::new("Leistungsdatum", json!("15.01.2024"), 0.9)],
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn seed_uses_default_currency() {
        let invoice = NormalizedInvoice::seed(&raw(), "EUR");
        assert_eq!(invoice.invoice_number, "R-100");
        assert_eq!(invoice.total_amount, Money::zero("EUR"));
        assert!(invoice.line_items.is_empty());
    }

    #[test]
    fn set_field_parses_typed_values() {
        let mut invoice = NormalizedInvoice::seed(&raw(), "EUR");
        invoice.set_field("serviceDate", &json!("15.01.2024")).unwrap();
        invoice
            .set_field("totalAmount", &json!({"amount": 119.0, "currency": "usd"}))
            .unwrap();
        invoice.set_field("costCenter", &json!("K-7")).unwrap();

        assert_eq!(invoice.service_date, NaiveDate::from_ymd_opt(2024, 1, 15));
        assert_eq!(invoice.total_amount.currency, "USD");
        assert_eq!(invoice.field_value("costCenter"), Some(json!("K-7")));
        assert_eq!(invoice.field_value("serviceDate"), Some(json!("2024-01-15")));
    }

    #[test]
    fn set_field_rejects_bad_dates() {
        let mut invoice = NormalizedInvoice::seed(&raw(), "EUR");
        let err = invoice.set_field("dueDate", &json!("soon")).unwrap_err();
        assert!(matches!(err, FieldError::InvalidDate { .. }));
        assert!(invoice.due_date.is_none());
    }

    #[test]
    fn line_items_fill_missing_prices() {
        let mut invoice = NormalizedInvoice::seed(&raw(), "EUR");
        invoice
            .set_field(
                "lineItems",
                &json!([
                    {"description": "Widget", "quantity": 2, "unitPrice": 10.0},
                    {"description": "Service", "total": "50,00"},
                    {"description": "no price"}
                ]),
            )
            .unwrap();
        assert_eq!(invoice.line_items.len(), 2);
        assert!((invoice.line_items_total() - 70.0).abs() < 1e-9);
    }

    #[test]
    fn correction_learnability() {
        let ok = Correction::manual("currency", json!(null), json!("EUR"));
        let blank = Correction::manual("currency", json!(null), json!(""));
        let mut negative = ok.clone();
        negative.confidence = -0.5;
        assert!(ok.is_learnable());
        assert!(!blank.is_learnable());
        assert!(!negative.is_learnable());
    }
}
