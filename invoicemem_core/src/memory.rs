//! Learned memories and their variant payloads.
//!
//! A [`Memory`] carries the statistics shared by every variant (confidence,
//! usage, success rate, context) and a [`MemoryKind`] payload holding the
//! variant-specific data. Dispatch over variants is a `match` on the kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Vendor,
    Correction,
    Resolution,
}

impl MemoryType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vendor => "vendor",
            Self::Correction => "correction",
            Self::Resolution => "resolution",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vendor" => Ok(Self::Vendor),
            "correction" => Ok(Self::Correction),
            "resolution" => Ok(Self::Resolution),
            _ => Err(crate::Error::InvalidMemory(format!("unknown memory type: {s}"))),
        }
    }
}

/// Recognition pattern attached to a memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MemoryPattern {
    pub pattern_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub threshold: f64,
}

impl MemoryPattern {
    /// Signature stored by the learning engine, if any.
    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        self.data.get("signature").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MemoryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    /// Free-form characteristics of the invoices this memory was learned from
    /// (language, document format, typical currency).
    #[serde(default)]
    pub invoice_characteristics: serde_json::Map<String, Value>,
    /// Invoice ids this memory was learned from or last applied to, newest last.
    #[serde(default)]
    pub history: Vec<String>,
}

impl MemoryContext {
    const MAX_HISTORY: usize = 20;

    #[must_use]
    pub fn for_vendor(vendor_id: impl Into<String>) -> Self {
        Self {
            vendor_id: Some(vendor_id.into()),
            ..Self::default()
        }
    }

    /// Record an invoice id, keeping only the most recent entries.
    pub fn push_history(&mut self, invoice_id: &str) {
        if self.history.last().is_some_and(|last| last == invoice_id) {
            return;
        }
        self.history.push(invoice_id.to_string());
        if self.history.len() > Self::MAX_HISTORY {
            let excess = self.history.len() - Self::MAX_HISTORY;
            self.history.drain(..excess);
        }
    }
}

/// How a mapped source value is turned into the target value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformationRule {
    #[default]
    Direct,
    /// Tries `DD.MM.YYYY`, `YYYY-MM-DD` and `MM/DD/YYYY` in that order.
    DateParse,
    /// Splits an amount from a three-letter ISO currency code.
    CurrencyExtraction,
    TextNormalization {
        #[serde(default)]
        trim: bool,
        #[serde(default)]
        lowercase: bool,
        #[serde(default)]
        uppercase: bool,
        #[serde(default)]
        collapse_whitespace: bool,
    },
    /// Extracts the named capture group `group` of `pattern`.
    RegexExtraction { pattern: String, group: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingExample {
    pub source_value: String,
    pub target_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation_rule: Option<TransformationRule>,
    pub confidence: f64,
    #[serde(default)]
    pub examples: Vec<MappingExample>,
}

impl FieldMapping {
    #[must_use]
    pub fn new(source_field: &str, target_field: &str, confidence: f64) -> Self {
        Self {
            source_field: source_field.to_string(),
            target_field: target_field.to_string(),
            transformation_rule: None,
            confidence,
            examples: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: TransformationRule) -> Self {
        self.transformation_rule = Some(rule);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VatBehavior {
    #[serde(default)]
    pub vat_included_in_prices: bool,
    #[serde(default)]
    pub default_vat_rate: f64,
    #[serde(default)]
    pub vat_inclusion_indicators: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VendorMemory {
    pub vendor_id: String,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub vat_behavior: VatBehavior,
    #[serde(default)]
    pub currency_patterns: Vec<String>,
    #[serde(default)]
    pub date_formats: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionType {
    QuantityMismatch,
    PriceCorrection,
    VatRecalculation,
    CurrencyFix,
    DateCorrection,
    FieldMapping,
    #[default]
    Other,
}

impl CorrectionType {
    /// Best-effort classification of a corrected field name.
    #[must_use]
    pub fn infer(field: &str) -> Self {
        let field = field.to_lowercase();
        if field.contains("currency") {
            Self::CurrencyFix
        } else if field.contains("date") {
            Self::DateCorrection
        } else if field.contains("vat") || field.contains("tax") {
            Self::VatRecalculation
        } else if field.contains("quantity") || field.contains("qty") {
            Self::QuantityMismatch
        } else if field.contains("price") || field.contains("amount") || field.contains("total") {
            Self::PriceCorrection
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    Matches,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Condition {
    #[must_use]
    pub fn new(field: &str, operator: ConditionOperator, value: Option<Value>) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Set,
    Multiply,
    Add,
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectionAction {
    pub action_type: ActionType,
    pub target_field: String,
    pub new_value: Value,
    /// Literal text replaced by `new_value` for [`ActionType::Replace`].
    /// When absent the whole value is replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    Required { field: String },
    Range { field: String, min: f64, max: f64 },
    Pattern { field: String, pattern: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectionMemory {
    pub correction_type: CorrectionType,
    #[serde(default)]
    pub trigger_conditions: Vec<Condition>,
    pub correction_action: CorrectionAction,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Approved,
    Rejected,
    Corrected,
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolutionMemory {
    pub discrepancy_type: String,
    pub resolution_outcome: ResolutionOutcome,
    pub human_decision: String,
    #[serde(default)]
    pub context_factors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryKind {
    Vendor(VendorMemory),
    Correction(CorrectionMemory),
    Resolution(ResolutionMemory),
}

/// A persisted, confidence-scored learned pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    pub id: String,
    pub pattern: MemoryPattern,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub usage_count: u64,
    pub success_rate: f64,
    #[serde(default)]
    pub context: MemoryContext,
    #[serde(default)]
    pub archived: bool,
    /// Optimistic-concurrency version, bumped by the store on every update.
    #[serde(default)]
    pub version: u64,
    /// Confidence as of `last_used`. Set while idle decay is in effect so
    /// repeated maintenance always decays from the same starting point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay_base: Option<f64>,
    pub kind: MemoryKind,
}

impl Memory {
    /// Create a memory with fresh statistics. Confidence is clamped to [0, 1].
    #[must_use]
    pub fn new(kind: MemoryKind, pattern: MemoryPattern, confidence: f64) -> Self {
        let now = Utc::now();
        let context = match &kind {
            MemoryKind::Vendor(vendor) => MemoryContext::for_vendor(vendor.vendor_id.clone()),
            MemoryKind::Correction(_) | MemoryKind::Resolution(_) => MemoryContext::default(),
        };
        Self {
            id: Uuid::now_v7().to_string(),
            pattern,
            confidence: clamp_unit(confidence),
            created_at: now,
            last_used: now,
            usage_count: 0,
            success_rate: 0.0,
            context,
            archived: false,
            version: 0,
            decay_base: None,
            kind,
        }
    }

    #[must_use]
    pub fn vendor(vendor: VendorMemory, confidence: f64) -> Self {
        let pattern = MemoryPattern {
            pattern_type: "vendor_mapping".to_string(),
            data: serde_json::json!({ "vendor_id": vendor.vendor_id }),
            threshold: 0.0,
        };
        Self::new(MemoryKind::Vendor(vendor), pattern, confidence)
    }

    #[must_use]
    pub fn correction(correction: CorrectionMemory, confidence: f64) -> Self {
        let pattern = MemoryPattern {
            pattern_type: "correction_rule".to_string(),
            data: serde_json::json!({ "target_field": correction.correction_action.target_field }),
            threshold: 0.0,
        };
        Self::new(MemoryKind::Correction(correction), pattern, confidence)
    }

    #[must_use]
    pub fn resolution(resolution: ResolutionMemory, confidence: f64) -> Self {
        let pattern = MemoryPattern {
            pattern_type: "resolution_precedent".to_string(),
            data: serde_json::json!({ "discrepancy_type": resolution.discrepancy_type }),
            threshold: 0.0,
        };
        Self::new(MemoryKind::Resolution(resolution), pattern, confidence)
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: MemoryContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub const fn memory_type(&self) -> MemoryType {
        match self.kind {
            MemoryKind::Vendor(_) => MemoryType::Vendor,
            MemoryKind::Correction(_) => MemoryType::Correction,
            MemoryKind::Resolution(_) => MemoryType::Resolution,
        }
    }

    /// Vendor this memory is scoped to; `None` means it applies to every vendor.
    #[must_use]
    pub fn vendor_id(&self) -> Option<&str> {
        match &self.kind {
            MemoryKind::Vendor(vendor) => Some(vendor.vendor_id.as_str()),
            MemoryKind::Correction(_) | MemoryKind::Resolution(_) => {
                self.context.vendor_id.as_deref()
            }
        }
    }

    /// Whether every statistic is inside [0, 1].
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let unit = |v: f64| (0.0..=1.0).contains(&v);
        unit(self.confidence)
            && unit(self.success_rate)
            && self.decay_base.is_none_or(|base| unit(base) && base >= self.confidence)
    }
}

/// Clamp to [0, 1], mapping NaN to 0.
#[must_use]
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
