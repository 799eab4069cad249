use invoicemem_core::util;
use invoicemem_core::{Correction, CorrectionType, LearningConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// A correction that recurred often enough to become a memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub signature: String,
    pub field: String,
    /// First corrected value seen for the group.
    pub value: Value,
    pub occurrences: usize,
    pub confidence: f64,
    pub vendor_specific: bool,
    pub vendor_id: Option<String>,
    pub correction_type: CorrectionType,
}

impl Pattern {
    /// Pattern payload stored on a synthesized memory.
    #[must_use]
    pub fn to_data(&self) -> Value {
        json!({
            "signature": self.signature,
            "field": self.field,
            "value": self.value,
            "occurrences": self.occurrences,
            "confidence": self.confidence,
            "vendor_specific": self.vendor_specific,
            "vendor_id": self.vendor_id,
            "correction_type": self.correction_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    field: String,
    value: String,
    vendor: Option<String>,
}

/// Group learnable corrections by `(field, normalized value, vendor)` and
/// keep the groups reaching `min_occurrences`.
///
/// With `vendor_id` set, corrections scoped to a different vendor are
/// ignored and unscoped ones are attributed to `vendor_id`. Output order is
/// the key order, so identical input always yields identical output.
#[must_use]
pub fn recognize(
    corrections: &[Correction],
    vendor_id: Option<&str>,
    config: &LearningConfig,
) -> Vec<Pattern> {
    let mut groups: BTreeMap<GroupKey, (Value, usize)> = BTreeMap::new();

    for correction in corrections.iter().filter(|c| c.is_learnable()) {
        let vendor = match (correction.vendor_id.as_deref(), vendor_id) {
            (Some(own), Some(wanted)) if own != wanted => continue,
            (Some(own), _) => Some(own.to_string()),
            (None, wanted) => wanted.map(str::to_string),
        };
        let key = GroupKey {
            field: correction.field.trim().to_string(),
            value: util::normalize_value_key(&correction.corrected_value),
            vendor,
        };
        groups
            .entry(key)
            .or_insert_with(|| (correction.corrected_value.clone(), 0))
            .1 += 1;
    }

    let min = config.min_occurrences.max(1);
    groups
        .into_iter()
        .filter(|(_, (_, n))| *n >= min)
        .map(|(key, (value, occurrences))| Pattern {
            signature: util::pattern_signature(&key.field, &key.value, key.vendor.as_deref()),
            correction_type: CorrectionType::infer(&key.field),
            confidence: pattern_confidence(occurrences, config),
            vendor_specific: key.vendor.is_some(),
            field: key.field,
            value,
            occurrences,
            vendor_id: key.vendor,
        })
        .collect()
}

/// Rises linearly with occurrences beyond the minimum, capped.
#[allow(clippy::cast_precision_loss)]
fn pattern_confidence(occurrences: usize, config: &LearningConfig) -> f64 {
    let extra = occurrences.saturating_sub(config.min_occurrences) as f64;
    config
        .pattern_confidence_step
        .mul_add(extra, config.pattern_base_confidence)
        .min(config.pattern_confidence_cap)
        .clamp(0.0, 1.0)
}
