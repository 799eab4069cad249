//! Grouping of competing memories and highest-confidence conflict resolution.
//!
//! Members of a group are ranked by memory confidence (descending). Exact
//! ties fall back to the mapping's own confidence (vendor mappings only) and
//! finally to the memory id in ascending lexical order, so the ranking is
//! identical on every run regardless of recall order.

use invoicemem_core::{CorrectionMemory, FieldMapping, Memory, MemoryKind, VendorMemory};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

pub const STRATEGY_HIGHEST_CONFIDENCE: &str = "highest_confidence";

#[derive(Debug, Clone, Copy)]
pub struct MappingCandidate<'a> {
    pub memory: &'a Memory,
    pub vendor: &'a VendorMemory,
    pub mapping: &'a FieldMapping,
}

#[derive(Debug, Clone, Copy)]
pub struct CorrectionCandidate<'a> {
    pub memory: &'a Memory,
    pub correction: &'a CorrectionMemory,
}

/// Members competing for the same normalization target, best first.
#[derive(Debug, Clone)]
pub struct ConflictGroup<T> {
    pub key: String,
    pub members: Vec<T>,
}

impl<T> ConflictGroup<T> {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.members.len() > 1
    }

    #[must_use]
    pub fn winner(&self) -> Option<&T> {
        self.members.first()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    FieldMapping,
    Correction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contender {
    pub memory_id: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedConflict {
    pub kind: ConflictKind,
    pub key: String,
    pub contenders: Vec<Contender>,
    pub winner_id: String,
    pub strategy: String,
    pub reasoning: String,
}

/// Group vendor mappings by `(source_field, target_field)`, keeping the
/// first-seen order of groups.
#[must_use]
pub fn group_mappings<'a>(memories: &[&'a Memory]) -> Vec<ConflictGroup<MappingCandidate<'a>>> {
    let candidates = memories.iter().copied().flat_map(|memory| match &memory.kind {
        MemoryKind::Vendor(vendor) => vendor
            .field_mappings
            .iter()
            .map(|mapping| MappingCandidate {
                memory,
                vendor,
                mapping,
            })
            .collect::<Vec<_>>(),
        MemoryKind::Correction(_) | MemoryKind::Resolution(_) => Vec::new(),
    });

    let mut groups = group_by(candidates, |c| {
        format!("{}->{}", c.mapping.source_field, c.mapping.target_field)
    });
    for group in &mut groups {
        group.members.sort_by(|a, b| {
            rank(a.memory, b.memory)
                .then_with(|| b.mapping.confidence.total_cmp(&a.mapping.confidence))
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
    }
    groups
}

/// Group correction memories by target field. The ranked members form the
/// fallback chain tried in order.
#[must_use]
pub fn group_corrections<'a>(
    memories: &[&'a Memory],
) -> Vec<ConflictGroup<CorrectionCandidate<'a>>> {
    let candidates = memories.iter().copied().filter_map(|memory| match &memory.kind {
        MemoryKind::Correction(correction) => Some(CorrectionCandidate { memory, correction }),
        MemoryKind::Vendor(_) | MemoryKind::Resolution(_) => None,
    });

    let mut groups = group_by(candidates, |c| c.correction.correction_action.target_field.clone());
    for group in &mut groups {
        group
            .members
            .sort_by(|a, b| rank(a.memory, b.memory).then_with(|| a.memory.id.cmp(&b.memory.id)));
    }
    groups
}

fn rank(a: &Memory, b: &Memory) -> Ordering {
    b.confidence.total_cmp(&a.confidence)
}

fn group_by<T, I, F>(items: I, key: F) -> Vec<ConflictGroup<T>>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> String,
{
    let mut groups: Vec<ConflictGroup<T>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for item in items {
        let k = key(&item);
        if let Some(&i) = index.get(&k) {
            groups[i].members.push(item);
        } else {
            index.insert(k.clone(), groups.len());
            groups.push(ConflictGroup {
                key: k,
                members: vec![item],
            });
        }
    }
    groups
}

/// Describe how a multi-member group was settled.
#[must_use]
pub fn resolve(kind: ConflictKind, key: &str, ranked: &[&Memory]) -> Option<ResolvedConflict> {
    let winner = ranked.first()?;
    if ranked.len() < 2 {
        return None;
    }
    let runner_up = ranked[1];
    let tie = (winner.confidence - runner_up.confidence).abs() < f64::EPSILON;
    let reasoning = if tie {
        format!(
            "{} memories competed for '{key}'; confidence tied at {:.3}, memory {} selected by stable tie-break",
            ranked.len(),
            winner.confidence,
            winner.id
        )
    } else {
        format!(
            "{} memories competed for '{key}'; memory {} selected with highest confidence {:.3} (next best {:.3})",
            ranked.len(),
            winner.id,
            winner.confidence,
            runner_up.confidence
        )
    };

    Some(ResolvedConflict {
        kind,
        key: key.to_string(),
        contenders: ranked
            .iter()
            .map(|m| Contender {
                memory_id: m.id.clone(),
                confidence: m.confidence,
            })
            .collect(),
        winner_id: winner.id.clone(),
        strategy: STRATEGY_HIGHEST_CONFIDENCE.to_string(),
        reasoning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use invoicemem_core::{ActionType, Condition, ConditionOperator, CorrectionAction, CorrectionType};
    use serde_json::json;

    fn vendor_memory(id: &str, confidence: f64) -> Memory {
        Memory::vendor(
            VendorMemory {
                vendor_id: "v1".to_string(),
                field_mappings: vec![FieldMapping::new("Leistungsdatum", "serviceDate", 0.8)],
                ..VendorMemory::default()
            },
            confidence,
        )
        .with_id(id)
    }

    fn correction_memory(id: &str, confidence: f64) -> Memory {
        Memory::correction(
            CorrectionMemory {
                correction_type: CorrectionType::CurrencyFix,
                trigger_conditions: vec![Condition::new("currency", ConditionOperator::NotExists, None)],
                correction_action: CorrectionAction {
                    action_type: ActionType::Set,
                    target_field: "currency".to_string(),
                    new_value: json!("EUR"),
                    search: None,
                },
                validation_rules: Vec::new(),
            },
            confidence,
        )
        .with_id(id)
    }

    #[test]
    fn highest_confidence_wins() {
        let low = vendor_memory("a", 0.6);
        let high = vendor_memory("b", 0.9);
        let groups = group_mappings(&[&low, &high]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "Leistungsdatum->serviceDate");
        assert_eq!(groups[0].winner().map(|c| c.memory.id.as_str()), Some("b"));
    }

    #[test]
    fn ties_break_on_memory_id_regardless_of_order() {
        let first = correction_memory("m-2", 0.7);
        let second = correction_memory("m-1", 0.7);
        let forward = group_corrections(&[&first, &second]);
        let backward = group_corrections(&[&second, &first]);
        assert_eq!(forward[0].winner().map(|c| c.memory.id.as_str()), Some("m-1"));
        assert_eq!(backward[0].winner().map(|c| c.memory.id.as_str()), Some("m-1"));
    }

    #[test]
    fn resolution_mentions_confidence() {
        let low = correction_memory("a", 0.4);
        let high = correction_memory("b", 0.8);
        let resolved = resolve(ConflictKind::Correction, "currency", &[&high, &low]).unwrap();
        assert_eq!(resolved.winner_id, "b");
        assert_eq!(resolved.strategy, STRATEGY_HIGHEST_CONFIDENCE);
        assert_eq!(resolved.contenders.len(), 2);
        assert!(resolved.reasoning.contains("confidence"));

        let tie = resolve(ConflictKind::Correction, "currency", &[&high, &high]).unwrap();
        assert!(tie.reasoning.contains("confidence"));
        assert!(resolve(ConflictKind::Correction, "currency", &[&high]).is_none());
    }
}
