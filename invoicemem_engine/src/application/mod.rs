//! Application of recalled memories to a single raw invoice.

mod conditions;
mod conflict;
mod transform;
mod validation;

pub use conditions::{ActionError, FieldView};
pub use conflict::{ConflictKind, Contender, ResolvedConflict, STRATEGY_HIGHEST_CONFIDENCE};
pub use transform::TransformError;
pub use validation::ValidationResult;

use invoicemem_core::invoice::fields;
use invoicemem_core::util;
use invoicemem_core::{
    ApplicationConfig, AuditLog, AuditOperation, AuditStep, Correction, LineItem, Memory,
    MemoryKind, MemoryType, Money, NormalizedField, NormalizedInvoice, RawInvoice,
    ResolutionMemory, StepIdGenerator, UuidGenerator, VatBehavior, payload,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use conflict::{CorrectionCandidate, MappingCandidate};

const ACTOR: &str = "memory_application_engine";
const BASELINE_CONFIDENCE: f64 = 0.5;
const FAILED_MEMORY_PENALTY: f64 = 0.1;
const VALIDATION_FAILURE_PENALTY: f64 = 0.05;

/// Canonical names that may be read straight from extracted fields.
const CANONICAL_FIELDS: [&str; 9] = [
    fields::INVOICE_DATE,
    fields::SERVICE_DATE,
    fields::DUE_DATE,
    fields::CURRENCY,
    fields::TOTAL_AMOUNT,
    fields::NET_AMOUNT,
    fields::VAT_AMOUNT,
    fields::LINE_ITEMS,
    fields::PO_NUMBER,
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedMemory {
    pub memory_id: String,
    pub memory_type: MemoryType,
    pub confidence: f64,
    pub fields: Vec<String>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedMemory {
    pub memory_id: String,
    pub memory_type: MemoryType,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationResult {
    pub normalized_invoice: NormalizedInvoice,
    pub proposed_corrections: Vec<Correction>,
    pub normalized_fields: Vec<NormalizedField>,
    pub applied_memories: Vec<AppliedMemory>,
    pub failed_memories: Vec<FailedMemory>,
    pub resolved_conflicts: Vec<ResolvedConflict>,
    pub validation_results: Vec<ValidationResult>,
    pub application_confidence: f64,
    pub audit_steps: Vec<AuditStep>,
}

impl ApplicationResult {
    #[must_use]
    pub fn validation_failures(&self) -> usize {
        self.validation_results.iter().filter(|v| !v.valid).count()
    }

    #[must_use]
    pub fn applied_memory_ids(&self) -> Vec<String> {
        self.applied_memories
            .iter()
            .map(|m| m.memory_id.clone())
            .collect()
    }
}

/// Per-call bookkeeping of what happened to each memory.
#[derive(Default)]
struct Tally {
    applied: Vec<AppliedMemory>,
    applied_index: HashMap<String, usize>,
    failed: Vec<FailedMemory>,
    validation: Vec<ValidationResult>,
}

impl Tally {
    fn apply(&mut self, memory: &Memory, field: Option<&str>, reasoning: &str) {
        let entry = if let Some(&i) = self.applied_index.get(&memory.id) {
            &mut self.applied[i]
        } else {
            self.applied_index
                .insert(memory.id.clone(), self.applied.len());
            self.applied.push(AppliedMemory {
                memory_id: memory.id.clone(),
                memory_type: memory.memory_type(),
                confidence: memory.confidence,
                fields: Vec::new(),
                reasoning: reasoning.to_string(),
            });
            let last = self.applied.len() - 1;
            &mut self.applied[last]
        };
        if let Some(field) = field {
            if !entry.fields.iter().any(|f| f == field) {
                entry.fields.push(field.to_string());
            }
        }
    }

    fn fail(&mut self, memory: &Memory, reason: String) {
        self.failed.push(FailedMemory {
            memory_id: memory.id.clone(),
            memory_type: memory.memory_type(),
            reason,
        });
    }

    fn is_applied(&self, memory_id: &str) -> bool {
        self.applied_index.contains_key(memory_id)
    }
}

/// Applies vendor mappings, correction rules and resolution precedents to
/// one invoice at a time, resolving conflicts by confidence.
///
/// The engine owns an append-only audit log for the current pipeline run;
/// callers clear it between runs.
pub struct MemoryApplicationEngine {
    config: ApplicationConfig,
    audit: AuditLog,
}

impl MemoryApplicationEngine {
    #[must_use]
    pub fn new(config: ApplicationConfig) -> Self {
        Self::with_id_generator(config, Arc::new(UuidGenerator))
    }

    #[must_use]
    pub fn with_id_generator(config: ApplicationConfig, ids: Arc<dyn StepIdGenerator>) -> Self {
        Self {
            config,
            audit: AuditLog::new(ACTOR, ids),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ApplicationConfig {
        &self.config
    }

    #[must_use]
    pub fn audit_steps(&self) -> &[AuditStep] {
        self.audit.steps()
    }

    pub fn clear_audit_steps(&mut self) {
        self.audit.clear();
    }

    pub fn take_audit_steps(&mut self) -> Vec<AuditStep> {
        self.audit.take()
    }

    /// Apply candidate memories to an invoice.
    ///
    /// Candidates below the confidence threshold or archived are skipped; at
    /// most `max_memories` are considered, in the order given.
    #[tracing::instrument(skip(self, invoice, memories), fields(invoice_id = %invoice.id))]
    pub fn apply_memories(&mut self, invoice: &RawInvoice, memories: &[Memory]) -> ApplicationResult {
        let started = Instant::now();
        let first_step = self.audit.steps().len();

        let candidates: Vec<&Memory> = memories
            .iter()
            .filter(|m| !m.archived && m.confidence >= self.config.min_confidence_threshold)
            .take(self.config.max_memories)
            .collect();

        let mut vendors = Vec::new();
        let mut corrections = Vec::new();
        let mut resolutions = Vec::new();
        for memory in &candidates {
            match memory.memory_type() {
                MemoryType::Vendor => vendors.push(*memory),
                MemoryType::Correction => corrections.push(*memory),
                MemoryType::Resolution => resolutions.push(*memory),
            }
        }
        debug!(
            vendors = vendors.len(),
            corrections = corrections.len(),
            resolutions = resolutions.len(),
            "Partitioned candidate memories"
        );

        let mut tally = Tally::default();
        let mut resolved_conflicts = Vec::new();

        let normalized_fields =
            self.apply_field_mappings(invoice, &vendors, &mut tally, &mut resolved_conflicts);

        let mut view = Self::field_view(invoice, &normalized_fields);
        let proposed_corrections = self.generate_corrections(
            invoice,
            &corrections,
            &mut view,
            &mut tally,
            &mut resolved_conflicts,
        );

        Self::apply_resolutions(invoice, &resolutions, &mut tally);

        let normalized_invoice = self.build_invoice(
            invoice,
            &normalized_fields,
            &proposed_corrections,
            &vendors,
            &mut tally,
        );

        for memory in &corrections {
            if let MemoryKind::Correction(correction) = &memory.kind {
                if tally.is_applied(&memory.id) {
                    tally.validation.extend(correction.validation_rules.iter().map(|rule| {
                        validation::check_rule(rule, &normalized_invoice, &memory.id)
                    }));
                }
            }
        }

        let application_confidence = Self::confidence_score(&tally);

        let Tally {
            applied,
            failed,
            validation,
            ..
        } = tally;
        let validation_failures = validation.iter().filter(|v| !v.valid).count();

        self.audit.record(
            AuditOperation::MemoryApplication,
            format!(
                "Applied {} of {} candidate memories to invoice {}",
                applied.len(),
                candidates.len(),
                invoice.id
            ),
            payload! {
                "invoiceId" => invoice.id,
                "vendorId" => invoice.vendor_id,
                "memoryCount" => memories.len(),
                "candidateCount" => candidates.len(),
            },
            payload! {
                "appliedMemories" => applied.len(),
                "failedMemories" => failed.len(),
                "resolvedConflicts" => resolved_conflicts.len(),
                "proposedCorrections" => proposed_corrections.len(),
                "validationFailures" => validation_failures,
                "applicationConfidence" => application_confidence,
            },
            started.elapsed(),
        );
        info!(
            invoice_id = %invoice.id,
            applied = applied.len(),
            failed = failed.len(),
            conflicts = resolved_conflicts.len(),
            confidence = application_confidence,
            "Memory application complete"
        );

        ApplicationResult {
            normalized_invoice,
            proposed_corrections,
            normalized_fields,
            applied_memories: applied,
            failed_memories: failed,
            resolved_conflicts,
            validation_results: validation,
            application_confidence,
            audit_steps: self.audit.steps()[first_step..].to_vec(),
        }
    }

    fn apply_field_mappings(
        &mut self,
        invoice: &RawInvoice,
        vendors: &[&Memory],
        tally: &mut Tally,
        resolved_conflicts: &mut Vec<ResolvedConflict>,
    ) -> Vec<NormalizedField> {
        let mut produced: Vec<NormalizedField> = Vec::new();
        let mut errors: HashMap<String, Vec<String>> = HashMap::new();
        let mut winners: Vec<&Memory> = Vec::new();

        for group in conflict::group_mappings(vendors) {
            let Some(&MappingCandidate { memory, mapping, .. }) = group.winner() else {
                continue;
            };
            if group.is_conflict() {
                let ranked: Vec<&Memory> = group.members.iter().map(|c| c.memory).collect();
                self.record_conflict(invoice, ConflictKind::FieldMapping, &group.key, &ranked, resolved_conflicts);
            }
            if !winners.iter().any(|w| w.id == memory.id) {
                winners.push(memory);
            }

            let step_started = Instant::now();
            let source = invoice
                .field(&mapping.source_field)
                .cloned()
                .or_else(|| transform::scan_raw_text(&invoice.raw_text, &mapping.source_field));
            let Some(source_value) = source else {
                debug!(source = %mapping.source_field, "Source field absent, mapping skipped");
                continue;
            };

            let rule = mapping.transformation_rule.clone().unwrap_or_default();
            match transform::apply(&rule, &source_value, &self.config.default_currency) {
                Ok(value) if !util::is_blank(&value) => {
                    tally.validation.push(ValidationResult::passed(&mapping.target_field, &memory.id));
                    tally.apply(memory, Some(mapping.target_field.as_str()), "vendor field mapping");
                    self.audit.record(
                        AuditOperation::FieldNormalization,
                        format!("Mapped '{}' to '{}'", mapping.source_field, mapping.target_field),
                        payload! {
                            "invoiceId" => invoice.id,
                            "memoryId" => memory.id,
                            "sourceField" => mapping.source_field,
                            "sourceValue" => source_value,
                        },
                        payload! {
                            "targetField" => mapping.target_field,
                            "value" => value,
                            "confidence" => memory.confidence,
                        },
                        step_started.elapsed(),
                    );
                    produced.push(NormalizedField {
                        original_field: mapping.source_field.clone(),
                        normalized_field: mapping.target_field.clone(),
                        original_value: source_value,
                        normalized_value: value,
                        memory_id: memory.id.clone(),
                        confidence: memory.confidence,
                    });
                }
                Ok(_) => {
                    let message = format!("transformation of '{}' produced no value", mapping.source_field);
                    tally.validation.push(ValidationResult::failed(&mapping.target_field, Some(memory.id.as_str()), message.clone()));
                    errors.entry(memory.id.clone()).or_default().push(message);
                }
                Err(e) => {
                    warn!(memory_id = %memory.id, error = %e, "Transformation failed");
                    tally.validation.push(ValidationResult::failed(&mapping.target_field, Some(memory.id.as_str()), e.to_string()));
                    errors.entry(memory.id.clone()).or_default().push(e.to_string());
                }
            }
        }

        for memory in winners {
            if !tally.is_applied(&memory.id) {
                if let Some(reasons) = errors.remove(&memory.id) {
                    tally.fail(memory, reasons.join("; "));
                }
            }
        }

        Self::dedupe_targets(produced)
    }

    /// Distinct sources may map onto the same target; the most confident
    /// value stays, earlier entries win ties.
    fn dedupe_targets(produced: Vec<NormalizedField>) -> Vec<NormalizedField> {
        let mut kept: Vec<NormalizedField> = Vec::with_capacity(produced.len());
        let mut by_target: HashMap<String, usize> = HashMap::new();
        for field in produced {
            match by_target.get(&field.normalized_field) {
                Some(&i) if field.confidence > kept[i].confidence => kept[i] = field,
                Some(_) => {}
                None => {
                    by_target.insert(field.normalized_field.clone(), kept.len());
                    kept.push(field);
                }
            }
        }
        kept
    }

    /// Values visible to trigger conditions: extracted fields, identifiers
    /// and mapped targets. Defaults are not included, so "missing" stays
    /// observable.
    fn field_view(invoice: &RawInvoice, normalized: &[NormalizedField]) -> FieldView {
        let mut view = FieldView::new();
        view.insert("vendorId".to_string(), Value::String(invoice.vendor_id.clone()));
        if !invoice.invoice_number.is_empty() {
            view.insert(
                fields::INVOICE_NUMBER.to_string(),
                Value::String(invoice.invoice_number.clone()),
            );
        }
        for field in &invoice.extracted_fields {
            view.insert(field.name.clone(), field.value.clone());
        }
        for field in normalized {
            view.insert(field.normalized_field.clone(), field.normalized_value.clone());
        }
        view
    }

    fn generate_corrections(
        &mut self,
        invoice: &RawInvoice,
        corrections: &[&Memory],
        view: &mut FieldView,
        tally: &mut Tally,
        resolved_conflicts: &mut Vec<ResolvedConflict>,
    ) -> Vec<Correction> {
        let mut proposed = Vec::new();

        for group in conflict::group_corrections(corrections) {
            if group.is_conflict() {
                let ranked: Vec<&Memory> = group.members.iter().map(|c| c.memory).collect();
                self.record_conflict(invoice, ConflictKind::Correction, &group.key, &ranked, resolved_conflicts);
            }

            for &CorrectionCandidate { memory, correction } in &group.members {
                if !conditions::all_match(&correction.trigger_conditions, view) {
                    debug!(memory_id = %memory.id, field = %group.key, "Trigger conditions not met");
                    continue;
                }

                let step_started = Instant::now();
                let action = &correction.correction_action;
                let current = view.get(&action.target_field).cloned();
                match conditions::apply_action(action, current.as_ref()) {
                    Ok(value) if !util::is_blank(&value) && memory.confidence > 0.0 => {
                        tally.validation.push(ValidationResult::passed(&action.target_field, &memory.id));
                        tally.apply(memory, Some(action.target_field.as_str()), "correction rule");
                        self.audit.record(
                            AuditOperation::MemoryApplication,
                            format!("Selected correction for '{}'", action.target_field),
                            payload! {
                                "invoiceId" => invoice.id,
                                "memoryId" => memory.id,
                                "field" => action.target_field,
                                "originalValue" => current,
                                "candidates" => group.members.len(),
                            },
                            payload! {
                                "correctedValue" => value,
                                "confidence" => memory.confidence,
                            },
                            step_started.elapsed(),
                        );
                        view.insert(action.target_field.clone(), value.clone());
                        proposed.push(Correction {
                            field: action.target_field.clone(),
                            original_value: current.unwrap_or(Value::Null),
                            corrected_value: value,
                            reason: format!(
                                "{:?} correction learned from memory {}",
                                correction.correction_type, memory.id
                            ),
                            confidence: memory.confidence,
                            memory_id: Some(memory.id.clone()),
                            vendor_id: Some(invoice.vendor_id.clone()),
                        });
                        break;
                    }
                    Ok(_) => {
                        tally.validation.push(ValidationResult::failed(
                            &action.target_field,
                            Some(memory.id.as_str()),
                            "correction produced no value",
                        ));
                    }
                    Err(e) => {
                        warn!(memory_id = %memory.id, error = %e, "Correction action failed, trying next memory");
                        tally.fail(memory, e.to_string());
                    }
                }
            }
        }

        proposed
    }

    fn apply_resolutions(invoice: &RawInvoice, resolutions: &[&Memory], tally: &mut Tally) {
        for memory in resolutions {
            let MemoryKind::Resolution(resolution) = &memory.kind else {
                continue;
            };
            let vendor_matches = memory
                .vendor_id()
                .is_none_or(|vendor| vendor == invoice.vendor_id);
            if vendor_matches && Self::context_matches(invoice, resolution) {
                let reasoning = format!(
                    "precedent for '{}' resolved as {:?}",
                    resolution.discrepancy_type, resolution.resolution_outcome
                );
                tally.apply(memory, None, &reasoning);
            }
        }
    }

    fn context_matches(invoice: &RawInvoice, resolution: &ResolutionMemory) -> bool {
        let text = invoice.raw_text.to_lowercase();
        resolution.context_factors.iter().all(|factor| {
            let factor = factor.to_lowercase();
            invoice
                .extracted_fields
                .iter()
                .any(|f| f.name.to_lowercase() == factor)
                || text.contains(&factor)
        })
    }

    fn build_invoice(
        &self,
        invoice: &RawInvoice,
        normalized_fields: &[NormalizedField],
        corrections: &[Correction],
        vendors: &[&Memory],
        tally: &mut Tally,
    ) -> NormalizedInvoice {
        let mut built = NormalizedInvoice::seed(invoice, &self.config.default_currency);

        for name in CANONICAL_FIELDS {
            if let Some(value) = invoice.field(name) {
                if let Err(e) = built.set_field(name, value) {
                    tally.validation.push(ValidationResult::failed(name, None, e.to_string()));
                }
            }
        }
        for field in normalized_fields {
            if let Err(e) = built.set_field(&field.normalized_field, &field.normalized_value) {
                tally.validation.push(ValidationResult::failed(
                    &field.normalized_field,
                    Some(field.memory_id.as_str()),
                    e.to_string(),
                ));
            }
        }
        for correction in corrections {
            if let Err(e) = built.set_field(&correction.field, &correction.corrected_value) {
                tally.validation.push(ValidationResult::failed(
                    &correction.field,
                    correction.memory_id.as_deref(),
                    e.to_string(),
                ));
            }
        }
        built.normalized_fields = normalized_fields.to_vec();

        if built.vat_amount.is_none() {
            let vat = vendors
                .iter()
                .filter(|m| tally.is_applied(&m.id))
                .find_map(|m| match &m.kind {
                    MemoryKind::Vendor(vendor) => derive_vat(&vendor.vat_behavior, built.total_amount.amount),
                    MemoryKind::Correction(_) | MemoryKind::Resolution(_) => None,
                });
            if let Some(amount) = vat {
                built.vat_amount = Some(Money {
                    amount,
                    currency: built.currency.clone(),
                });
            }
        }

        if built.total_amount.is_zero() && !built.line_items.is_empty() {
            built.total_amount.amount = built.line_items_total();
        }
        if built.line_items.is_empty() {
            built.line_items.push(LineItem {
                description: format!("Invoice {}", built.invoice_number),
                quantity: 1.0,
                unit_price: built.total_amount.amount,
                total_price: built.total_amount.amount,
                vat_rate: None,
            });
        }

        built
    }

    fn record_conflict(
        &mut self,
        invoice: &RawInvoice,
        kind: ConflictKind,
        key: &str,
        ranked: &[&Memory],
        resolved_conflicts: &mut Vec<ResolvedConflict>,
    ) {
        let Some(resolved) = conflict::resolve(kind, key, ranked) else {
            return;
        };
        self.audit.record(
            AuditOperation::ConfidenceCalculation,
            format!("Resolved {kind:?} conflict on '{key}'"),
            payload! {
                "invoiceId" => invoice.id,
                "key" => key,
                "contenders" => resolved.contenders,
            },
            payload! {
                "winnerId" => resolved.winner_id,
                "strategy" => resolved.strategy,
                "reasoning" => resolved.reasoning,
            },
            Duration::ZERO,
        );
        resolved_conflicts.push(resolved);
    }

    #[allow(clippy::cast_precision_loss)]
    fn confidence_score(tally: &Tally) -> f64 {
        if tally.applied.is_empty() {
            return BASELINE_CONFIDENCE;
        }
        let mean = tally.applied.iter().map(|a| a.confidence).sum::<f64>() / tally.applied.len() as f64;
        let validation_failures = tally.validation.iter().filter(|v| !v.valid).count();
        let penalty = VALIDATION_FAILURE_PENALTY.mul_add(
            validation_failures as f64,
            FAILED_MEMORY_PENALTY * tally.failed.len() as f64,
        );
        (mean - penalty).clamp(0.1, 1.0)
    }
}

/// VAT contained in a gross total, for vendors whose prices include VAT.
/// Rates above 1 are read as percentages.
fn derive_vat(behavior: &VatBehavior, total: f64) -> Option<f64> {
    if !behavior.vat_included_in_prices || behavior.default_vat_rate <= 0.0 || total <= 0.0 {
        return None;
    }
    let rate = if behavior.default_vat_rate > 1.0 {
        behavior.default_vat_rate / 100.0
    } else {
        behavior.default_vat_rate
    };
    let vat = total - total / (1.0 + rate);
    Some((vat * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vat_is_derived_from_gross_total() {
        let behavior = VatBehavior {
            vat_included_in_prices: true,
            default_vat_rate: 19.0,
            vat_inclusion_indicators: Vec::new(),
        };
        assert_eq!(derive_vat(&behavior, 119.0), Some(19.0));
        assert_eq!(derive_vat(&VatBehavior::default(), 119.0), None);
    }
}
