//! Learning from processing outcomes.
//!
//! Human corrections accumulate in a per-engine history. Once the same
//! `(field, value[, vendor])` correction has been seen `min_occurrences`
//! times it becomes a [`Pattern`], which either reinforces the existing
//! memory carrying the same signature or yields a new correction memory.
//! The strategy only decides when new memories reach the store.

mod patterns;

pub use patterns::Pattern;

use chrono::{DateTime, Utc};
use invoicemem_core::util;
use invoicemem_core::{
    ActionType, AuditLog, AuditOperation, AuditStep, Condition, ConditionOperator, Correction,
    CorrectionAction, CorrectionMemory, LearningConfig, LearningResult, LearningStrategy,
    LearningType, Memory, MemoryContext, MemoryPattern, MemoryKind, MemoryStore, MemoryUpdate,
    PipelineConfig, ProcessingOutcome, ResolutionFeedback, ResolutionMemory, StepIdGenerator,
    UpdateType, UuidGenerator, payload,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bounded::bounded;
use crate::confidence::ConfidenceManager;

const ACTOR: &str = "memory_learning_engine";
const MAX_CORRECTION_HISTORY: usize = 1_000;
const PATTERN_TYPE: &str = "learned_correction";

/// Everything one learning call did.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LearningReport {
    pub corrections_processed: usize,
    pub patterns: Vec<Pattern>,
    pub results: Vec<LearningResult>,
    pub memory_updates: Vec<MemoryUpdate>,
    /// Synthesized memories still waiting for their commit.
    pub pending: usize,
}

impl LearningReport {
    fn merge(&mut self, results: Vec<LearningResult>, updates: Vec<MemoryUpdate>) {
        self.results.extend(results);
        self.memory_updates.extend(updates);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceReport {
    pub examined: usize,
    pub decayed: usize,
    pub archived: usize,
    pub memory_updates: Vec<MemoryUpdate>,
    pub errors: Vec<String>,
}

pub struct MemoryLearningEngine {
    config: LearningConfig,
    confidence: ConfidenceManager,
    store: Arc<dyn MemoryStore>,
    store_timeout: Duration,
    history: Vec<Correction>,
    pending: Vec<Memory>,
    outcomes_since_commit: usize,
    audit: AuditLog,
}

impl MemoryLearningEngine {
    #[must_use]
    pub fn new(
        config: LearningConfig,
        confidence: ConfidenceManager,
        store: Arc<dyn MemoryStore>,
    ) -> Self {
        Self::with_id_generator(config, confidence, store, Arc::new(UuidGenerator))
    }

    #[must_use]
    pub fn with_id_generator(
        config: LearningConfig,
        confidence: ConfidenceManager,
        store: Arc<dyn MemoryStore>,
        ids: Arc<dyn StepIdGenerator>,
    ) -> Self {
        Self {
            config,
            confidence,
            store,
            store_timeout: Duration::from_millis(PipelineConfig::default().stage_timeout_ms),
            history: Vec::new(),
            pending: Vec::new(),
            outcomes_since_commit: 0,
            audit: AuditLog::new(ACTOR, ids),
        }
    }

    /// Upper bound for each store call made while learning.
    #[must_use]
    pub const fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    #[must_use]
    pub fn pending_memories(&self) -> &[Memory] {
        &self.pending
    }

    #[must_use]
    pub fn correction_history(&self) -> &[Correction] {
        &self.history
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

    #[must_use]
    pub fn recognize_patterns(&self, corrections: &[Correction], vendor_id: Option<&str>) -> Vec<Pattern> {
        patterns::recognize(corrections, vendor_id, &self.config)
    }

    /// One correction memory per pattern, seeded with the pattern's
    /// confidence. The trigger fires whenever the field is missing or holds
    /// a different value.
    #[must_use]
    pub fn create_memories_from_patterns(&self, patterns: &[Pattern], context: &MemoryContext) -> Vec<Memory> {
        patterns
            .iter()
            .map(|pattern| {
                let correction = CorrectionMemory {
                    correction_type: pattern.correction_type,
                    trigger_conditions: vec![Condition::new(
                        &pattern.field,
                        ConditionOperator::NotEquals,
                        Some(pattern.value.clone()),
                    )],
                    correction_action: CorrectionAction {
                        action_type: ActionType::Set,
                        target_field: pattern.field.clone(),
                        new_value: pattern.value.clone(),
                        search: None,
                    },
                    validation_rules: Vec::new(),
                };
                let mut context = context.clone();
                if pattern.vendor_specific {
                    context.vendor_id.clone_from(&pattern.vendor_id);
                }
                let mut memory = Memory::new(
                    MemoryKind::Correction(correction),
                    MemoryPattern {
                        pattern_type: PATTERN_TYPE.to_string(),
                        data: pattern.to_data(),
                        threshold: self.config.pattern_base_confidence,
                    },
                    pattern.confidence,
                );
                memory.context = context;
                memory
            })
            .collect()
    }

    /// Learn from one processed invoice.
    ///
    /// `strategy` overrides the configured commit strategy for this call.
    /// Store failures become failed results; nothing here returns an error.
    #[tracing::instrument(skip(self, outcome), fields(invoice_id = %outcome.invoice_id))]
    pub async fn learn_from_outcome(
        &mut self,
        outcome: &ProcessingOutcome,
        strategy: Option<LearningStrategy>,
    ) -> LearningReport {
        let started = Instant::now();
        let strategy = strategy.unwrap_or(self.config.strategy);
        let mut report = LearningReport {
            corrections_processed: outcome
                .human_feedback
                .as_ref()
                .map_or(0, |f| f.corrections.len()),
            ..LearningReport::default()
        };

        let fresh = outcome.learnable_corrections();
        let touched: BTreeSet<(String, String)> = fresh
            .iter()
            .filter(|c| c.is_learnable())
            .map(|c| (c.field.trim().to_string(), util::normalize_value_key(&c.corrected_value)))
            .collect();
        self.remember(fresh);

        if !touched.is_empty() {
            let patterns: Vec<Pattern> = self
                .recognize_patterns(&self.history, Some(outcome.vendor_id.as_str()))
                .into_iter()
                .filter(|p| touched.contains(&(p.field.clone(), util::normalize_value_key(&p.value))))
                .collect();
            debug!(patterns = patterns.len(), "Recognized correction patterns");

            for pattern in &patterns {
                let (results, updates) = self.absorb_pattern(pattern, outcome).await;
                report.merge(results, updates);
            }
            report.patterns = patterns;
        }

        self.outcomes_since_commit += 1;
        let (results, updates) = self.commit(strategy).await;
        report.merge(results, updates);

        if let Some(resolution) = outcome.human_feedback.as_ref().and_then(|f| f.resolution.as_ref()) {
            let (result, update) = self.record_resolution(resolution, outcome).await;
            report.results.push(result);
            report.memory_updates.extend(update);
        }

        report.pending = self.pending.len();
        let failures = report.results.iter().filter(|r| !r.success).count();
        self.audit.record(
            AuditOperation::MemoryLearning,
            format!("Learned from outcome of invoice {}", outcome.invoice_id),
            payload! {
                "invoiceId" => outcome.invoice_id,
                "vendorId" => outcome.vendor_id,
                "decisionType" => outcome.decision_type.as_str(),
                "correctionsProcessed" => report.corrections_processed,
                "strategy" => strategy,
            },
            payload! {
                "patterns" => report.patterns.len(),
                "results" => report.results.len(),
                "failures" => failures,
                "pending" => report.pending,
            },
            started.elapsed(),
        );
        info!(
            invoice_id = %outcome.invoice_id,
            corrections = report.corrections_processed,
            patterns = report.patterns.len(),
            failures,
            "Learning complete"
        );

        report
    }

    /// Reinforce (or weaken) every memory applied to an invoice, depending on
    /// how the invoice ended up. Undecided outcomes change nothing.
    pub async fn learn_from_approvals(
        &mut self,
        memory_ids: &[String],
        outcome: &ProcessingOutcome,
    ) -> (Vec<LearningResult>, Vec<MemoryUpdate>) {
        let start = Instant::now();
        let Some(approved) = outcome.approval() else {
            return (Vec::new(), Vec::new());
        };
        let learning_type = if approved {
            LearningType::MemoryReinforcement
        } else {
            LearningType::MemoryWeakening
        };

        let mut results = Vec::with_capacity(memory_ids.len());
        let mut updates = Vec::new();
        for id in memory_ids {
            let call = self.confidence.reinforce_stored(self.store.as_ref(), id, approved);
            match bounded("learn", self.store_timeout, call).await {
                Ok((memory, update)) => {
                    results.push(LearningResult::succeeded(id, learning_type, memory.confidence));
                    updates.push(update);
                }
                Err(e) => {
                    warn!(memory_id = %id, error = %e, "Could not update memory confidence");
                    results.push(LearningResult::failed(Some(id.as_str()), learning_type, e.to_string()));
                }
            }
        }

        self.audit.record(
            AuditOperation::ConfidenceCalculation,
            format!("Updated confidence of {} applied memories", memory_ids.len()),
            payload! {
                "invoiceId" => outcome.invoice_id,
                "memoryIds" => memory_ids,
                "approved" => approved,
            },
            payload! {
                "updated" => updates.len(),
                "failed" => results.len() - updates.len(),
            },
            start.elapsed(),
        );
        (results, updates)
    }

    /// Commit every pending memory regardless of strategy.
    pub async fn flush(&mut self) -> (Vec<LearningResult>, Vec<MemoryUpdate>) {
        let pending = std::mem::take(&mut self.pending);
        self.outcomes_since_commit = 0;
        self.save_all(pending).await
    }

    /// Decay every active memory of a vendor by its idle time and archive
    /// the ones under the retention floor.
    pub async fn run_maintenance(&mut self, vendor_id: &str, now: DateTime<Utc>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let memories = match bounded("maintenance", self.store_timeout, self.store.list_memories_by_vendor(vendor_id)).await {
            Ok(memories) => memories,
            Err(e) => {
                report.errors.push(e.to_string());
                return report;
            }
        };

        for memory in memories.into_iter().filter(|m| !m.archived) {
            report.examined += 1;
            let mut current = memory;
            let mut updates = Vec::new();
            if let Some((decayed, update)) = self.confidence.decay(&current, now) {
                current = decayed;
                updates.push(update);
            }
            let archiving = self.confidence.should_archive(&current);
            if archiving {
                let (archived, update) = self.confidence.archive(&current);
                current = archived;
                updates.push(update);
            }
            if updates.is_empty() {
                continue;
            }

            match bounded("maintenance", self.store_timeout, self.store.update_memory(&current)).await {
                Ok(_) => {
                    if updates.iter().any(|u| u.update_type == UpdateType::Decayed) {
                        report.decayed += 1;
                    }
                    if archiving {
                        report.archived += 1;
                    }
                    report.memory_updates.extend(updates);
                }
                Err(e) => {
                    warn!(memory_id = %current.id, error = %e, "Maintenance update skipped");
                    report.errors.push(e.to_string());
                }
            }
        }

        info!(
            vendor_id,
            examined = report.examined,
            decayed = report.decayed,
            archived = report.archived,
            "Maintenance complete"
        );
        report
    }

    fn remember(&mut self, corrections: Vec<Correction>) {
        self.history.extend(corrections.into_iter().filter(Correction::is_learnable));
        if self.history.len() > MAX_CORRECTION_HISTORY {
            let excess = self.history.len() - MAX_CORRECTION_HISTORY;
            self.history.drain(..excess);
        }
    }

    /// Reinforce the stored memory with the pattern's signature, refresh a
    /// pending one, or queue a new memory.
    async fn absorb_pattern(
        &mut self,
        pattern: &Pattern,
        outcome: &ProcessingOutcome,
    ) -> (Vec<LearningResult>, Vec<MemoryUpdate>) {
        if let Some(queued) = self
            .pending
            .iter_mut()
            .find(|m| m.pattern.signature() == Some(pattern.signature.as_str()))
        {
            queued.confidence = queued.confidence.max(pattern.confidence);
            queued.pattern.data = pattern.to_data();
            queued.context.push_history(&outcome.invoice_id);
            return (Vec::new(), Vec::new());
        }

        let scope = pattern.vendor_id.as_deref().unwrap_or(&outcome.vendor_id);
        let existing = match bounded("learn", self.store_timeout, self.store.list_memories_by_vendor(scope)).await {
            Ok(memories) => memories
                .into_iter()
                .find(|m| !m.archived && m.pattern.signature() == Some(pattern.signature.as_str())),
            Err(e) => {
                warn!(error = %e, "Could not look up existing memories");
                let result = LearningResult::failed(None, LearningType::PatternRecognition, e.to_string());
                return (vec![result], Vec::new());
            }
        };

        if let Some(existing) = existing {
            let call = self.confidence.reinforce_stored(self.store.as_ref(), &existing.id, true);
            return match bounded("learn", self.store_timeout, call).await {
                Ok((memory, update)) => (
                    vec![LearningResult::succeeded(&memory.id, LearningType::MemoryReinforcement, memory.confidence)],
                    vec![update],
                ),
                Err(e) => (
                    vec![LearningResult::failed(Some(existing.id.as_str()), LearningType::MemoryReinforcement, e.to_string())],
                    Vec::new(),
                ),
            };
        }

        let mut context = MemoryContext::for_vendor(outcome.vendor_id.clone());
        context.push_history(&outcome.invoice_id);
        let created = self.create_memories_from_patterns(std::slice::from_ref(pattern), &context);
        self.pending.extend(created);
        (Vec::new(), Vec::new())
    }

    async fn commit(&mut self, strategy: LearningStrategy) -> (Vec<LearningResult>, Vec<MemoryUpdate>) {
        let ready: Vec<Memory> = match strategy {
            LearningStrategy::Immediate => std::mem::take(&mut self.pending),
            LearningStrategy::Batch => {
                if self.outcomes_since_commit >= self.config.batch_size.max(1) {
                    self.outcomes_since_commit = 0;
                    std::mem::take(&mut self.pending)
                } else {
                    Vec::new()
                }
            }
            LearningStrategy::PatternBased => {
                let threshold = self.config.pattern_commit_confidence;
                let (ready, waiting) = std::mem::take(&mut self.pending)
                    .into_iter()
                    .partition(|m| m.confidence >= threshold);
                self.pending = waiting;
                ready
            }
        };
        self.save_all(ready).await
    }

    async fn save_all(&self, memories: Vec<Memory>) -> (Vec<LearningResult>, Vec<MemoryUpdate>) {
        let mut results = Vec::with_capacity(memories.len());
        let mut updates = Vec::new();
        for memory in memories {
            match bounded("learn", self.store_timeout, self.store.save_memory(&memory)).await {
                Ok(()) => {
                    debug!(memory_id = %memory.id, confidence = memory.confidence, "Committed learned memory");
                    results.push(LearningResult::succeeded(&memory.id, LearningType::NewMemory, memory.confidence));
                    updates.push(MemoryUpdate::created(&memory, "recurring correction pattern"));
                }
                Err(e) => {
                    warn!(memory_id = %memory.id, error = %e, "Could not persist learned memory");
                    results.push(LearningResult::failed(Some(memory.id.as_str()), LearningType::NewMemory, e.to_string()));
                }
            }
        }
        (results, updates)
    }

    async fn record_resolution(
        &self,
        feedback: &ResolutionFeedback,
        outcome: &ProcessingOutcome,
    ) -> (LearningResult, Option<MemoryUpdate>) {
        let mut context = MemoryContext::for_vendor(outcome.vendor_id.clone());
        context.push_history(&outcome.invoice_id);
        let memory = Memory::resolution(
            ResolutionMemory {
                discrepancy_type: feedback.discrepancy_type.clone(),
                resolution_outcome: feedback.outcome,
                human_decision: feedback.human_decision.clone(),
                context_factors: feedback.context_factors.clone(),
            },
            self.config.resolution_confidence,
        )
        .with_context(context);

        match bounded("learn", self.store_timeout, self.store.save_memory(&memory)).await {
            Ok(()) => (
                LearningResult::succeeded(&memory.id, LearningType::ResolutionRecording, memory.confidence),
                Some(MemoryUpdate::created(&memory, "human resolution")),
            ),
            Err(e) => (
                LearningResult::failed(Some(memory.id.as_str()), LearningType::ResolutionRecording, e.to_string()),
                None,
            ),
        }
    }
}
