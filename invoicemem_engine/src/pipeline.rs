//! Per-invoice pipeline: recall, apply, decide, learn.
//!
//! Stages run strictly in sequence for one invoice. Independent invoices
//! may be processed concurrently through [`InvoiceProcessor::process_batch`];
//! the learning engine is the only state shared between them.

use chrono::{DateTime, Utc};
use invoicemem_core::memory::clamp_unit;
use invoicemem_core::{
    ApplicationConfig, AuditLog, AuditOperation, AuditSink, AuditStep, ConfidenceConfig,
    DecisionConfig, Error, HumanFeedback, LearningConfig, Memory, MemoryStore, PipelineConfig,
    ProcessingOutcome, ProcessingResult, RawInvoice, Result, StepIdGenerator, UuidGenerator,
    payload,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::application::MemoryApplicationEngine;
use crate::bounded::bounded;
use crate::confidence::ConfidenceManager;
use crate::decision::{DecisionContext, DecisionEngine};
use crate::learning::{MaintenanceReport, MemoryLearningEngine};

const ACTOR: &str = "invoice_processor";

#[derive(Debug, Clone, Default)]
pub struct ProcessorConfig {
    pub application: ApplicationConfig,
    pub confidence: ConfidenceConfig,
    pub decision: DecisionConfig,
    pub learning: LearningConfig,
    pub pipeline: PipelineConfig,
}

pub struct InvoiceProcessor {
    config: ProcessorConfig,
    store: Arc<dyn MemoryStore>,
    sink: Arc<dyn AuditSink>,
    ids: Arc<dyn StepIdGenerator>,
    learning: Mutex<MemoryLearningEngine>,
}

impl InvoiceProcessor {
    #[must_use]
    pub fn new(config: ProcessorConfig, store: Arc<dyn MemoryStore>, sink: Arc<dyn AuditSink>) -> Self {
        Self::with_id_generator(config, store, sink, Arc::new(UuidGenerator))
    }

    #[must_use]
    pub fn with_id_generator(
        config: ProcessorConfig,
        store: Arc<dyn MemoryStore>,
        sink: Arc<dyn AuditSink>,
        ids: Arc<dyn StepIdGenerator>,
    ) -> Self {
        let learning = MemoryLearningEngine::with_id_generator(
            config.learning.clone(),
            ConfidenceManager::new(config.confidence.clone()),
            Arc::clone(&store),
            Arc::clone(&ids),
        )
        .with_store_timeout(Duration::from_millis(config.pipeline.stage_timeout_ms));

        Self {
            config,
            store,
            sink,
            ids,
            learning: Mutex::new(learning),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.config.pipeline.stage_timeout_ms)
    }

    pub async fn process(&self, invoice: &RawInvoice) -> Result<ProcessingResult> {
        self.process_with_feedback(invoice, None).await
    }

    /// Run the full pipeline for one invoice.
    ///
    /// Store failures degrade the result (empty recall, failed learning
    /// results). Only a failed audit write is returned as an error.
    #[tracing::instrument(skip(self, invoice, feedback), fields(invoice_id = %invoice.id, vendor_id = %invoice.vendor_id))]
    pub async fn process_with_feedback(
        &self,
        invoice: &RawInvoice,
        feedback: Option<HumanFeedback>,
    ) -> Result<ProcessingResult> {
        let mut log = AuditLog::new(ACTOR, Arc::clone(&self.ids));
        let memories = self.recall(invoice, &mut log).await;

        let mut application_engine =
            MemoryApplicationEngine::with_id_generator(self.config.application.clone(), Arc::clone(&self.ids));
        let application = application_engine.apply_memories(invoice, &memories);

        let mut decision_engine =
            DecisionEngine::with_id_generator(self.config.decision.clone(), Arc::clone(&self.ids));
        let decision = decision_engine.evaluate(&DecisionContext::from(&application));

        let outcome = ProcessingOutcome {
            invoice_id: invoice.id.clone(),
            vendor_id: invoice.vendor_id.clone(),
            decision_type: decision.decision_type,
            applied_memory_ids: application.applied_memory_ids(),
            proposed_corrections: application.proposed_corrections.clone(),
            human_feedback: feedback,
        };

        let (approval_results, mut memory_updates, report, learning_steps) = {
            let mut learning = self.learning.lock().await;
            learning.clear_audit_steps();
            let (approval_results, approval_updates) = learning
                .learn_from_approvals(&outcome.applied_memory_ids, &outcome)
                .await;
            let report = learning.learn_from_outcome(&outcome, None).await;
            (approval_results, approval_updates, report, learning.take_audit_steps())
        };
        memory_updates.extend(report.memory_updates.iter().cloned());

        let failed_learning = approval_results
            .iter()
            .chain(report.results.iter())
            .filter(|r| !r.success)
            .count();
        if failed_learning > 0 {
            warn!(failed = failed_learning, "Some learning actions failed");
        }

        let mut trail = log.take();
        trail.extend(application_engine.take_audit_steps());
        trail.extend(decision_engine.take_audit_steps());
        trail.extend(learning_steps);
        enforce_chronology(&mut trail);

        if let Err(e) = bounded("audit", self.stage_timeout(), self.sink.record_audit_steps(&trail)).await {
            error!(error = %e, "Audit batch write failed");
            return Err(e);
        }

        let reasoning = format!(
            "{} Applied {} memories ({} failed, {} conflicts resolved), proposed {} corrections.",
            decision.reasoning,
            application.applied_memories.len(),
            application.failed_memories.len(),
            application.resolved_conflicts.len(),
            application.proposed_corrections.len(),
        );
        info!(
            decision = %decision.decision_type,
            confidence = decision.confidence,
            steps = trail.len(),
            "Invoice processed"
        );

        Ok(ProcessingResult {
            requires_human_review: decision.requires_human_review(),
            confidence_score: clamp_unit(decision.confidence),
            normalized_invoice: application.normalized_invoice,
            proposed_corrections: application.proposed_corrections,
            reasoning,
            memory_updates,
            audit_trail: trail,
            decision,
        })
    }

    /// Process independent invoices concurrently. Results keep input order.
    pub async fn process_batch(self: &Arc<Self>, invoices: Vec<RawInvoice>) -> Vec<Result<ProcessingResult>> {
        let total = invoices.len();
        let mut tasks = JoinSet::new();
        for (index, invoice) in invoices.into_iter().enumerate() {
            let processor = Arc::clone(self);
            tasks.spawn(async move { (index, processor.process(&invoice).await) });
        }

        let mut slots: Vec<Option<Result<ProcessingResult>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => error!(error = %e, "Invoice task did not complete"),
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(Error::Task("invoice task aborted".to_string()))))
            .collect()
    }

    /// Decay and archive a vendor's memories.
    pub async fn run_maintenance(&self, vendor_id: &str, now: DateTime<Utc>) -> MaintenanceReport {
        self.learning.lock().await.run_maintenance(vendor_id, now).await
    }

    /// Commit memories held back by the batch or pattern-based strategies.
    pub async fn flush_learning(&self) -> usize {
        let (results, _) = self.learning.lock().await.flush().await;
        results.iter().filter(|r| r.success).count()
    }

    async fn recall(&self, invoice: &RawInvoice, log: &mut AuditLog) -> Vec<Memory> {
        let started = Instant::now();
        let recalled = bounded(
            "recall",
            self.stage_timeout(),
            self.store.find_memories_by_vendor(&invoice.vendor_id),
        )
        .await;

        match recalled {
            Ok(memories) => {
                log.record(
                    AuditOperation::MemoryRecall,
                    format!("Recalled {} memories for vendor {}", memories.len(), invoice.vendor_id),
                    payload! { "invoiceId" => invoice.id, "vendorId" => invoice.vendor_id },
                    payload! { "memoryCount" => memories.len() },
                    started.elapsed(),
                );
                memories
            }
            Err(e) => {
                warn!(error = %e, "Memory recall failed, continuing without memories");
                log.record(
                    AuditOperation::ErrorHandling,
                    "Memory recall failed; continuing without memories",
                    payload! { "invoiceId" => invoice.id, "vendorId" => invoice.vendor_id },
                    payload! { "error" => e.to_string() },
                    started.elapsed(),
                );
                Vec::new()
            }
        }
    }
}

/// Engines keep their own logs; merged in stage order, a later stage's
/// step never precedes an earlier one.
fn enforce_chronology(steps: &mut [AuditStep]) {
    let mut last: Option<DateTime<Utc>> = None;
    for step in steps {
        if let Some(previous) = last {
            if step.timestamp < previous {
                step.timestamp = previous;
            }
        }
        last = Some(step.timestamp);
    }
}
