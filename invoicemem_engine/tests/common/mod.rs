#![allow(dead_code)]

use async_trait::async_trait;
use invoicemem_core::{
    ActionType, AuditSink, AuditStep, Condition, Correction, CorrectionAction, CorrectionMemory,
    CorrectionType, DecisionType, Error, ExtractedField, FieldMapping, HumanFeedback, Memory,
    MemoryContext, MemoryStore, ProcessingOutcome, RawInvoice, Result, TransformationRule,
    VendorMemory,
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

pub const VENDOR: &str = "supplier-gmbh";

pub fn invoice(id: &str) -> RawInvoice {
    RawInvoice {
        id: id.to_string(),
        vendor_id: VENDOR.to_string(),
        invoice_number: format!("R-{id}"),
        raw_text: "Rechnung\nLeistungsdatum: 15.01.2024\nGesamtbetrag 119,00 EUR".to_string(),
        extracted_fields: vec![
            ExtractedField::new("Leistungsdatum", json!("15.01.2024"), 0.92),
            ExtractedField::new("totalAmount", json!(119.0), 0.95),
        ],
        metadata: Map::new(),
    }
}

/// Vendor memory mapping `Leistungsdatum` onto `serviceDate`.
pub fn service_date_memory(id: &str, confidence: f64) -> Memory {
    Memory::vendor(
        VendorMemory {
            vendor_id: VENDOR.to_string(),
            field_mappings: vec![
                FieldMapping::new("Leistungsdatum", "serviceDate", 0.9)
                    .with_rule(TransformationRule::DateParse),
            ],
            ..VendorMemory::default()
        },
        confidence,
    )
    .with_id(id)
}

pub fn correction_memory(
    id: &str,
    confidence: f64,
    target_field: &str,
    action_type: ActionType,
    new_value: Value,
    trigger_conditions: Vec<Condition>,
) -> Memory {
    Memory::correction(
        CorrectionMemory {
            correction_type: CorrectionType::infer(target_field),
            trigger_conditions,
            correction_action: CorrectionAction {
                action_type,
                target_field: target_field.to_string(),
                new_value,
                search: None,
            },
            validation_rules: Vec::new(),
        },
        confidence,
    )
    .with_id(id)
    .with_context(MemoryContext::for_vendor(VENDOR))
}

/// Outcome of an invoice a reviewer fixed by setting the currency to EUR.
pub fn currency_fixed_outcome(invoice_id: &str) -> ProcessingOutcome {
    ProcessingOutcome {
        invoice_id: invoice_id.to_string(),
        vendor_id: VENDOR.to_string(),
        decision_type: DecisionType::HumanReviewRequired,
        applied_memory_ids: Vec::new(),
        proposed_corrections: Vec::new(),
        human_feedback: Some(HumanFeedback {
            approved: true,
            corrections: vec![Correction::manual("currency", Value::Null, json!("EUR"))],
            resolution: None,
        }),
    }
}

/// Store whose every call fails.
pub struct OfflineStore;

#[async_trait]
impl MemoryStore for OfflineStore {
    async fn find_memories_by_vendor(&self, _vendor_id: &str) -> Result<Vec<Memory>> {
        Err(Error::Store("connection refused".to_string()))
    }

    async fn list_memories_by_vendor(&self, _vendor_id: &str) -> Result<Vec<Memory>> {
        Err(Error::Store("connection refused".to_string()))
    }

    async fn find_memory(&self, _id: &str) -> Result<Option<Memory>> {
        Err(Error::Store("connection refused".to_string()))
    }

    async fn save_memory(&self, _memory: &Memory) -> Result<()> {
        Err(Error::Store("connection refused".to_string()))
    }

    async fn update_memory(&self, _memory: &Memory) -> Result<u64> {
        Err(Error::Store("connection refused".to_string()))
    }
}

/// Audit sink that refuses every write.
pub struct ReadOnlySink;

#[async_trait]
impl AuditSink for ReadOnlySink {
    async fn record_audit_step(&self, _step: &AuditStep) -> Result<()> {
        Err(Error::Store("audit log is read-only".to_string()))
    }

    async fn record_audit_steps(&self, _steps: &[AuditStep]) -> Result<()> {
        Err(Error::Store("audit log is read-only".to_string()))
    }

    async fn get_audit_trail(&self, _invoice_id: &str) -> Result<Vec<AuditStep>> {
        Ok(Vec::new())
    }
}

/// Store that answers every read after a fixed delay.
pub struct SlowStore {
    pub inner: Arc<dyn MemoryStore>,
    pub delay: Duration,
}

#[async_trait]
impl MemoryStore for SlowStore {
    async fn find_memories_by_vendor(&self, vendor_id: &str) -> Result<Vec<Memory>> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_memories_by_vendor(vendor_id).await
    }

    async fn list_memories_by_vendor(&self, vendor_id: &str) -> Result<Vec<Memory>> {
        tokio::time::sleep(self.delay).await;
        self.inner.list_memories_by_vendor(vendor_id).await
    }

    async fn find_memory(&self, id: &str) -> Result<Option<Memory>> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_memory(id).await
    }

    async fn save_memory(&self, memory: &Memory) -> Result<()> {
        self.inner.save_memory(memory).await
    }

    async fn update_memory(&self, memory: &Memory) -> Result<u64> {
        self.inner.update_memory(memory).await
    }
}
