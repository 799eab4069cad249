//! End-to-end runs of `InvoiceProcessor`.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{OfflineStore, ReadOnlySink, VENDOR, invoice, service_date_memory};
use invoicemem_core::{
    AuditOperation, AuditSink, HumanFeedback, MemoryStore, ProcessingResult, SequentialIdGenerator,
    UpdateType,
};
use invoicemem_engine::{InvoiceProcessor, ProcessorConfig};
use invoicemem_store::{InMemoryAuditSink, InMemoryMemoryStore};
use std::collections::HashSet;
use std::sync::Arc;

fn processor(store: Arc<dyn MemoryStore>, sink: Arc<dyn AuditSink>) -> InvoiceProcessor {
    InvoiceProcessor::with_id_generator(
        ProcessorConfig::default(),
        store,
        sink,
        Arc::new(SequentialIdGenerator::new("step")),
    )
}

#[tokio::test]
async fn test_full_run_produces_a_complete_audit_trail() {
    let store = Arc::new(InMemoryMemoryStore::with_memories(vec![
        service_date_memory("m-low", 0.6),
        service_date_memory("m-high", 0.9),
    ]));
    let sink = Arc::new(InMemoryAuditSink::new());
    let processor = processor(store, sink.clone());

    let result = processor.process(&invoice("INV-1")).await.unwrap();

    assert_eq!(
        result.normalized_invoice.service_date.map(|d| d.to_string()),
        Some("2024-01-15".to_string())
    );
    assert!((0.0..=1.0).contains(&result.confidence_score));
    assert_eq!(result.requires_human_review, result.decision.requires_human_review());
    assert!(!result.reasoning.is_empty());

    let trail = &result.audit_trail;
    assert_eq!(trail.first().map(|s| s.operation), Some(AuditOperation::MemoryRecall));
    assert!(trail.iter().any(|s| s.operation == AuditOperation::FieldNormalization));
    assert!(trail.iter().any(|s| s.operation == AuditOperation::DecisionMaking));
    assert!(trail.iter().any(|s| s.operation == AuditOperation::MemoryLearning));
    assert!(trail.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let ids: HashSet<&str> = trail.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids.len(), trail.len());
    assert!(ids.iter().all(|id| !id.is_empty()));

    let persisted = sink.get_audit_trail("INV-1").await.unwrap();
    assert_eq!(&persisted, trail);
}

#[tokio::test]
async fn test_human_approval_reinforces_applied_memory() {
    let store = Arc::new(InMemoryMemoryStore::with_memories(vec![service_date_memory("m-1", 0.7)]));
    let processor = processor(store.clone(), Arc::new(InMemoryAuditSink::new()));

    let feedback = HumanFeedback {
        approved: true,
        corrections: Vec::new(),
        resolution: None,
    };
    let result = processor
        .process_with_feedback(&invoice("INV-2"), Some(feedback))
        .await
        .unwrap();

    assert!(result
        .memory_updates
        .iter()
        .any(|u| u.memory_id == "m-1" && u.update_type == UpdateType::Reinforced));
    let stored = store.find_memory("m-1").await.unwrap().unwrap();
    assert!(stored.confidence > 0.7);
    assert_eq!(stored.usage_count, 1);
}

#[tokio::test]
async fn test_recall_failure_degrades_to_no_memories() {
    let sink = Arc::new(InMemoryAuditSink::new());
    let processor = processor(Arc::new(OfflineStore), sink.clone());

    let result = processor.process(&invoice("INV-3")).await.unwrap();

    assert!(result.normalized_invoice.normalized_fields.is_empty());
    assert!(result.memory_updates.is_empty());
    assert!(result
        .audit_trail
        .iter()
        .any(|s| s.operation == AuditOperation::ErrorHandling));
    assert_eq!(sink.get_audit_trail("INV-3").await.unwrap().len(), result.audit_trail.len());
}

fn assert_round_trips(result: &ProcessingResult) {
    let json = serde_json::to_string(result).unwrap();
    let back: ProcessingResult = serde_json::from_str(&json).unwrap();
    assert_eq!(&back, result);
}

#[tokio::test]
async fn test_result_survives_serialization() {
    let store = Arc::new(InMemoryMemoryStore::with_memories(vec![service_date_memory("m-1", 0.7)]));
    let processor = processor(store, Arc::new(InMemoryAuditSink::new()));
    let feedback = HumanFeedback {
        approved: true,
        corrections: Vec::new(),
        resolution: None,
    };

    let result = processor
        .process_with_feedback(&invoice("INV-6"), Some(feedback))
        .await
        .unwrap();

    assert!(!result.memory_updates.is_empty());
    assert_round_trips(&result);
}

#[tokio::test]
async fn test_degraded_result_survives_serialization() {
    let processor = processor(Arc::new(OfflineStore), Arc::new(InMemoryAuditSink::new()));

    let result = processor.process(&invoice("INV-7")).await.unwrap();

    assert!(result
        .audit_trail
        .iter()
        .any(|s| s.operation == AuditOperation::ErrorHandling));
    assert_round_trips(&result);
}

#[tokio::test]
async fn test_audit_write_failure_is_an_error() {
    let processor = processor(Arc::new(InMemoryMemoryStore::new()), Arc::new(ReadOnlySink));

    assert!(processor.process(&invoice("INV-4")).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_results_keep_input_order() {
    let store = Arc::new(InMemoryMemoryStore::with_memories(vec![service_date_memory("m-1", 0.9)]));
    let sink = Arc::new(InMemoryAuditSink::new());
    let processor = Arc::new(processor(store, sink.clone()));

    let ids = ["INV-a", "INV-b", "INV-c", "INV-d", "INV-e"];
    let results = processor
        .process_batch(ids.iter().map(|id| invoice(id)).collect())
        .await;

    assert_eq!(results.len(), ids.len());
    for (id, result) in ids.iter().zip(&results) {
        let result = result.as_ref().unwrap();
        assert_eq!(result.normalized_invoice.id, *id);
        let trail = sink.get_audit_trail(id).await.unwrap();
        assert_eq!(trail.len(), result.audit_trail.len());
    }
}

#[tokio::test]
async fn test_maintenance_decays_and_archives() {
    let mut idle = service_date_memory("m-idle", 0.8);
    idle.last_used = Utc::now() - ChronoDuration::days(30);
    let weak = service_date_memory("m-weak", 0.12);
    let store = Arc::new(InMemoryMemoryStore::with_memories(vec![idle, weak]));
    let processor = processor(store.clone(), Arc::new(InMemoryAuditSink::new()));

    let report = processor.run_maintenance(VENDOR, Utc::now()).await;

    assert_eq!(report.examined, 2);
    assert_eq!(report.archived, 1);
    assert!(report.decayed >= 1);
    assert!(report.errors.is_empty());

    let active = store.find_memories_by_vendor(VENDOR).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "m-idle");
    assert!(active[0].confidence < 0.8);
    assert!(store.find_memory("m-weak").await.unwrap().unwrap().archived);
}

#[tokio::test]
async fn test_repeated_maintenance_does_not_compound_decay() {
    let now = Utc::now();
    let mut idle = service_date_memory("m-idle", 0.8);
    idle.last_used = now - ChronoDuration::days(30);
    let store = Arc::new(InMemoryMemoryStore::with_memories(vec![idle]));
    let processor = processor(store.clone(), Arc::new(InMemoryAuditSink::new()));

    let first = processor.run_maintenance(VENDOR, now).await;
    assert_eq!(first.decayed, 1);
    let after_first = store.find_memory("m-idle").await.unwrap().unwrap();

    for _ in 0..7 {
        let report = processor.run_maintenance(VENDOR, now).await;
        assert_eq!(report.decayed, 0);
        assert_eq!(report.archived, 0);
    }

    let stored = store.find_memory("m-idle").await.unwrap().unwrap();
    assert!(!stored.archived);
    assert!((stored.confidence - after_first.confidence).abs() < f64::EPSILON);
    assert!(stored.is_well_formed());

    let years_later = processor
        .run_maintenance(VENDOR, now + ChronoDuration::days(3650))
        .await;
    assert_eq!(years_later.archived, 0);
    let floor = store.find_memory("m-idle").await.unwrap().unwrap();
    assert!((floor.confidence - 0.4).abs() < 1e-9);
}
