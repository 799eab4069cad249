//! `DatabaseStore` against an in-memory SQLite database.

use chrono::{Duration as ChronoDuration, Utc};
use invoicemem_core::{
    ActionType, AuditLog, AuditOperation, AuditSink, CorrectionAction, CorrectionMemory,
    CorrectionType, Error, FieldMapping, Memory, MemoryStore, SequentialIdGenerator,
    UNKNOWN_INVOICE, VendorMemory, payload,
};
use invoicemem_store::DatabaseStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn store() -> DatabaseStore {
    DatabaseStore::connect("sqlite::memory:").await.unwrap()
}

fn vendor(id: &str, vendor_id: &str) -> Memory {
    Memory::vendor(
        VendorMemory {
            vendor_id: vendor_id.to_string(),
            field_mappings: vec![FieldMapping::new("Leistungsdatum", "serviceDate", 0.9)],
            ..VendorMemory::default()
        },
        0.8,
    )
    .with_id(id)
}

fn unscoped_correction(id: &str) -> Memory {
    Memory::correction(
        CorrectionMemory {
            correction_type: CorrectionType::CurrencyFix,
            trigger_conditions: Vec::new(),
            correction_action: CorrectionAction {
                action_type: ActionType::Set,
                target_field: "currency".to_string(),
                new_value: json!("EUR"),
                search: None,
            },
            validation_rules: Vec::new(),
        },
        0.7,
    )
    .with_id(id)
}

#[tokio::test]
async fn test_recall_includes_unscoped_and_skips_archived() {
    let store = store().await;
    let mut archived = vendor("m-archived", "supplier-gmbh");
    archived.archived = true;

    store.save_memory(&vendor("m-1", "supplier-gmbh")).await.unwrap();
    store.save_memory(&archived).await.unwrap();
    store.save_memory(&vendor("m-other", "parts-ag")).await.unwrap();
    store.save_memory(&unscoped_correction("m-global")).await.unwrap();

    let recalled: Vec<String> = store
        .find_memories_by_vendor("supplier-gmbh")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(recalled.len(), 2);
    assert!(recalled.contains(&"m-1".to_string()));
    assert!(recalled.contains(&"m-global".to_string()));

    let listed = store.list_memories_by_vendor("supplier-gmbh").await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|m| m.archived));
}

#[tokio::test]
async fn test_memory_round_trips_through_payload() {
    let store = store().await;
    let memory = vendor("m-1", "supplier-gmbh");
    store.save_memory(&memory).await.unwrap();

    let loaded = store.find_memory("m-1").await.unwrap().unwrap();
    assert_eq!(loaded.kind, memory.kind);
    assert_eq!(loaded.version, 0);
    assert!((loaded.confidence - 0.8).abs() < f64::EPSILON);
    assert!(store.find_memory("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_is_compare_and_swap() {
    let store = store().await;
    store.save_memory(&vendor("m-1", "supplier-gmbh")).await.unwrap();

    let mut first = store.find_memory("m-1").await.unwrap().unwrap();
    let stale = first.clone();
    first.confidence = 0.9;
    assert_eq!(store.update_memory(&first).await.unwrap(), 1);

    match store.update_memory(&stale).await {
        Err(Error::VersionConflict { expected, actual, .. }) => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 1);
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }

    let stored = store.find_memory("m-1").await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert!((stored.confidence - 0.9).abs() < f64::EPSILON);

    let missing = vendor("m-missing", "supplier-gmbh");
    assert!(matches!(store.update_memory(&missing).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_save_overwrite_bumps_version() {
    let store = store().await;
    store.save_memory(&vendor("m-1", "supplier-gmbh")).await.unwrap();
    store.save_memory(&vendor("m-1", "supplier-gmbh")).await.unwrap();

    assert_eq!(store.find_memory("m-1").await.unwrap().unwrap().version, 1);
}

#[tokio::test]
async fn test_audit_trail_keeps_order_and_fields() {
    let store = store().await;
    let mut log = AuditLog::new("test_actor", Arc::new(SequentialIdGenerator::new("step")));
    log.record(
        AuditOperation::MemoryRecall,
        "recall",
        payload! { "invoiceId" => "INV-1" },
        payload! { "memoryCount" => 2 },
        Duration::from_millis(3),
    );
    log.record(
        AuditOperation::DecisionMaking,
        "decide",
        payload! { "invoice" => json!({ "id": "INV-1" }) },
        payload! { "decisionType" => "human_review_required" },
        Duration::ZERO,
    );
    log.record(
        AuditOperation::Validation,
        "other invoice",
        payload! { "invoiceId" => "INV-2" },
        payload! {},
        Duration::ZERO,
    );
    log.record(AuditOperation::ErrorHandling, "orphan", payload! {}, payload! {}, Duration::ZERO);
    let steps = log.take();

    store.record_audit_steps(&steps).await.unwrap();

    let trail = store.get_audit_trail("INV-1").await.unwrap();
    assert_eq!(trail, steps[..2].to_vec());
    assert_eq!(trail[0].duration, 3);
    assert_eq!(trail[1].operation, AuditOperation::DecisionMaking);

    assert_eq!(store.get_audit_trail(UNKNOWN_INVOICE).await.unwrap().len(), 1);
    assert!(store.get_audit_trail("INV-404").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_audit_batch_is_all_or_nothing() {
    let store = store().await;
    let mut log = AuditLog::new("test_actor", Arc::new(SequentialIdGenerator::new("step")));
    let good = log.record(
        AuditOperation::Validation,
        "ok",
        payload! { "invoiceId" => "INV-1" },
        payload! {},
        Duration::ZERO,
    );
    let mut bad = good.clone();
    bad.id = String::new();
    bad.timestamp += ChronoDuration::milliseconds(1);

    assert!(store.record_audit_steps(&[good.clone(), bad]).await.is_err());
    assert!(store.get_audit_trail("INV-1").await.unwrap().is_empty());

    store.record_audit_step(&good).await.unwrap();
    let trail = store.get_audit_trail("INV-1").await.unwrap();
    assert_eq!(trail.len(), 1);
    assert!(trail[0].timestamp <= Utc::now());
}

#[tokio::test]
async fn test_audit_batch_rolls_back_on_duplicate_step() {
    let store = store().await;
    let mut log = AuditLog::new("test_actor", Arc::new(SequentialIdGenerator::new("step")));
    let mut record = |description: &str| {
        log.record(
            AuditOperation::MemoryLearning,
            description,
            payload! { "invoiceId" => "INV-7" },
            payload! {},
            Duration::ZERO,
        )
    };
    let first = record("first");
    let second = record("second");
    let third = record("third");

    store.record_audit_step(&first).await.unwrap();

    // The duplicate is only caught by the database, after `second` was written.
    let err = store
        .record_audit_steps(&[second.clone(), first.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(_)));
    assert_eq!(store.get_audit_trail("INV-7").await.unwrap(), vec![first.clone()]);

    let mut repeated = third.clone();
    repeated.description = "third again".to_string();
    assert!(store.record_audit_steps(&[third, repeated]).await.is_err());
    assert_eq!(store.get_audit_trail("INV-7").await.unwrap(), vec![first.clone()]);

    store.record_audit_steps(&[second.clone()]).await.unwrap();
    assert_eq!(store.get_audit_trail("INV-7").await.unwrap(), vec![first, second]);
}

#[tokio::test]
async fn test_loaded_memories_are_well_formed() {
    let store = store().await;
    let mut decayed = vendor("m-decayed", "supplier-gmbh");
    decayed.decay_base = Some(0.9);

    store.save_memory(&decayed).await.unwrap();
    store.save_memory(&unscoped_correction("m-global")).await.unwrap();

    let loaded = store.find_memories_by_vendor("supplier-gmbh").await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().all(Memory::is_well_formed));
    let reloaded = store.find_memory("m-decayed").await.unwrap().unwrap();
    assert_eq!(reloaded.decay_base, Some(0.9));
}
