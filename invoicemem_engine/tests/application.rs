//! Memory application against realistic vendor invoices.

mod common;

use common::{correction_memory, invoice, service_date_memory};
use invoicemem_core::{
    ActionType, ApplicationConfig, Condition, ConditionOperator, Memory, MemoryKind,
    SequentialIdGenerator, ValidationRule,
};
use invoicemem_engine::{ConflictKind, MemoryApplicationEngine};
use serde_json::json;
use std::sync::Arc;

fn engine() -> MemoryApplicationEngine {
    MemoryApplicationEngine::with_id_generator(
        ApplicationConfig::default(),
        Arc::new(SequentialIdGenerator::new("app")),
    )
}

#[test]
fn test_conflicting_service_date_mappings_pick_highest_confidence() {
    let memories = vec![
        service_date_memory("m-low", 0.6),
        service_date_memory("m-high", 0.9),
    ];

    let result = engine().apply_memories(&invoice("INV-1"), &memories);

    assert_eq!(result.normalized_fields.len(), 1);
    let field = &result.normalized_fields[0];
    assert_eq!(field.normalized_field, "serviceDate");
    assert_eq!(field.memory_id, "m-high");
    assert_eq!(
        result.normalized_invoice.service_date.map(|d| d.to_string()),
        Some("2024-01-15".to_string())
    );

    assert_eq!(result.resolved_conflicts.len(), 1);
    let conflict = &result.resolved_conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::FieldMapping);
    assert_eq!(conflict.winner_id, "m-high");
    assert_eq!(conflict.contenders.len(), 2);
    assert!(conflict.reasoning.contains("confidence"));

    assert_eq!(result.applied_memory_ids(), vec!["m-high".to_string()]);
    assert!(result.failed_memories.is_empty());
}

#[test]
fn test_application_is_independent_of_recall_order() {
    let forward = vec![
        service_date_memory("m-low", 0.6),
        service_date_memory("m-high", 0.9),
    ];
    let reversed: Vec<_> = forward.iter().rev().cloned().collect();

    let a = engine().apply_memories(&invoice("INV-1"), &forward);
    let b = engine().apply_memories(&invoice("INV-1"), &reversed);

    assert_eq!(a.normalized_invoice, b.normalized_invoice);
    assert_eq!(a.resolved_conflicts[0].winner_id, b.resolved_conflicts[0].winner_id);
    assert!((a.application_confidence - b.application_confidence).abs() < f64::EPSILON);
}

#[test]
fn test_tied_confidence_breaks_on_memory_id() {
    let memories = vec![
        service_date_memory("m-b", 0.8),
        service_date_memory("m-a", 0.8),
    ];

    let result = engine().apply_memories(&invoice("INV-1"), &memories);

    assert_eq!(result.resolved_conflicts[0].winner_id, "m-a");
    assert!(result.resolved_conflicts[0].reasoning.contains("tie-break"));
}

#[test]
fn test_failed_correction_falls_back_to_next_memory() {
    let memories = vec![
        // Fires, but multiplying a currency that is not there fails.
        correction_memory(
            "c-high",
            0.9,
            "currency",
            ActionType::Multiply,
            json!(2),
            vec![Condition::new("vendorId", ConditionOperator::Exists, None)],
        ),
        correction_memory(
            "c-low",
            0.7,
            "currency",
            ActionType::Set,
            json!("EUR"),
            vec![Condition::new("currency", ConditionOperator::NotExists, None)],
        ),
    ];

    let result = engine().apply_memories(&invoice("INV-2"), &memories);

    assert_eq!(result.proposed_corrections.len(), 1);
    let correction = &result.proposed_corrections[0];
    assert_eq!(correction.field, "currency");
    assert_eq!(correction.corrected_value, json!("EUR"));
    assert_eq!(correction.memory_id.as_deref(), Some("c-low"));

    assert!(result.failed_memories.iter().any(|f| f.memory_id == "c-high"));
    assert_eq!(result.failed_memories.len(), 1);
    // mean 0.7 of the applied memory, less 0.1 for the failed one
    assert!((result.application_confidence - 0.6).abs() < 1e-9);
    assert!(result
        .resolved_conflicts
        .iter()
        .any(|c| c.kind == ConflictKind::Correction && c.key == "currency"));
    assert_eq!(result.normalized_invoice.currency, "EUR");
}

fn multiply_currency(id: &str, confidence: f64) -> Memory {
    correction_memory(
        id,
        confidence,
        "currency",
        ActionType::Multiply,
        json!(2),
        vec![Condition::new("vendorId", ConditionOperator::Exists, None)],
    )
}

fn set_currency(id: &str, confidence: f64) -> Memory {
    correction_memory(
        id,
        confidence,
        "currency",
        ActionType::Set,
        json!("EUR"),
        vec![Condition::new("currency", ConditionOperator::NotExists, None)],
    )
}

#[test]
fn test_validation_failure_lowers_confidence() {
    let mut memory = set_currency("c-eur", 0.8);
    if let MemoryKind::Correction(correction) = &mut memory.kind {
        correction.validation_rules.push(ValidationRule::Range {
            field: "totalAmount".to_string(),
            min: 0.0,
            max: 100.0,
        });
    }

    let result = engine().apply_memories(&invoice("INV-6"), &[memory]);

    assert_eq!(result.applied_memory_ids(), vec!["c-eur".to_string()]);
    assert!(result.failed_memories.is_empty());
    assert_eq!(result.validation_failures(), 1);
    assert!((result.application_confidence - 0.75).abs() < 1e-9);
}

#[test]
fn test_confidence_is_clamped_at_lower_bound() {
    let mut memories: Vec<Memory> = (0..5)
        .map(|i| multiply_currency(&format!("c-fail-{i}"), 0.9 - f64::from(i) * 0.05))
        .collect();
    memories.push(set_currency("c-eur", 0.4));

    let result = engine().apply_memories(&invoice("INV-7"), &memories);

    assert_eq!(result.failed_memories.len(), 5);
    assert_eq!(result.applied_memory_ids(), vec!["c-eur".to_string()]);
    assert!((result.application_confidence - 0.1).abs() < f64::EPSILON);
}

#[test]
fn test_unmet_trigger_proposes_nothing() {
    let memories = vec![correction_memory(
        "c-usd",
        0.9,
        "currency",
        ActionType::Set,
        json!("USD"),
        vec![Condition::new("currency", ConditionOperator::Equals, Some(json!("CHF")))],
    )];

    let result = engine().apply_memories(&invoice("INV-3"), &memories);

    assert!(result.proposed_corrections.is_empty());
    assert!(result.applied_memories.is_empty());
}

#[test]
fn test_memories_below_threshold_are_ignored() {
    let memories = vec![service_date_memory("m-weak", 0.2)];

    let result = engine().apply_memories(&invoice("INV-4"), &memories);

    assert!(result.normalized_fields.is_empty());
    assert!(result.normalized_invoice.service_date.is_none());
    assert!((result.application_confidence - 0.5).abs() < f64::EPSILON);
    assert_eq!(result.normalized_invoice.line_items.len(), 1);
}

#[test]
fn test_audit_steps_carry_invoice_id() {
    let mut engine = engine();
    let memories = vec![
        service_date_memory("m-low", 0.6),
        service_date_memory("m-high", 0.9),
    ];

    let result = engine.apply_memories(&invoice("INV-5"), &memories);

    assert!(!result.audit_steps.is_empty());
    assert!(result.audit_steps.iter().all(|s| s.invoice_id() == Some("INV-5")));
    assert_eq!(engine.audit_steps().len(), result.audit_steps.len());
    assert!(result.audit_steps.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}
