#![deny(
    clippy::all,
    clippy::nursery,
    clippy::pedantic,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::correctness,
    clippy::suspicious,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::similar_names,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]

pub mod application;
mod bounded;
pub mod confidence;
pub mod decision;
pub mod learning;
pub mod pipeline;

pub use application::{
    AppliedMemory, ApplicationResult, ConflictKind, Contender, FailedMemory,
    MemoryApplicationEngine, ResolvedConflict, ValidationResult,
};
pub use confidence::ConfidenceManager;
pub use decision::{DecisionContext, DecisionEngine, IssueSeverity, ValidationIssue, validate_invoice};
pub use learning::{LearningReport, MaintenanceReport, MemoryLearningEngine, Pattern};
pub use pipeline::{InvoiceProcessor, ProcessorConfig};
