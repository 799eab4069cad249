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

pub mod audit;
pub mod config;
pub mod decision;
mod error;
pub mod invoice;
pub mod learning;
pub mod memory;
mod repository;
pub mod util;

pub use audit::{
    AuditLog, AuditOperation, AuditStep, SequentialIdGenerator, StepIdGenerator, UNKNOWN_INVOICE,
    UuidGenerator,
};
pub use config::{
    ApplicationConfig, ConfidenceConfig, DecisionConfig, LearningConfig, LearningStrategy,
    PipelineConfig, RiskWeights,
};
pub use decision::{
    Decision, DecisionType, RiskAssessment, RiskCategory, RiskFactor, RiskLevel, RiskSeverity,
};
pub use error::{Error, Result};
pub use invoice::{
    Correction, ExtractedField, FieldError, LineItem, Money, NormalizedField, NormalizedInvoice,
    ProcessingResult, RawInvoice,
};
pub use learning::{
    HumanFeedback, LearningResult, LearningType, MemorySnapshot, MemoryUpdate,
    ProcessingOutcome, ResolutionFeedback, UpdateType,
};
pub use memory::{
    ActionType, Condition, ConditionOperator, CorrectionAction, CorrectionMemory,
    CorrectionType, FieldMapping, MappingExample, Memory, MemoryContext, MemoryKind, MemoryPattern, MemoryType,
    ResolutionMemory, ResolutionOutcome, TransformationRule, ValidationRule, VatBehavior,
    VendorMemory,
};
pub use repository::{AuditSink, MemoryStore};
