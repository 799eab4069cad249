//! Audit steps and the session-scoped log engines append them to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Key under which steps without an identifiable invoice are filed.
pub const UNKNOWN_INVOICE: &str = "unknown";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    MemoryRecall,
    MemoryApplication,
    DecisionMaking,
    MemoryLearning,
    ConfidenceCalculation,
    FieldNormalization,
    Validation,
    ErrorHandling,
}

impl AuditOperation {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MemoryRecall => "memory_recall",
            Self::MemoryApplication => "memory_application",
            Self::DecisionMaking => "decision_making",
            Self::MemoryLearning => "memory_learning",
            Self::ConfidenceCalculation => "confidence_calculation",
            Self::FieldNormalization => "field_normalization",
            Self::Validation => "validation",
            Self::ErrorHandling => "error_handling",
        }
    }
}

impl std::fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AuditOperation {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory_recall" => Ok(Self::MemoryRecall),
            "memory_application" => Ok(Self::MemoryApplication),
            "decision_making" => Ok(Self::DecisionMaking),
            "memory_learning" => Ok(Self::MemoryLearning),
            "confidence_calculation" => Ok(Self::ConfidenceCalculation),
            "field_normalization" => Ok(Self::FieldNormalization),
            "validation" => Ok(Self::Validation),
            "error_handling" => Ok(Self::ErrorHandling),
            _ => Err(crate::Error::Store(format!("unknown audit operation: {s}"))),
        }
    }
}

/// Timestamped record of one engine operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditStep {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    pub description: String,
    pub input: Map<String, Value>,
    pub output: Map<String, Value>,
    pub actor: String,
    /// Milliseconds spent in the operation.
    pub duration: u64,
}

impl AuditStep {
    /// Invoice id heuristically taken from the step payloads.
    ///
    /// Looks at `input.invoiceId`, `input.invoice.id`, `output.invoiceId`,
    /// `output.invoice.id` in that order.
    #[must_use]
    pub fn invoice_id(&self) -> Option<&str> {
        fn lookup(map: &Map<String, Value>) -> Option<&str> {
            map.get("invoiceId")
                .and_then(Value::as_str)
                .or_else(|| map.get("invoice")?.get("id")?.as_str())
        }
        lookup(&self.input).or_else(|| lookup(&self.output))
    }

    /// Storage key for this step: its invoice id or [`UNKNOWN_INVOICE`].
    #[must_use]
    pub fn trail_key(&self) -> &str {
        self.invoice_id().unwrap_or(UNKNOWN_INVOICE)
    }
}

pub trait StepIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl StepIdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

/// Monotonic counter ids (`<prefix>-000001`), deterministic under test.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: AtomicU64::new(0),
        }
    }
}

impl StepIdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n:06}", self.prefix)
    }
}

/// Append-only audit buffer owned by one engine instance.
///
/// Timestamps never go backwards: a step recorded after a clock step-back
/// reuses the previous timestamp.
pub struct AuditLog {
    actor: String,
    ids: Arc<dyn StepIdGenerator>,
    steps: Vec<AuditStep>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl AuditLog {
    #[must_use]
    pub fn new(actor: &str, ids: Arc<dyn StepIdGenerator>) -> Self {
        Self {
            actor: actor.to_string(),
            ids,
            steps: Vec::new(),
            last_timestamp: None,
        }
    }

    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Append a step and return a copy of it.
    pub fn record(
        &mut self,
        operation: AuditOperation,
        description: impl Into<String>,
        input: Map<String, Value>,
        output: Map<String, Value>,
        elapsed: Duration,
    ) -> AuditStep {
        let now = Utc::now();
        let timestamp = self.last_timestamp.map_or(now, |last| last.max(now));
        self.last_timestamp = Some(timestamp);

        let step = AuditStep {
            id: self.ids.next_id(),
            timestamp,
            operation,
            description: description.into(),
            input,
            output,
            actor: self.actor.clone(),
            duration: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        };
        self.steps.push(step.clone());
        step
    }

    #[must_use]
    pub fn steps(&self) -> &[AuditStep] {
        &self.steps
    }

    /// Drop every buffered step; called at pipeline-run boundaries.
    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Hand the buffered steps over and leave the log empty.
    pub fn take(&mut self) -> Vec<AuditStep> {
        std::mem::take(&mut self.steps)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("actor", &self.actor)
            .field("steps", &self.steps.len())
            .finish_non_exhaustive()
    }
}

/// Build a string-keyed payload map from `(key, value)` pairs.
#[macro_export]
macro_rules! payload {
    ($($key:literal => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = ::serde_json::Map::new();
        $( map.insert($key.to_string(), ::serde_json::json!($value)); )*
        map
    }};
}
