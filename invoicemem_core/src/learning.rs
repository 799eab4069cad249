//! Outcome and learning records: what happened to an invoice, what the
//! learning engine did about it, and how memory confidence evolved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::DecisionType;
use crate::invoice::Correction;
use crate::memory::{Memory, ResolutionOutcome};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Created,
    Reinforced,
    Weakened,
    Decayed,
    Archived,
}

/// Statistics of a memory at one point in time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MemorySnapshot {
    pub confidence: f64,
    pub usage_count: u64,
    pub success_rate: f64,
    pub archived: bool,
}

impl From<&Memory> for MemorySnapshot {
    fn from(memory: &Memory) -> Self {
        Self {
            confidence: memory.confidence,
            usage_count: memory.usage_count,
            success_rate: memory.success_rate,
            archived: memory.archived,
        }
    }
}

/// Authoritative log entry of one confidence change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryUpdate {
    pub memory_id: String,
    pub update_type: UpdateType,
    pub previous_state: Option<MemorySnapshot>,
    pub new_state: MemorySnapshot,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl MemoryUpdate {
    #[must_use]
    pub fn between(
        previous: &Memory,
        next: &Memory,
        update_type: UpdateType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            memory_id: next.id.clone(),
            update_type,
            previous_state: Some(MemorySnapshot::from(previous)),
            new_state: MemorySnapshot::from(next),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn created(memory: &Memory, reason: impl Into<String>) -> Self {
        Self {
            memory_id: memory.id.clone(),
            update_type: UpdateType::Created,
            previous_state: None,
            new_state: MemorySnapshot::from(memory),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningType {
    NewMemory,
    MemoryReinforcement,
    MemoryWeakening,
    PatternRecognition,
    ResolutionRecording,
}

/// Result of one learning action. Failures are data, not errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningResult {
    pub success: bool,
    pub memory_id: Option<String>,
    pub learning_type: LearningType,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LearningResult {
    #[must_use]
    pub fn succeeded(memory_id: &str, learning_type: LearningType, confidence: f64) -> Self {
        Self {
            success: true,
            memory_id: Some(memory_id.to_string()),
            learning_type,
            confidence,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(memory_id: Option<&str>, learning_type: LearningType, error: String) -> Self {
        Self {
            success: false,
            memory_id: memory_id.map(str::to_string),
            learning_type,
            confidence: 0.0,
            error: Some(error),
        }
    }
}

/// Human decision on a discrepancy, recorded as a resolution precedent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolutionFeedback {
    pub discrepancy_type: String,
    pub outcome: ResolutionOutcome,
    pub human_decision: String,
    #[serde(default)]
    pub context_factors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanFeedback {
    pub approved: bool,
    #[serde(default)]
    pub corrections: Vec<Correction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionFeedback>,
}

/// Everything the learning engine needs to know about one processed invoice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingOutcome {
    pub invoice_id: String,
    pub vendor_id: String,
    pub decision_type: DecisionType,
    #[serde(default)]
    pub applied_memory_ids: Vec<String>,
    #[serde(default)]
    pub proposed_corrections: Vec<Correction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_feedback: Option<HumanFeedback>,
}

impl ProcessingOutcome {
    /// Whether the applied memories should be reinforced (`Some(true)`),
    /// weakened (`Some(false)`) or left alone (`None`).
    ///
    /// Human feedback wins over the automatic decision.
    #[must_use]
    pub fn approval(&self) -> Option<bool> {
        match &self.human_feedback {
            Some(feedback) => Some(feedback.approved),
            None if self.decision_type == DecisionType::AutoApprove => Some(true),
            None => None,
        }
    }

    /// Corrections to learn from: human corrections when present, tagged
    /// with the vendor.
    #[must_use]
    pub fn learnable_corrections(&self) -> Vec<Correction> {
        self.human_feedback
            .as_ref()
            .map(|feedback| {
                feedback
                    .corrections
                    .iter()
                    .cloned()
                    .map(|c| {
                        if c.vendor_id.is_some() {
                            c
                        } else {
                            c.for_vendor(&self.vendor_id)
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
