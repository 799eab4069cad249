//! Tunables for each engine. Every field has a serde default so partial
//! configuration files stay valid.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Memories below this confidence are never applied.
    #[serde(default = "ApplicationConfig::default_min_confidence_threshold")]
    pub min_confidence_threshold: f64,
    /// At most this many candidates are considered, in incoming order.
    #[serde(default = "ApplicationConfig::default_max_memories")]
    pub max_memories: usize,
    /// Currency used when neither extraction nor memories provide one.
    #[serde(default = "ApplicationConfig::default_currency")]
    pub default_currency: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            min_confidence_threshold: Self::default_min_confidence_threshold(),
            max_memories: Self::default_max_memories(),
            default_currency: Self::default_currency(),
        }
    }
}

impl ApplicationConfig {
    const fn default_min_confidence_threshold() -> f64 {
        0.3
    }

    const fn default_max_memories() -> usize {
        50
    }

    fn default_currency() -> String {
        "EUR".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceConfig {
    /// Fraction of the remaining headroom `(1 - c)` gained per success.
    #[serde(default = "ConfidenceConfig::default_reinforcement_step")]
    pub reinforcement_step: f64,
    /// Fraction of the current confidence lost per failure.
    #[serde(default = "ConfidenceConfig::default_penalty_step")]
    pub penalty_step: f64,
    #[serde(default = "ConfidenceConfig::default_daily_decay_rate")]
    pub daily_decay_rate: f64,
    /// Lower bound of the multiplicative decay factor, however long a memory sits unused.
    #[serde(default = "ConfidenceConfig::default_min_decay_factor")]
    pub min_decay_factor: f64,
    /// Floor below which reinforcement penalties and decay never push.
    #[serde(default = "ConfidenceConfig::default_min_confidence")]
    pub min_confidence: f64,
    /// Ceiling reinforcement converges towards.
    #[serde(default = "ConfidenceConfig::default_max_confidence")]
    pub max_confidence: f64,
    #[serde(default = "ConfidenceConfig::default_archive_confidence")]
    pub archive_confidence: f64,
    #[serde(default = "ConfidenceConfig::default_archive_success_rate")]
    pub archive_success_rate: f64,
    /// Success rate only counts towards archival after this many uses.
    #[serde(default = "ConfidenceConfig::default_archive_min_usage")]
    pub archive_min_usage: u64,
    #[serde(default = "ConfidenceConfig::default_max_update_retries")]
    pub max_update_retries: usize,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            reinforcement_step: Self::default_reinforcement_step(),
            penalty_step: Self::default_penalty_step(),
            daily_decay_rate: Self::default_daily_decay_rate(),
            min_decay_factor: Self::default_min_decay_factor(),
            min_confidence: Self::default_min_confidence(),
            max_confidence: Self::default_max_confidence(),
            archive_confidence: Self::default_archive_confidence(),
            archive_success_rate: Self::default_archive_success_rate(),
            archive_min_usage: Self::default_archive_min_usage(),
            max_update_retries: Self::default_max_update_retries(),
        }
    }
}

impl ConfidenceConfig {
    const fn default_reinforcement_step() -> f64 {
        0.1
    }

    const fn default_penalty_step() -> f64 {
        0.15
    }

    const fn default_daily_decay_rate() -> f64 {
        0.01
    }

    const fn default_min_decay_factor() -> f64 {
        0.5
    }

    const fn default_min_confidence() -> f64 {
        0.1
    }

    const fn default_max_confidence() -> f64 {
        0.99
    }

    const fn default_archive_confidence() -> f64 {
        0.15
    }

    const fn default_archive_success_rate() -> f64 {
        0.3
    }

    const fn default_archive_min_usage() -> u64 {
        5
    }

    const fn default_max_update_retries() -> usize {
        3
    }
}

/// Category weights applied to risk factor severities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskWeights {
    pub financial: f64,
    pub compliance: f64,
    pub operational: f64,
    pub reputational: f64,
    pub technical: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            financial: 1.0,
            compliance: 0.9,
            operational: 0.6,
            reputational: 0.5,
            technical: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionConfig {
    /// Confidence needed for auto-approval; below it invoices go to review.
    #[serde(default = "DecisionConfig::default_escalation_threshold")]
    pub escalation_threshold: f64,
    /// Confidence below which invoices are rejected outright.
    #[serde(default = "DecisionConfig::default_rejection_floor")]
    pub rejection_floor: f64,
    #[serde(default = "DecisionConfig::default_high_amount")]
    pub high_amount: f64,
    #[serde(default = "DecisionConfig::default_medium_amount")]
    pub medium_amount: f64,
    #[serde(default = "DecisionConfig::default_max_corrections")]
    pub max_corrections_before_review: usize,
    #[serde(default)]
    pub risk_weights: RiskWeights,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: Self::default_escalation_threshold(),
            rejection_floor: Self::default_rejection_floor(),
            high_amount: Self::default_high_amount(),
            medium_amount: Self::default_medium_amount(),
            max_corrections_before_review: Self::default_max_corrections(),
            risk_weights: RiskWeights::default(),
        }
    }
}

impl DecisionConfig {
    const fn default_escalation_threshold() -> f64 {
        0.85
    }

    const fn default_rejection_floor() -> f64 {
        0.3
    }

    const fn default_high_amount() -> f64 {
        10_000.0
    }

    const fn default_medium_amount() -> f64 {
        1_000.0
    }

    const fn default_max_corrections() -> usize {
        3
    }
}

/// When synthesized memories are committed to the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LearningStrategy {
    /// After every outcome.
    #[default]
    Immediate,
    /// Once `batch_size` outcomes have been observed, or on flush.
    Batch,
    /// Once a pattern's derived confidence reaches `pattern_commit_confidence`.
    PatternBased,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningConfig {
    #[serde(default = "LearningConfig::default_min_occurrences")]
    pub min_occurrences: usize,
    /// Pattern confidence at exactly `min_occurrences`.
    #[serde(default = "LearningConfig::default_pattern_base_confidence")]
    pub pattern_base_confidence: f64,
    /// Confidence gained per occurrence beyond `min_occurrences`.
    #[serde(default = "LearningConfig::default_pattern_confidence_step")]
    pub pattern_confidence_step: f64,
    #[serde(default = "LearningConfig::default_pattern_confidence_cap")]
    pub pattern_confidence_cap: f64,
    #[serde(default = "LearningConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "LearningConfig::default_pattern_commit_confidence")]
    pub pattern_commit_confidence: f64,
    /// Confidence given to memories recorded from explicit human resolutions.
    #[serde(default = "LearningConfig::default_resolution_confidence")]
    pub resolution_confidence: f64,
    #[serde(default)]
    pub strategy: LearningStrategy,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_occurrences: Self::default_min_occurrences(),
            pattern_base_confidence: Self::default_pattern_base_confidence(),
            pattern_confidence_step: Self::default_pattern_confidence_step(),
            pattern_confidence_cap: Self::default_pattern_confidence_cap(),
            batch_size: Self::default_batch_size(),
            pattern_commit_confidence: Self::default_pattern_commit_confidence(),
            resolution_confidence: Self::default_resolution_confidence(),
            strategy: LearningStrategy::default(),
        }
    }
}

impl LearningConfig {
    const fn default_min_occurrences() -> usize {
        3
    }

    const fn default_pattern_base_confidence() -> f64 {
        0.6
    }

    const fn default_pattern_confidence_step() -> f64 {
        0.05
    }

    const fn default_pattern_confidence_cap() -> f64 {
        0.9
    }

    const fn default_batch_size() -> usize {
        10
    }

    const fn default_pattern_commit_confidence() -> f64 {
        0.7
    }

    const fn default_resolution_confidence() -> f64 {
        0.7
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Upper bound for each external call a stage makes.
    #[serde(default = "PipelineConfig::default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: Self::default_stage_timeout_ms(),
        }
    }
}

impl PipelineConfig {
    const fn default_stage_timeout_ms() -> u64 {
        5_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config: DecisionConfig =
            serde_json::from_str(r#"{ "rejection_floor": 0.2 }"#).unwrap();
        assert!((config.rejection_floor - 0.2).abs() < f64::EPSILON);
        assert!((config.escalation_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.risk_weights, RiskWeights::default());
    }

    #[test]
    fn strategy_parses_snake_case() {
        let config: LearningConfig =
            serde_json::from_str(r#"{ "strategy": "pattern_based" }"#).unwrap();
        assert_eq!(config.strategy, LearningStrategy::PatternBased);
        assert_eq!(config.min_occurrences, 3);
    }
}
