use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    AutoApprove,
    HumanReviewRequired,
    EscalateToExpert,
    RejectInvoice,
    RequestAdditionalInfo,
}

impl DecisionType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AutoApprove => "auto_approve",
            Self::HumanReviewRequired => "human_review_required",
            Self::EscalateToExpert => "escalate_to_expert",
            Self::RejectInvoice => "reject_invoice",
            Self::RequestAdditionalInfo => "request_additional_info",
        }
    }

    /// Every decision except auto-approval routes the invoice to a person.
    #[must_use]
    pub const fn requires_human_review(&self) -> bool {
        !matches!(self, Self::AutoApprove)
    }
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Financial,
    Compliance,
    Operational,
    Reputational,
    Technical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskSeverity {
    /// Contribution of one factor of this severity before category weighting.
    #[must_use]
    pub const fn score(&self) -> f64 {
        match self {
            Self::Low => 0.1,
            Self::Medium => 0.25,
            Self::High => 0.5,
            Self::Critical => 0.8,
        }
    }
}

/// Ordinal aggregate risk. `Unknown` means there was not enough data to assess.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    VeryHigh,
    Unknown,
}

impl RiskLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "very_high",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub const fn is_acceptable(&self) -> bool {
        matches!(self, Self::Low | Self::Medium)
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskFactor {
    pub category: RiskCategory,
    pub severity: RiskSeverity,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub risk_factors: Vec<RiskFactor>,
    pub mitigations: Vec<String>,
}

impl RiskAssessment {
    #[must_use]
    pub fn high_severity_count(&self) -> usize {
        self.risk_factors
            .iter()
            .filter(|f| f.severity >= RiskSeverity::High)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub decision_type: DecisionType,
    pub confidence: f64,
    pub reasoning: String,
    pub recommended_actions: Vec<String>,
    pub risk_assessment: RiskAssessment,
}

impl Decision {
    #[must_use]
    pub const fn requires_human_review(&self) -> bool {
        self.decision_type.requires_human_review()
    }
}
