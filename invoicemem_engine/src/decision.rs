//! Routing of a normalized invoice to exactly one terminal decision.

use invoicemem_core::{
    AuditLog, AuditOperation, AuditStep, Decision, DecisionConfig, DecisionType,
    NormalizedInvoice, RiskAssessment, RiskCategory, RiskFactor, RiskLevel, RiskSeverity,
    StepIdGenerator, UuidGenerator, payload,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::application::ApplicationResult;

const ACTOR: &str = "decision_engine";
const LOW_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub severity: IssueSeverity,
    pub message: String,
}

impl ValidationIssue {
    fn critical(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            severity: IssueSeverity::Critical,
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            severity: IssueSeverity::Warning,
            message: message.into(),
        }
    }
}

/// Structural checks on the built invoice.
#[must_use]
pub fn validate_invoice(invoice: &NormalizedInvoice) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if invoice.invoice_number.trim().is_empty() {
        issues.push(ValidationIssue::critical("invoiceNumber", "invoice number is missing"));
    }
    let total = invoice.total_amount.amount;
    if total < 0.0 {
        issues.push(ValidationIssue::critical("totalAmount", format!("negative total {total:.2}")));
    } else if invoice.total_amount.is_zero() {
        issues.push(ValidationIssue::warning("totalAmount", "total amount is zero"));
    }
    if let Some(vat) = &invoice.vat_amount {
        if total >= 0.0 && vat.amount > total {
            issues.push(ValidationIssue::warning(
                "vatAmount",
                format!("VAT {:.2} exceeds total {total:.2}", vat.amount),
            ));
        }
    }
    if let (Some(issued), Some(due)) = (invoice.invoice_date, invoice.due_date) {
        if due < issued {
            issues.push(ValidationIssue::warning(
                "dueDate",
                format!("due date {due} precedes invoice date {issued}"),
            ));
        }
    }
    issues
}

/// Everything the decision rules look at.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub invoice: &'a NormalizedInvoice,
    pub confidence: f64,
    pub proposed_corrections: usize,
    pub applied_memories: usize,
    pub failed_memories: usize,
    pub validation_failures: usize,
}

impl<'a> From<&'a ApplicationResult> for DecisionContext<'a> {
    fn from(result: &'a ApplicationResult) -> Self {
        Self {
            invoice: &result.normalized_invoice,
            confidence: result.application_confidence,
            proposed_corrections: result.proposed_corrections.len(),
            applied_memories: result.applied_memories.len(),
            failed_memories: result.failed_memories.len(),
            validation_failures: result.validation_failures(),
        }
    }
}

pub struct DecisionEngine {
    config: DecisionConfig,
    audit: AuditLog,
}

impl DecisionEngine {
    #[must_use]
    pub fn new(config: DecisionConfig) -> Self {
        Self::with_id_generator(config, Arc::new(UuidGenerator))
    }

    #[must_use]
    pub fn with_id_generator(config: DecisionConfig, ids: Arc<dyn StepIdGenerator>) -> Self {
        Self {
            config,
            audit: AuditLog::new(ACTOR, ids),
        }
    }

    #[must_use]
    pub fn audit_steps(&self) -> &[AuditStep] {
        self.audit.steps()
    }

    pub fn clear_audit_steps(&mut self) {
        self.audit.clear();
    }

    pub fn take_audit_steps(&mut self) -> Vec<AuditStep> {
        self.audit.take()
    }

    /// Evaluate one invoice. The first matching rule decides:
    ///
    /// 1. critical validation issue: reject
    /// 2. confidence under the rejection floor: reject
    /// 3. very high risk or several high-severity factors: escalate
    /// 4. confidence under the escalation threshold: human review
    /// 5. acceptable risk: auto-approve
    /// 6. risk could not be assessed: request more information
    /// 7. anything else: human review
    #[tracing::instrument(skip(self, ctx), fields(invoice_id = %ctx.invoice.id))]
    pub fn evaluate(&mut self, ctx: &DecisionContext<'_>) -> Decision {
        let started = Instant::now();
        let issues = validate_invoice(ctx.invoice);
        let risk = self.assess_risk(ctx, &issues);
        let critical: Vec<&ValidationIssue> = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Critical)
            .collect();
        let confidence = ctx.confidence;

        let (decision_type, reasoning) = if !critical.is_empty() {
            let messages: Vec<&str> = critical.iter().map(|i| i.message.as_str()).collect();
            (
                DecisionType::RejectInvoice,
                format!("Critical validation issues: {}", messages.join("; ")),
            )
        } else if confidence < self.config.rejection_floor {
            (
                DecisionType::RejectInvoice,
                format!(
                    "Confidence {confidence:.2} is below the rejection floor {:.2}",
                    self.config.rejection_floor
                ),
            )
        } else if risk.risk_level == RiskLevel::VeryHigh || risk.high_severity_count() >= 2 {
            (
                DecisionType::EscalateToExpert,
                format!(
                    "Risk level {} with {} high-severity factors needs expert review",
                    risk.risk_level,
                    risk.high_severity_count()
                ),
            )
        } else if confidence < self.config.escalation_threshold {
            (
                DecisionType::HumanReviewRequired,
                format!(
                    "Confidence {confidence:.2} is below the auto-approval threshold {:.2}",
                    self.config.escalation_threshold
                ),
            )
        } else if risk.risk_level.is_acceptable() {
            (
                DecisionType::AutoApprove,
                format!(
                    "Confidence {confidence:.2} with {} risk allows auto-approval",
                    risk.risk_level
                ),
            )
        } else if risk.risk_level == RiskLevel::Unknown {
            (
                DecisionType::RequestAdditionalInfo,
                "Not enough data to assess risk".to_string(),
            )
        } else {
            (
                DecisionType::HumanReviewRequired,
                format!("Risk level {} requires review", risk.risk_level),
            )
        };

        let decision = Decision {
            decision_type,
            confidence,
            reasoning,
            recommended_actions: recommended_actions(decision_type, &issues),
            risk_assessment: risk,
        };

        self.audit.record(
            AuditOperation::DecisionMaking,
            format!("Decided {} for invoice {}", decision_type, ctx.invoice.id),
            payload! {
                "invoiceId" => ctx.invoice.id,
                "confidence" => confidence,
                "amount" => ctx.invoice.total_amount.amount,
            },
            payload! {
                "decisionType" => decision_type.as_str(),
                "requiresHumanReview" => decision.requires_human_review(),
                "riskLevel" => decision.risk_assessment.risk_level.as_str(),
            },
            started.elapsed(),
        );
        info!(
            invoice_id = %ctx.invoice.id,
            decision = %decision_type,
            risk = %decision.risk_assessment.risk_level,
            "Decision made"
        );

        decision
    }

    /// Weighted aggregation of risk factors into an ordinal level.
    #[must_use]
    pub fn assess_risk(&self, ctx: &DecisionContext<'_>, issues: &[ValidationIssue]) -> RiskAssessment {
        let mut factors = Vec::new();
        let amount = ctx.invoice.total_amount.amount.abs();

        if amount >= self.config.high_amount {
            factors.push(factor(RiskCategory::Financial, RiskSeverity::High, format!("amount {amount:.2} above {:.2}", self.config.high_amount)));
        } else if amount >= self.config.medium_amount {
            factors.push(factor(RiskCategory::Financial, RiskSeverity::Medium, format!("amount {amount:.2} above {:.2}", self.config.medium_amount)));
        }

        for issue in issues {
            let severity = match issue.severity {
                IssueSeverity::Critical => RiskSeverity::Critical,
                IssueSeverity::Warning => RiskSeverity::Low,
            };
            factors.push(factor(RiskCategory::Compliance, severity, issue.message.clone()));
        }
        if ctx.validation_failures > 0 {
            factors.push(factor(
                RiskCategory::Compliance,
                RiskSeverity::High,
                format!("{} failed validations", ctx.validation_failures),
            ));
        }

        if ctx.proposed_corrections >= self.config.max_corrections_before_review {
            factors.push(factor(
                RiskCategory::Operational,
                RiskSeverity::Medium,
                format!("{} corrections proposed", ctx.proposed_corrections),
            ));
        }
        if ctx.failed_memories > 0 {
            factors.push(factor(
                RiskCategory::Operational,
                RiskSeverity::Medium,
                format!("{} memories failed to apply", ctx.failed_memories),
            ));
        }

        if ctx.applied_memories == 0 {
            factors.push(factor(RiskCategory::Reputational, RiskSeverity::Low, "no learned history for vendor".to_string()));
        }

        if ctx.confidence < LOW_CONFIDENCE {
            factors.push(factor(
                RiskCategory::Technical,
                RiskSeverity::Medium,
                format!("low application confidence {:.2}", ctx.confidence),
            ));
        }

        let insufficient = ctx.applied_memories == 0
            && ctx.invoice.total_amount.is_zero()
            && ctx.invoice.line_items_total().abs() < f64::EPSILON;
        let risk_score: f64 = factors
            .iter()
            .map(|f| self.weight(f.category) * f.severity.score())
            .sum();
        let risk_level = if insufficient {
            RiskLevel::Unknown
        } else if risk_score < 0.25 {
            RiskLevel::Low
        } else if risk_score < 0.5 {
            RiskLevel::Medium
        } else if risk_score < 0.8 {
            RiskLevel::High
        } else {
            RiskLevel::VeryHigh
        };

        let mut mitigations: Vec<String> = Vec::new();
        for f in &factors {
            let m = mitigation(f.category);
            if !mitigations.iter().any(|x| x == m) {
                mitigations.push(m.to_string());
            }
        }

        RiskAssessment {
            risk_level,
            risk_score,
            risk_factors: factors,
            mitigations,
        }
    }

    const fn weight(&self, category: RiskCategory) -> f64 {
        let w = &self.config.risk_weights;
        match category {
            RiskCategory::Financial => w.financial,
            RiskCategory::Compliance => w.compliance,
            RiskCategory::Operational => w.operational,
            RiskCategory::Reputational => w.reputational,
            RiskCategory::Technical => w.technical,
        }
    }
}

fn factor(category: RiskCategory, severity: RiskSeverity, description: String) -> RiskFactor {
    RiskFactor {
        category,
        severity,
        description,
    }
}

const fn mitigation(category: RiskCategory) -> &'static str {
    match category {
        RiskCategory::Financial => "Require a second approver for the amount",
        RiskCategory::Compliance => "Check the flagged fields against the source document",
        RiskCategory::Operational => "Review the proposed corrections before posting",
        RiskCategory::Reputational => "Confirm vendor details with the vendor master data",
        RiskCategory::Technical => "Verify extracted fields manually",
    }
}

fn recommended_actions(decision: DecisionType, issues: &[ValidationIssue]) -> Vec<String> {
    let mut actions: Vec<String> = match decision {
        DecisionType::AutoApprove => vec!["Post invoice for payment".to_string()],
        DecisionType::HumanReviewRequired => vec!["Review normalized fields and corrections".to_string()],
        DecisionType::EscalateToExpert => vec!["Forward to an accounts payable specialist".to_string()],
        DecisionType::RejectInvoice => vec!["Return invoice to vendor".to_string()],
        DecisionType::RequestAdditionalInfo => vec!["Request missing amounts from vendor".to_string()],
    };
    actions.extend(issues.iter().map(|i| format!("Fix {}: {}", i.field, i.message)));
    actions
}
