//! Quality Gate Stage.
//!
//! The reviewer model only supplies per-dimension scores and comments. The
//! weighted `overall` and the pass/fail call are computed here, so the same
//! scores and weights always give the same verdict.
//!
//! When the reviewer cannot be reached, a rule-based check (length bounds,
//! subject line, requirement keyword coverage) stands in. Its scores are
//! marked degraded and never pass the gate.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{QualityConfig, RubricWeights};
use crate::error::StageError;
use crate::llm::{AgentRole, Constraints, ReasoningPort, StructuredPrompt};
use crate::pipeline::stages::{
    Stage, StageResult, bullet_list, email_section, parse_output, reason, require,
};
use crate::pipeline::state::{PipelinePhase, PipelineState};
use crate::pipeline::types::{
    DraftResponse, QualityIssue, QualityScores, RubricScores, Severity, StageKind, StageOutput,
};

const CONSTRAINTS: Constraints = Constraints::new(0.0, 768);

const MIN_WORDS: usize = 50;
const MAX_WORDS: usize = 500;

const INSTRUCTIONS: &str = "You are a quality assurance specialist reviewing email responses.\n\n\
Score the draft on each dimension from 0.0 to 1.0:\n\
- factual_grounding: claims are supported by the company profile or knowledge provided; nothing invented\n\
- completeness: every customer requirement is addressed\n\
- tone: professional, helpful, personalized\n\
- clarity: concise, correct, with a clear call to action\n\n\
List concrete issues with severity (low/medium/high) and a suggestion, and the \
requirements the draft missed. issues and requirements_missed must be lists, \
empty when there is nothing to report. feedback is one short paragraph telling \
the writer what to change.\n\
Format: {\"scores\": {\"factual_grounding\": 0.0, \"completeness\": 0.0, \"tone\": 0.0, \
\"clarity\": 0.0}, \"issues\": [{\"severity\": \"...\", \"issue\": \"...\", \
\"suggestion\": \"...\"}], \"requirements_missed\": [], \"feedback\": \"...\"}";

#[derive(Debug, Deserialize)]
struct ReviewScores {
    factual_grounding: f64,
    completeness: f64,
    tone: f64,
    clarity: f64,
}

#[derive(Debug, Deserialize)]
struct ReviewIssue {
    #[serde(default)]
    severity: String,
    #[serde(default)]
    issue: String,
    #[serde(default)]
    suggestion: String,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    scores: ReviewScores,
    #[serde(default)]
    issues: Option<Vec<ReviewIssue>>,
    #[serde(default)]
    requirements_missed: Option<Vec<String>>,
    #[serde(default)]
    feedback: String,
}

/// Weighted sum of the rubric scores.
pub fn score_overall(scores: &RubricScores, weights: &RubricWeights) -> f64 {
    let overall = scores.factual_grounding * weights.factual_grounding
        + scores.completeness * weights.completeness
        + scores.tone * weights.tone
        + scores.clarity * weights.clarity;
    overall.clamp(0.0, 1.0)
}

/// What the orchestrator does after a quality pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    /// Only the rule-based check ran; re-drafting cannot change that.
    Degraded,
    /// Failed with retry budget left: re-run the writer.
    Retry,
    /// Failed with no budget left: decide on the last draft.
    Exhausted,
}

pub fn gate_outcome(scores: &QualityScores, retry_count: u32, max_retries: u32) -> GateOutcome {
    if scores.degraded {
        GateOutcome::Degraded
    } else if scores.passed {
        GateOutcome::Pass
    } else if retry_count < max_retries {
        GateOutcome::Retry
    } else {
        GateOutcome::Exhausted
    }
}

fn unit(v: f64) -> f64 {
    if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }
}

pub struct QualityGateStage {
    port: Arc<dyn ReasoningPort>,
    config: QualityConfig,
}

impl QualityGateStage {
    pub fn new(port: Arc<dyn ReasoningPort>, config: QualityConfig) -> Self {
        Self { port, config }
    }

    /// Turn raw rubric scores into a gate result.
    pub fn evaluate(
        &self,
        scores: RubricScores,
        issues: Vec<QualityIssue>,
        requirements_missed: Vec<String>,
        feedback: String,
        attempt: u32,
    ) -> QualityScores {
        let overall = score_overall(&scores, &self.config.weights);
        QualityScores {
            scores,
            overall,
            passed: overall >= self.config.threshold,
            issues,
            requirements_addressed: Vec::new(),
            requirements_missed,
            feedback,
            attempt,
            degraded: false,
        }
    }
}

/// A requirement counts as covered when any of its words longer than three
/// characters appears in the text.
fn covers(text_lower: &str, requirement: &str) -> bool {
    requirement
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.chars().count() > 3)
        .any(|w| text_lower.contains(w))
}

/// Rule-based review of a draft.
pub fn rule_based_review(
    draft: &DraftResponse,
    requirements: &[String],
    reason: &str,
) -> QualityScores {
    let mut issues = Vec::new();

    let words = draft.body.split_whitespace().count();
    if words > MAX_WORDS {
        issues.push(QualityIssue {
            severity: Severity::Medium,
            issue: format!("Response is too long (>{MAX_WORDS} words)"),
            suggestion: "Condense the content to be more concise".into(),
        });
    } else if words < MIN_WORDS {
        issues.push(QualityIssue {
            severity: Severity::High,
            issue: format!("Response is too short (<{MIN_WORDS} words)"),
            suggestion: "Provide more detail and context".into(),
        });
    }

    if draft.subject.trim().is_empty() {
        issues.push(QualityIssue {
            severity: Severity::High,
            issue: "Missing email subject".into(),
            suggestion: "Add a clear subject line".into(),
        });
    }

    let body = draft.body.to_lowercase();
    let (addressed, missed): (Vec<String>, Vec<String>) =
        requirements.iter().cloned().partition(|r| covers(&body, r));
    if !missed.is_empty() {
        issues.push(QualityIssue {
            severity: Severity::High,
            issue: format!(
                "Missing requirements: {}",
                missed.iter().take(2).cloned().collect::<Vec<_>>().join(", ")
            ),
            suggestion: "Address all customer requirements explicitly".into(),
        });
    }

    let high = issues.iter().filter(|i| i.severity == Severity::High).count();
    let medium = issues.iter().filter(|i| i.severity == Severity::Medium).count();
    let confidence = match (high, medium) {
        (h, _) if h > 0 => 0.5,
        (_, m) if m > 1 => 0.7,
        (_, 1) => 0.8,
        _ => 0.9,
    };

    QualityScores {
        scores: RubricScores {
            factual_grounding: confidence,
            completeness: confidence,
            tone: confidence,
            clarity: confidence,
        },
        overall: confidence,
        passed: false,
        feedback: format!(
            "Reviewer unavailable ({reason}). Rule-based check found {} issues.",
            issues.len()
        ),
        issues,
        requirements_addressed: addressed,
        requirements_missed: missed,
        attempt: draft.attempt,
        degraded: true,
    }
}

#[async_trait]
impl Stage for QualityGateStage {
    type Output = QualityScores;

    fn kind(&self) -> StageKind {
        StageKind::QualityGate
    }

    async fn run(&self, state: &PipelineState) -> StageResult<QualityScores> {
        let stage = self.kind();
        if state.phase() != PipelinePhase::Drafted {
            return Err(StageError::sequence(
                stage,
                format!("quality gate invoked in phase {}", state.phase()),
            )
            .into());
        }
        let draft = require(stage, state.draft(), "draft")?;
        let classification = require(stage, state.classification(), "classification")?;

        let mut grounding = String::new();
        if let Some(facts) = state.company_profile().and_then(|p| p.facts()) {
            grounding.push_str(&format!("Company: {}\n", facts.name));
            grounding.push_str(&bullet_list(&facts.key_insights));
        }
        if let Some(context) = state.retrieved_context() {
            for s in &context.snippets {
                grounding.push_str(&format!("\n- {}: {}", s.title, s.content));
            }
        }

        let prompt = StructuredPrompt::new(INSTRUCTIONS)
            .section("Original email", email_section(state.raw_email()))
            .section(
                "Customer requirements",
                bullet_list(&classification.key_requirements),
            )
            .section("Available facts", grounding)
            .section(
                "Draft",
                format!("Subject: {}\n\n{}", draft.subject, draft.body),
            );

        let out = reason(
            self.port.as_ref(),
            stage,
            AgentRole::QualityReviewer,
            &prompt,
            &CONSTRAINTS,
        )
        .await?;
        let review: ReviewResponse = parse_output(stage, out.output, &out.cost)?;

        let scores = RubricScores {
            factual_grounding: unit(review.scores.factual_grounding),
            completeness: unit(review.scores.completeness),
            tone: unit(review.scores.tone),
            clarity: unit(review.scores.clarity),
        };
        let issues = review
            .issues
            .unwrap_or_default()
            .into_iter()
            .filter(|i| !i.issue.trim().is_empty())
            .map(|i| QualityIssue {
                severity: Severity::parse_lenient(&i.severity),
                issue: i.issue,
                suggestion: i.suggestion,
            })
            .collect();

        let missed = review.requirements_missed.unwrap_or_default();
        let mut value = self.evaluate(scores, issues, missed, review.feedback, draft.attempt);
        value.requirements_addressed = classification
            .key_requirements
            .iter()
            .filter(|r| !value.requirements_missed.contains(r))
            .cloned()
            .collect();

        Ok(StageOutput {
            value,
            cost: out.cost,
        })
    }

    fn fallback(&self, state: &PipelineState, reason: &str) -> Option<QualityScores> {
        let draft = state.draft()?;
        let requirements = state
            .classification()
            .map(|c| c.key_requirements.as_slice())
            .unwrap_or_default();
        Some(rule_based_review(draft, requirements, reason))
    }
}
