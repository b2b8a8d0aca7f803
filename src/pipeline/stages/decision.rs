//! Decision Stage: composite confidence and the terminal verdict.
//!
//! A pure function of the final state. It never calls out and never re-runs
//! an upstream stage.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::DecisionPolicy;
use crate::error::StageError;
use crate::pipeline::state::PipelineState;
use crate::pipeline::types::{
    Classification, ConfidenceBreakdown, Decision, QualityScores, ReviewPriority, Severity,
    StageFailure, StageKind, Urgency, Verdict,
};

pub struct DecisionStage {
    policy: DecisionPolicy,
    max_retries: u32,
}

impl DecisionStage {
    pub fn new(policy: DecisionPolicy, max_retries: u32) -> Self {
        Self {
            policy,
            max_retries,
        }
    }

    fn urgency_factor(&self, urgency: Urgency) -> f64 {
        let f = &self.policy.urgency_factors;
        match urgency {
            Urgency::High => f.high,
            Urgency::Medium => f.medium,
            Urgency::Low => f.low,
        }
    }

    /// Composite confidence and every factor behind it.
    pub fn composite(
        &self,
        classification: Option<&Classification>,
        quality: Option<&QualityScores>,
        profile_found: bool,
        retry_count: u32,
    ) -> (f64, ConfidenceBreakdown) {
        let cls = classification.map_or(0.0, |c| c.confidence);
        let overall = quality.map_or(0.0, |q| q.overall);
        let weighted_base =
            self.policy.classification_weight * cls + self.policy.quality_weight * overall;
        let retry_penalty = self.policy.retry_penalty * f64::from(retry_count);
        let missing_profile_penalty = if profile_found {
            0.0
        } else {
            self.policy.missing_profile_penalty
        };
        let urgency_factor = classification.map_or(1.0, |c| self.urgency_factor(c.urgency));

        let confidence = ((weighted_base - retry_penalty - missing_profile_penalty)
            * urgency_factor)
            .clamp(0.0, 1.0);

        (
            confidence,
            ConfidenceBreakdown {
                classification_confidence: cls,
                quality_overall: overall,
                weighted_base,
                retry_penalty,
                missing_profile_penalty,
                urgency_factor,
                quality_passed: quality.is_some_and(|q| q.passed),
                forced_by_failure: false,
            },
        )
    }

    /// Decide. Requires a final quality pass or a recorded failure.
    pub fn decide(&self, state: &PipelineState, now: DateTime<Utc>) -> Result<Decision, StageError> {
        let stage = StageKind::Decision;
        if state.is_terminal() {
            return Err(StageError::sequence(stage, "decision already made"));
        }
        if state.quality().is_none() && state.failure().is_none() {
            return Err(StageError::sequence(
                stage,
                "no quality result and no recorded failure",
            ));
        }

        let classification = state.classification();
        let quality = state.quality();
        let profile_found = state.company_profile().is_some_and(|p| p.is_found());
        let (confidence, mut breakdown) =
            self.composite(classification, quality, profile_found, state.retry_count());

        if let Some(failure) = state.failure() {
            breakdown.forced_by_failure = true;
            return Ok(self.escalate_for_failure(failure, confidence, breakdown, now));
        }

        if state.retry_count() > self.max_retries {
            breakdown.forced_by_failure = true;
            return Ok(Decision {
                verdict: Verdict::Escalate,
                confidence,
                rationale: format!(
                    "Retry count {} exceeds the limit of {}; escalating.",
                    state.retry_count(),
                    self.max_retries
                ),
                priority: ReviewPriority::High,
                estimated_review_minutes: review_minutes(Verdict::Escalate),
                breakdown,
                decided_at: now,
            });
        }

        let passed = breakdown.quality_passed;
        let overall = breakdown.quality_overall;
        let verdict = if confidence >= self.policy.auto_threshold && passed {
            Verdict::Autonomous
        } else if confidence >= self.policy.review_threshold
            || (!passed && overall >= self.policy.recoverable_quality_floor)
        {
            Verdict::Review
        } else {
            Verdict::Escalate
        };

        debug!(
            request_id = %state.request_id(),
            verdict = %verdict,
            confidence,
            passed,
            "Composite confidence computed"
        );

        Ok(Decision {
            verdict,
            confidence,
            rationale: rationale(verdict, confidence, state),
            priority: priority(verdict, classification, quality),
            estimated_review_minutes: review_minutes(verdict),
            breakdown,
            decided_at: now,
        })
    }

    fn escalate_for_failure(
        &self,
        failure: &StageFailure,
        confidence: f64,
        breakdown: ConfidenceBreakdown,
        now: DateTime<Utc>,
    ) -> Decision {
        Decision {
            verdict: Verdict::Escalate,
            confidence,
            rationale: format!(
                "Pipeline stopped: {} stage failed: {}. Requires manual handling.",
                failure.stage, failure.reason
            ),
            priority: ReviewPriority::High,
            estimated_review_minutes: review_minutes(Verdict::Escalate),
            breakdown,
            decided_at: now,
        }
    }
}

fn review_minutes(verdict: Verdict) -> u32 {
    match verdict {
        Verdict::Autonomous => 0,
        Verdict::Review => 3,
        Verdict::Escalate => 15,
    }
}

fn priority(
    verdict: Verdict,
    classification: Option<&Classification>,
    quality: Option<&QualityScores>,
) -> ReviewPriority {
    match verdict {
        Verdict::Autonomous => ReviewPriority::Low,
        Verdict::Escalate => ReviewPriority::High,
        Verdict::Review => {
            if classification.is_some_and(|c| c.urgency == Urgency::High) {
                return ReviewPriority::High;
            }
            match quality.and_then(|q| q.worst_severity()) {
                Some(Severity::High) => ReviewPriority::High,
                Some(Severity::Medium) => ReviewPriority::Medium,
                _ => ReviewPriority::Low,
            }
        }
    }
}

fn rationale(verdict: Verdict, confidence: f64, state: &PipelineState) -> String {
    let (intent, urgency) = state
        .classification()
        .map(|c| (c.intent.label(), c.urgency.label()))
        .unwrap_or(("unknown", "unknown"));
    let issues = state.quality().map_or(0, |q| q.issues.len());
    let missed = state.quality().map_or(0, |q| q.requirements_missed.len());
    let retries = state.retry_count();

    match verdict {
        Verdict::Autonomous => format!(
            "High confidence ({confidence:.2}) and the quality gate passed. \
             Intent: {intent}, urgency: {urgency}. Safe to send automatically."
        ),
        Verdict::Review => {
            let gate = if state.quality().is_some_and(|q| q.degraded) {
                "reviewer unavailable, rule-based check only".to_string()
            } else if state.quality().is_some_and(|q| q.passed) {
                "quality gate passed".to_string()
            } else {
                format!("quality gate failed after {retries} retries")
            };
            format!(
                "Moderate confidence ({confidence:.2}); {gate}, {issues} issues found. \
                 Intent: {intent}, urgency: {urgency}. Quick review recommended before sending."
            )
        }
        Verdict::Escalate => format!(
            "Low confidence ({confidence:.2}). {issues} issues found, {missed} requirements \
             missed after {retries} retries. Intent: {intent}, urgency: {urgency}. \
             Requires manual handling."
        ),
    }
}
