//! Pipeline state and its phase machine.
//!
//! `PipelineState` is owned by exactly one invocation. Stages never mutate it
//! directly: they read it and hand back a value, and the orchestrator commits
//! that value through one of the `commit_*` methods below. Every commit checks
//! the transition table, so a field can be set only once, in order, and
//! nothing moves after `Decided`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StageError;
use crate::llm::TokenCost;
use crate::observability::TraceEvent;
use crate::pipeline::types::{
    Classification, CompanyProfile, Decision, DraftResponse, QualityScores, RawEmail,
    RetrievedContext, StageFailure, StageKind,
};

// ── Phases ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelinePhase {
    Ingested,
    Classified,
    Researched,
    Retrieved,
    Drafted,
    QualityChecked,
    Decided,
}

impl PipelinePhase {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ingested => "INGESTED",
            Self::Classified => "CLASSIFIED",
            Self::Researched => "RESEARCHED",
            Self::Retrieved => "RETRIEVED",
            Self::Drafted => "DRAFTED",
            Self::QualityChecked => "QUALITY_CHECKED",
            Self::Decided => "DECIDED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Decided)
    }
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Every edge of the happy path. `QualityChecked -> Drafted` is the retry
/// edge; it is only taken after `begin_retry` has counted it.
pub const TRANSITIONS: &[(PipelinePhase, PipelinePhase)] = &[
    (PipelinePhase::Ingested, PipelinePhase::Classified),
    (PipelinePhase::Classified, PipelinePhase::Researched),
    (PipelinePhase::Researched, PipelinePhase::Retrieved),
    (PipelinePhase::Retrieved, PipelinePhase::Drafted),
    (PipelinePhase::Drafted, PipelinePhase::QualityChecked),
    (PipelinePhase::QualityChecked, PipelinePhase::Drafted),
    (PipelinePhase::QualityChecked, PipelinePhase::Decided),
];

/// Whether `from -> to` is a legal move. With a recorded failure, any
/// non-terminal phase may jump straight to `Decided`.
pub fn transition_allowed(from: PipelinePhase, to: PipelinePhase, failed: bool) -> bool {
    if from.is_terminal() {
        return false;
    }
    if failed && to == PipelinePhase::Decided {
        return true;
    }
    TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

// ── State ───────────────────────────────────────────────────────────

/// Everything known about one request, accumulated stage by stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    request_id: Uuid,
    phase: PipelinePhase,
    raw_email: RawEmail,
    classification: Option<Classification>,
    company_profile: Option<CompanyProfile>,
    retrieved_context: Option<RetrievedContext>,
    draft: Option<DraftResponse>,
    quality: Option<QualityScores>,
    retry_count: u32,
    retry_pending: bool,
    failure: Option<StageFailure>,
    decision: Option<Decision>,
    total_cost: TokenCost,
    transitions: Vec<PipelinePhase>,
    trace: Vec<TraceEvent>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl PipelineState {
    /// Ingest a request. Input validation happens before this.
    pub fn new(raw_email: RawEmail) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            phase: PipelinePhase::Ingested,
            raw_email,
            classification: None,
            company_profile: None,
            retrieved_context: None,
            draft: None,
            quality: None,
            retry_count: 0,
            retry_pending: false,
            failure: None,
            decision: None,
            total_cost: TokenCost::zero(),
            transitions: vec![PipelinePhase::Ingested],
            trace: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    pub fn raw_email(&self) -> &RawEmail {
        &self.raw_email
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.classification.as_ref()
    }

    pub fn company_profile(&self) -> Option<&CompanyProfile> {
        self.company_profile.as_ref()
    }

    pub fn retrieved_context(&self) -> Option<&RetrievedContext> {
        self.retrieved_context.as_ref()
    }

    /// The latest draft. Earlier drafts are not kept.
    pub fn draft(&self) -> Option<&DraftResponse> {
        self.draft.as_ref()
    }

    /// Scores from the latest quality pass.
    pub fn quality(&self) -> Option<&QualityScores> {
        self.quality.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// A retry has been counted but the re-draft is not in yet.
    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        self.failure.as_ref()
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.decision.is_some()
    }

    pub fn total_cost(&self) -> &TokenCost {
        &self.total_cost
    }

    /// Phases visited so far, starting with `Ingested`.
    pub fn transitions(&self) -> &[PipelinePhase] {
        &self.transitions
    }

    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    // ── Commits ─────────────────────────────────────────────────────

    pub fn commit_classification(&mut self, value: Classification) -> Result<(), StageError> {
        let stage = StageKind::Classifier;
        if self.classification.is_some() {
            return Err(StageError::sequence(stage, "classification already committed"));
        }
        self.advance(stage, PipelinePhase::Classified)?;
        self.classification = Some(value);
        Ok(())
    }

    pub fn commit_company_profile(&mut self, value: CompanyProfile) -> Result<(), StageError> {
        let stage = StageKind::Researcher;
        if self.company_profile.is_some() {
            return Err(StageError::sequence(stage, "company profile already committed"));
        }
        self.advance(stage, PipelinePhase::Researched)?;
        self.company_profile = Some(value);
        Ok(())
    }

    pub fn commit_retrieved_context(&mut self, value: RetrievedContext) -> Result<(), StageError> {
        let stage = StageKind::Retrieval;
        if self.retrieved_context.is_some() {
            return Err(StageError::sequence(stage, "retrieved context already committed"));
        }
        self.advance(stage, PipelinePhase::Retrieved)?;
        self.retrieved_context = Some(value);
        Ok(())
    }

    /// Commit a draft. A second draft is accepted only on the retry edge.
    pub fn commit_draft(&mut self, value: DraftResponse) -> Result<(), StageError> {
        let stage = StageKind::Writer;
        if self.phase == PipelinePhase::QualityChecked && !self.retry_pending {
            return Err(StageError::sequence(stage, "re-draft without a counted retry"));
        }
        self.advance(stage, PipelinePhase::Drafted)?;
        self.retry_pending = false;
        self.draft = Some(value);
        Ok(())
    }

    /// Commit a quality pass. Replaces any previous scores.
    pub fn commit_quality(&mut self, value: QualityScores) -> Result<(), StageError> {
        self.advance(StageKind::QualityGate, PipelinePhase::QualityChecked)?;
        self.quality = Some(value);
        Ok(())
    }

    /// Count one Writer retry. Fails once `max_retries` is reached, so the
    /// retry edge can be taken at most `max_retries` times.
    pub fn begin_retry(&mut self, max_retries: u32) -> Result<u32, StageError> {
        let stage = StageKind::QualityGate;
        if self.phase != PipelinePhase::QualityChecked {
            return Err(StageError::sequence(
                stage,
                format!("retry requested in phase {}", self.phase),
            ));
        }
        if self.retry_pending {
            return Err(StageError::sequence(stage, "retry already pending"));
        }
        if self.quality.as_ref().is_some_and(|q| q.passed) {
            return Err(StageError::sequence(stage, "retry requested after a passing gate"));
        }
        if self.retry_count >= max_retries {
            return Err(StageError::sequence(
                stage,
                format!("retry budget of {max_retries} exhausted"),
            ));
        }
        self.retry_count += 1;
        self.retry_pending = true;
        Ok(self.retry_count)
    }

    /// Record the Fatal failure that will force the decision. The first
    /// failure wins.
    pub fn record_failure(&mut self, failure: StageFailure) -> Result<(), StageError> {
        if self.is_terminal() {
            return Err(StageError::sequence(failure.stage, "failure recorded after decision"));
        }
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
        Ok(())
    }

    /// Set the terminal field. Allowed once, after the final quality pass or
    /// after a recorded failure.
    pub fn commit_decision(&mut self, value: Decision) -> Result<(), StageError> {
        let stage = StageKind::Decision;
        if self.is_terminal() {
            return Err(StageError::sequence(stage, "decision already committed"));
        }
        if self.retry_pending && self.failure.is_none() {
            return Err(StageError::sequence(stage, "decision while a re-draft is pending"));
        }
        self.advance(stage, PipelinePhase::Decided)?;
        self.completed_at = Some(value.decided_at);
        self.decision = Some(value);
        Ok(())
    }

    /// Add the cost of a call. Cost only ever grows.
    pub fn add_cost(&mut self, cost: &TokenCost) {
        self.total_cost += cost.clone();
    }

    pub(crate) fn push_trace(&mut self, event: TraceEvent) {
        self.trace.push(event);
    }

    /// JSON of the field `stage` owns, for trace diffs.
    pub fn field_json(&self, stage: StageKind) -> serde_json::Value {
        let value = match stage {
            StageKind::Classifier => serde_json::to_value(&self.classification),
            StageKind::Researcher => serde_json::to_value(&self.company_profile),
            StageKind::Retrieval => serde_json::to_value(&self.retrieved_context),
            StageKind::Writer => serde_json::to_value(&self.draft),
            StageKind::QualityGate => serde_json::to_value(&self.quality),
            StageKind::Decision => serde_json::to_value(&self.decision),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    fn advance(&mut self, stage: StageKind, to: PipelinePhase) -> Result<(), StageError> {
        if self.is_terminal() {
            return Err(StageError::sequence(stage, "state is already terminal"));
        }
        if !transition_allowed(self.phase, to, self.failure.is_some()) {
            return Err(StageError::sequence(
                stage,
                format!("illegal transition {} -> {}", self.phase, to),
            ));
        }
        self.phase = to;
        self.transitions.push(to);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::pipeline::types::*;

    pub fn email() -> RawEmail {
        RawEmail::new(
            "sarah.chen@dataflow.io",
            "Enterprise pricing",
            "Hi, we need pricing for 500 seats and SSO. Can we talk this week?",
        )
    }

    pub fn classification(confidence: f64, urgency: Urgency) -> Classification {
        Classification {
            intent: Intent::SalesInquiry,
            urgency,
            confidence,
            company_name: Some("DataFlow".into()),
            key_requirements: vec!["pricing for 500 seats".into(), "SSO".into()],
        }
    }

    pub fn draft(attempt: u32) -> DraftResponse {
        DraftResponse {
            subject: "Re: Enterprise pricing".into(),
            body: "Thanks for reaching out.".into(),
            tone: "professional".into(),
            key_points: vec!["pricing".into()],
            model_used: "test-model".into(),
            token_cost: TokenCost::zero(),
            attempt,
        }
    }

    pub fn quality(overall: f64, passed: bool, attempt: u32) -> QualityScores {
        QualityScores {
            scores: RubricScores {
                factual_grounding: overall,
                completeness: overall,
                tone: overall,
                clarity: overall,
            },
            overall,
            passed,
            issues: Vec::new(),
            requirements_addressed: Vec::new(),
            requirements_missed: Vec::new(),
            feedback: String::new(),
            attempt,
            degraded: false,
        }
    }

    pub fn decision(verdict: Verdict) -> Decision {
        Decision {
            verdict,
            confidence: 0.9,
            rationale: "test".into(),
            priority: ReviewPriority::Low,
            estimated_review_minutes: 0,
            breakdown: ConfidenceBreakdown {
                classification_confidence: 0.9,
                quality_overall: 0.9,
                weighted_base: 0.9,
                retry_penalty: 0.0,
                missing_profile_penalty: 0.0,
                urgency_factor: 1.0,
                quality_passed: true,
                forced_by_failure: false,
            },
            decided_at: Utc::now(),
        }
    }

    /// A state advanced through Retrieved.
    pub fn enriched() -> PipelineState {
        let mut state = PipelineState::new(email());
        state
            .commit_classification(classification(0.9, Urgency::Medium))
            .unwrap();
        state
            .commit_company_profile(CompanyProfile::NotFound {
                reason: "unknown".into(),
            })
            .unwrap();
        state
            .commit_retrieved_context(RetrievedContext::empty("q"))
            .unwrap();
        state
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::pipeline::types::{Urgency, Verdict};
    use rust_decimal_macros::dec;

    #[test]
    fn happy_path_visits_every_phase_in_order() {
        let mut state = enriched();
        state.commit_draft(draft(1)).unwrap();
        state.commit_quality(quality(0.9, true, 1)).unwrap();
        state.commit_decision(decision(Verdict::Autonomous)).unwrap();

        assert!(state.is_terminal());
        assert_eq!(
            state.transitions(),
            &[
                PipelinePhase::Ingested,
                PipelinePhase::Classified,
                PipelinePhase::Researched,
                PipelinePhase::Retrieved,
                PipelinePhase::Drafted,
                PipelinePhase::QualityChecked,
                PipelinePhase::Decided,
            ]
        );
        assert!(state.completed_at().is_some());
    }

    #[test]
    fn skipping_a_stage_is_a_sequence_error() {
        let mut state = PipelineState::new(email());
        let err = state
            .commit_retrieved_context(RetrievedContext::empty("q"))
            .unwrap_err();
        assert!(matches!(err, StageError::Sequence { .. }));
        assert_eq!(state.phase(), PipelinePhase::Ingested);
    }

    #[test]
    fn committed_fields_cannot_be_overwritten() {
        let mut state = PipelineState::new(email());
        state
            .commit_classification(classification(0.9, Urgency::Low))
            .unwrap();
        let err = state
            .commit_classification(classification(0.1, Urgency::High))
            .unwrap_err();
        assert!(err.to_string().contains("already committed"));
        assert_eq!(state.classification().unwrap().confidence, 0.9);
    }

    #[test]
    fn retry_edge_is_bounded() {
        let mut state = enriched();
        state.commit_draft(draft(1)).unwrap();
        state.commit_quality(quality(0.5, false, 1)).unwrap();
        assert_eq!(state.begin_retry(2).unwrap(), 1);
        state.commit_draft(draft(2)).unwrap();
        state.commit_quality(quality(0.6, false, 2)).unwrap();
        assert_eq!(state.begin_retry(2).unwrap(), 2);
        state.commit_draft(draft(3)).unwrap();
        state.commit_quality(quality(0.6, false, 3)).unwrap();

        assert!(state.begin_retry(2).is_err());
        assert_eq!(state.retry_count(), 2);
        assert_eq!(state.draft().unwrap().attempt, 3);
        assert_eq!(state.quality().unwrap().overall, 0.6);
    }

    #[test]
    fn redraft_requires_counted_retry() {
        let mut state = enriched();
        state.commit_draft(draft(1)).unwrap();
        state.commit_quality(quality(0.5, false, 1)).unwrap();
        assert!(state.commit_draft(draft(2)).is_err());
    }

    #[test]
    fn retry_after_pass_is_rejected() {
        let mut state = enriched();
        state.commit_draft(draft(1)).unwrap();
        state.commit_quality(quality(0.9, true, 1)).unwrap();
        assert!(state.begin_retry(2).is_err());
    }

    #[test]
    fn decision_needs_quality_check_unless_failed() {
        let mut state = enriched();
        assert!(state.commit_decision(decision(Verdict::Escalate)).is_err());

        state
            .record_failure(StageFailure {
                stage: StageKind::Writer,
                reason: "model unavailable".into(),
            })
            .unwrap();
        state.commit_decision(decision(Verdict::Escalate)).unwrap();
        assert_eq!(state.phase(), PipelinePhase::Decided);
        assert!(state.draft().is_none());
    }

    #[test]
    fn nothing_moves_after_decided() {
        let mut state = PipelineState::new(email());
        state
            .record_failure(StageFailure {
                stage: StageKind::Classifier,
                reason: "boom".into(),
            })
            .unwrap();
        state.commit_decision(decision(Verdict::Escalate)).unwrap();

        assert!(
            state
                .commit_classification(classification(0.9, Urgency::Low))
                .is_err()
        );
        assert!(state.commit_decision(decision(Verdict::Review)).is_err());
        assert!(
            state
                .record_failure(StageFailure {
                    stage: StageKind::Writer,
                    reason: "late".into(),
                })
                .is_err()
        );
    }

    #[test]
    fn first_failure_wins() {
        let mut state = PipelineState::new(email());
        for reason in ["first", "second"] {
            state
                .record_failure(StageFailure {
                    stage: StageKind::Classifier,
                    reason: reason.into(),
                })
                .unwrap();
        }
        assert_eq!(state.failure().unwrap().reason, "first");
    }

    #[test]
    fn cost_accumulates() {
        let mut state = PipelineState::new(email());
        state.add_cost(&TokenCost::priced(100, 10, (dec!(0.001), dec!(0.002))));
        state.add_cost(&TokenCost::priced(50, 5, (dec!(0.001), dec!(0.002))));
        assert_eq!(state.total_cost().input_tokens, 150);
        assert_eq!(state.total_cost().usd, dec!(0.18));
    }

    #[test]
    fn table_has_no_edge_out_of_decided() {
        assert!(
            TRANSITIONS
                .iter()
                .all(|(from, _)| *from != PipelinePhase::Decided)
        );
        assert!(!transition_allowed(
            PipelinePhase::Decided,
            PipelinePhase::Decided,
            true
        ));
        assert!(!transition_allowed(
            PipelinePhase::Classified,
            PipelinePhase::Drafted,
            false
        ));
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = enriched();
        state.commit_draft(draft(1)).unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let back: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id(), state.request_id());
        assert_eq!(back.phase(), PipelinePhase::Drafted);
    }
}
