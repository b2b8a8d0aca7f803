//! Pipeline Orchestrator.
//!
//! Owns one `PipelineState` per invocation and drives it through the phase
//! machine: classify, research and retrieve, then draft and check until the
//! gate passes or the retry budget is spent, then decide. Every stage run
//! emits one trace event. Whatever goes wrong, the state ends with a
//! decision; the worst case is ESCALATE with the failure as rationale.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::company::CompanyLookup;
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError, StageError};
use crate::knowledge::KnowledgeRetriever;
use crate::llm::{ReasoningPort, TokenCost};
use crate::observability::{ObservabilitySink, TraceEvent, TraceOutcome};
use crate::pipeline::retry::{Attempted, call_with_retry};
use crate::pipeline::stages::{
    ClassifierStage, DecisionStage, GateOutcome, QualityGateStage, ResearcherStage,
    RetrievalStage, Stage, WriterStage, gate_outcome,
};
use crate::pipeline::state::PipelineState;
use crate::pipeline::types::{RawEmail, StageFailure, StageKind, StageOutput};

/// External collaborators, injected at construction.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub port: Arc<dyn ReasoningPort>,
    pub retriever: Arc<dyn KnowledgeRetriever>,
    pub lookup: Arc<dyn CompanyLookup>,
    pub sink: Arc<dyn ObservabilitySink>,
}

pub struct Orchestrator {
    config: PipelineConfig,
    classifier: ClassifierStage,
    researcher: ResearcherStage,
    retrieval: RetrievalStage,
    writer: WriterStage,
    quality: QualityGateStage,
    decision: DecisionStage,
    sink: Arc<dyn ObservabilitySink>,
}

impl Orchestrator {
    /// Build an orchestrator. Fails if the configuration is invalid.
    pub fn new(config: PipelineConfig, deps: OrchestratorDeps) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            classifier: ClassifierStage::new(Arc::clone(&deps.port)),
            researcher: ResearcherStage::new(deps.lookup),
            retrieval: RetrievalStage::new(deps.retriever, config.retrieval_top_k),
            writer: WriterStage::new(Arc::clone(&deps.port)),
            quality: QualityGateStage::new(deps.port, config.quality.clone()),
            decision: DecisionStage::new(config.decision.clone(), config.quality.max_retries),
            sink: deps.sink,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one email to a terminal state.
    pub async fn process(&self, email: RawEmail) -> Result<PipelineState, PipelineError> {
        if let Err(e) = email.validate() {
            warn!(sender = %email.sender, error = %e, "Rejected email");
            return Err(e);
        }
        self.run(PipelineState::new(email)).await
    }

    /// Like `process`, but abandons in-flight calls when `token` fires.
    /// A cancelled request gets no decision and no decision trace.
    pub async fn process_cancellable(
        &self,
        email: RawEmail,
        token: CancellationToken,
    ) -> Result<PipelineState, PipelineError> {
        email.validate()?;
        let state = PipelineState::new(email);
        let request_id = state.request_id();

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(%request_id, "Pipeline cancelled");
                Err(PipelineError::Cancelled { request_id: request_id.to_string() })
            }
            done = self.run(state) => done,
        }
    }

    /// Run many emails concurrently, at most `concurrency` at a time.
    /// Results come back in input order.
    pub async fn process_batch(
        &self,
        emails: Vec<RawEmail>,
        concurrency: usize,
    ) -> Vec<Result<PipelineState, PipelineError>> {
        let count = emails.len();
        info!(count, concurrency, "Processing email batch");

        let mut results: Vec<(usize, Result<PipelineState, PipelineError>)> =
            futures::stream::iter(emails.into_iter().enumerate())
                .map(|(i, email)| async move { (i, self.process(email).await) })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;
        results.sort_by_key(|(i, _)| *i);

        let decided = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(decided, total = count, "Batch processing complete");
        results.into_iter().map(|(_, r)| r).collect()
    }

    // ── Driving the phase machine ───────────────────────────────────

    async fn run(&self, mut state: PipelineState) -> Result<PipelineState, PipelineError> {
        info!(
            request_id = %state.request_id(),
            sender = %state.raw_email().sender,
            subject = %state.raw_email().subject,
            "Pipeline started"
        );
        if let Err(e) = self.drive(&mut state).await {
            self.fail(&mut state, e);
        }
        self.finish(&mut state)?;
        Ok(state)
    }

    async fn drive(&self, state: &mut PipelineState) -> Result<(), StageError> {
        self.step(&self.classifier, state, PipelineState::commit_classification)
            .await?;

        if self.config.parallel_enrichment {
            let started_at = Utc::now();
            let clock = Instant::now();
            let (research, context) = tokio::join!(
                self.attempt(&self.researcher, state),
                self.attempt(&self.retrieval, state),
            );
            self.settle(
                &self.researcher,
                state,
                research,
                started_at,
                clock,
                PipelineState::commit_company_profile,
            )?;
            self.settle(
                &self.retrieval,
                state,
                context,
                started_at,
                clock,
                PipelineState::commit_retrieved_context,
            )?;
        } else {
            self.step(&self.researcher, state, PipelineState::commit_company_profile)
                .await?;
            self.step(&self.retrieval, state, PipelineState::commit_retrieved_context)
                .await?;
        }

        let max_retries = self.config.quality.max_retries;
        loop {
            self.step(&self.writer, state, PipelineState::commit_draft)
                .await?;
            self.step(&self.quality, state, PipelineState::commit_quality)
                .await?;

            let scores = state.quality().ok_or_else(|| {
                StageError::sequence(StageKind::QualityGate, "quality scores missing after commit")
            })?;
            match gate_outcome(scores, state.retry_count(), max_retries) {
                GateOutcome::Pass => return Ok(()),
                GateOutcome::Degraded => {
                    warn!(
                        request_id = %state.request_id(),
                        overall = scores.overall,
                        "Reviewer unavailable, deciding on the rule-based check"
                    );
                    return Ok(());
                }
                GateOutcome::Exhausted => {
                    warn!(
                        request_id = %state.request_id(),
                        overall = scores.overall,
                        retries = state.retry_count(),
                        "Quality gate failed with no retries left"
                    );
                    return Ok(());
                }
                GateOutcome::Retry => {
                    let overall = scores.overall;
                    let retry = state.begin_retry(max_retries)?;
                    info!(
                        request_id = %state.request_id(),
                        overall,
                        retry,
                        max_retries,
                        "Quality gate failed, re-drafting with feedback"
                    );
                }
            }
        }
    }

    /// Run `stage` with retries and commit its output.
    async fn step<S, C>(
        &self,
        stage: &S,
        state: &mut PipelineState,
        commit: C,
    ) -> Result<(), StageError>
    where
        S: Stage,
        C: FnOnce(&mut PipelineState, S::Output) -> Result<(), StageError>,
    {
        let started_at = Utc::now();
        let clock = Instant::now();
        let attempted = self.attempt(stage, state).await;
        self.settle(stage, state, attempted, started_at, clock, commit)
    }

    async fn attempt<S: Stage>(
        &self,
        stage: &S,
        state: &PipelineState,
    ) -> Attempted<StageOutput<S::Output>> {
        call_with_retry(
            stage.kind(),
            &self.config.retry,
            self.config.call_timeout,
            |_| stage.run(state),
        )
        .await
    }

    /// Commit a stage result, or its fallback, and emit the trace event.
    fn settle<S, C>(
        &self,
        stage: &S,
        state: &mut PipelineState,
        attempted: Attempted<StageOutput<S::Output>>,
        started_at: DateTime<Utc>,
        clock: Instant,
        commit: C,
    ) -> Result<(), StageError>
    where
        S: Stage,
        C: FnOnce(&mut PipelineState, S::Output) -> Result<(), StageError>,
    {
        let kind = stage.kind();
        let attempt = match kind {
            StageKind::Writer | StageKind::QualityGate => state.retry_count() + 1,
            _ => 1,
        };

        // Failed attempts are billed on every outcome, degraded or not.
        let mut cost: TokenCost = attempted.spent;
        let (outcome, result) = match attempted.result {
            Ok(output) => {
                commit(state, output.value)?;
                cost += output.cost;
                (TraceOutcome::Committed, Ok(()))
            }
            Err(e @ StageError::Sequence { .. }) => return Err(e),
            Err(e) => {
                let reason = e.to_string();
                match stage.fallback(state, &reason) {
                    Some(value) => {
                        commit(state, value)?;
                        (TraceOutcome::Degraded { reason }, Ok(()))
                    }
                    None => (TraceOutcome::Failed { reason }, Err(e)),
                }
            }
        };

        state.add_cost(&cost);

        let diff = match outcome {
            TraceOutcome::Failed { .. } => serde_json::Value::Null,
            _ => state.field_json(kind),
        };
        let event = TraceEvent {
            request_id: state.request_id(),
            stage: kind,
            attempt,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            cost_delta: cost,
            calls: attempted.calls,
            outcome,
            phase_after: state.phase(),
            diff,
        };
        self.emit(state, event);
        result
    }

    /// Record the failure that forces the decision. Sequence errors mean a
    /// bug and are logged as errors.
    fn fail(&self, state: &mut PipelineState, err: StageError) {
        let (stage, reason) = match err {
            StageError::Retryable { stage, reason } | StageError::Fatal { stage, reason } => {
                warn!(
                    request_id = %state.request_id(),
                    stage = %stage,
                    reason = %reason,
                    "Stage failed, forcing escalation"
                );
                (stage, reason)
            }
            StageError::Sequence { stage, reason } => {
                error!(
                    request_id = %state.request_id(),
                    stage = %stage,
                    phase = %state.phase(),
                    reason = %reason,
                    "Sequence violation, forcing escalation"
                );
                (stage, format!("sequence violation: {reason}"))
            }
        };
        if let Err(e) = state.record_failure(StageFailure { stage, reason }) {
            error!(request_id = %state.request_id(), error = %e, "Could not record failure");
        }
    }

    /// Decide and commit. A decision that cannot be committed is recorded
    /// as a failure and the decision is forced on the second pass.
    fn finish(&self, state: &mut PipelineState) -> Result<(), PipelineError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        for _ in 0..2 {
            let result = self
                .decision
                .decide(state, Utc::now())
                .and_then(|decision| state.commit_decision(decision));
            match result {
                Ok(()) => break,
                Err(e) => self.fail(state, e),
            }
        }

        let Some(decision) = state.decision() else {
            error!(request_id = %state.request_id(), "No decision could be committed");
            return Err(PipelineError::Sequence(format!(
                "request {} ended in {} without a decision",
                state.request_id(),
                state.phase()
            )));
        };
        let verdict = decision.verdict;
        let confidence = decision.confidence;

        info!(
            request_id = %state.request_id(),
            verdict = %verdict,
            confidence,
            retries = state.retry_count(),
            cost_usd = %state.total_cost().usd,
            "Pipeline complete"
        );
        let event = TraceEvent {
            request_id: state.request_id(),
            stage: StageKind::Decision,
            attempt: 1,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            cost_delta: TokenCost::zero(),
            calls: 0,
            outcome: TraceOutcome::Decided {
                verdict,
                confidence,
            },
            phase_after: state.phase(),
            diff: state.field_json(StageKind::Decision),
        };
        self.emit(state, event);
        Ok(())
    }

    fn emit(&self, state: &mut PipelineState, event: TraceEvent) {
        self.sink.record(&event);
        state.push_trace(event);
    }
}
