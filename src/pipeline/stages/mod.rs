//! The six pipeline stages.
//!
//! Every stage reads a `PipelineState` and returns the one field it owns.
//! Committing that field is the orchestrator's job, so a stage never sees a
//! half-written state and never touches another stage's output.

pub mod classifier;
pub mod decision;
pub mod quality;
pub mod researcher;
pub mod retrieval;
pub mod writer;

pub use classifier::ClassifierStage;
pub use decision::DecisionStage;
pub use quality::{GateOutcome, QualityGateStage, gate_outcome, score_overall};
pub use researcher::ResearcherStage;
pub use retrieval::RetrievalStage;
pub use writer::WriterStage;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::StageError;
use crate::llm::{
    AgentRole, Billed, Constraints, ReasoningOutput, ReasoningPort, StructuredPrompt, TokenCost,
};
use crate::pipeline::state::PipelineState;
use crate::pipeline::types::{RawEmail, StageKind, StageOutput};

/// Outcome of one stage attempt. A failed attempt still reports the tokens
/// it spent.
pub type StageResult<T> = Result<StageOutput<T>, Billed<StageError>>;

/// A stage that calls out to a collaborator.
#[async_trait]
pub trait Stage: Send + Sync {
    type Output: Send;

    fn kind(&self) -> StageKind;

    /// One attempt. The orchestrator owns retries and timeouts.
    async fn run(&self, state: &PipelineState) -> StageResult<Self::Output>;

    /// Value to commit once the call layer has given up. `None` makes the
    /// failure Fatal.
    fn fallback(&self, _state: &PipelineState, _reason: &str) -> Option<Self::Output> {
        None
    }
}

/// Unwrap a prerequisite field or fail with a sequence error.
pub(crate) fn require<'a, T>(
    stage: StageKind,
    field: Option<&'a T>,
    name: &str,
) -> Result<&'a T, StageError> {
    field.ok_or_else(|| StageError::sequence(stage, format!("{name} has not been committed")))
}

/// Invoke the port on behalf of `stage`.
pub(crate) async fn reason(
    port: &dyn ReasoningPort,
    stage: StageKind,
    role: AgentRole,
    prompt: &StructuredPrompt,
    constraints: &Constraints,
) -> Result<ReasoningOutput, Billed<StageError>> {
    port.invoke(role, prompt, constraints)
        .await
        .map_err(|billed| billed.map(|e| StageError::from_provider(stage, e)))
}

/// Decode model output. Malformed output is worth another attempt, and the
/// call that produced it is still paid for.
pub(crate) fn parse_output<T: DeserializeOwned>(
    stage: StageKind,
    output: serde_json::Value,
    cost: &TokenCost,
) -> Result<T, Billed<StageError>> {
    serde_json::from_value(output).map_err(|e| {
        Billed::new(
            StageError::retryable(stage, format!("malformed model output: {e}")),
            cost.clone(),
        )
    })
}

/// Email rendered for a prompt section, body truncated.
pub(crate) fn email_section(email: &RawEmail) -> String {
    let body: String = email.body.chars().take(4000).collect();
    format!(
        "From: {}\nSubject: {}\n\n{}",
        email.sender, email.subject, body
    )
}

pub(crate) fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}
