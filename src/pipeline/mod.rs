//! Email routing pipeline.
//!
//! Every inbound email flows through:
//! 1. `ClassifierStage`: intent, urgency, requirements
//! 2. `ResearcherStage` and `RetrievalStage`: company profile and knowledge
//! 3. `WriterStage` ⇄ `QualityGateStage`: draft, score, re-draft on failure
//! 4. `DecisionStage`: AUTONOMOUS, REVIEW or ESCALATE
//!
//! `Orchestrator` owns the sequencing; `PipelineState` enforces it.

pub mod orchestrator;
pub mod retry;
pub mod stages;
pub mod state;
pub mod types;

pub use orchestrator::{Orchestrator, OrchestratorDeps};
pub use state::{PipelinePhase, PipelineState};
pub use types::{Decision, RawEmail, StageKind, Verdict};
