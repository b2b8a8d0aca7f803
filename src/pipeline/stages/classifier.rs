//! Classifier Stage: intent, urgency and the sender's explicit asks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::StageError;
use crate::llm::{AgentRole, Constraints, ReasoningPort, StructuredPrompt};
use crate::pipeline::stages::{Stage, StageResult, email_section, parse_output, reason};
use crate::pipeline::state::{PipelinePhase, PipelineState};
use crate::pipeline::types::{Classification, Intent, StageKind, StageOutput, Urgency};

const CONSTRAINTS: Constraints = Constraints::new(0.0, 512);

const INSTRUCTIONS: &str = "You are an expert email classifier for a business. \
Analyze the email and extract:\n\
1. intent: one of sales_inquiry, support_request, partnership, other\n\
2. urgency: one of high, medium, low\n\
3. company_name: the formal company name from the sender or signature \
(e.g. ending in GmbH, AG, Inc). Use null if there is none.\n\
4. key_requirements: the sender's explicit requirements or questions, in order\n\
5. confidence: your confidence in this classification, 0.0-1.0\n\n\
Be precise and extract only factual information.\n\
Format: {\"intent\": \"...\", \"urgency\": \"...\", \"company_name\": \"...\", \
\"key_requirements\": [\"...\"], \"confidence\": 0.0}";

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    intent: String,
    #[serde(default)]
    urgency: String,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    key_requirements: Vec<String>,
    confidence: f64,
}

pub struct ClassifierStage {
    port: Arc<dyn ReasoningPort>,
}

impl ClassifierStage {
    pub fn new(port: Arc<dyn ReasoningPort>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl Stage for ClassifierStage {
    type Output = Classification;

    fn kind(&self) -> StageKind {
        StageKind::Classifier
    }

    async fn run(&self, state: &PipelineState) -> StageResult<Classification> {
        let stage = self.kind();
        if state.phase() != PipelinePhase::Ingested {
            return Err(StageError::sequence(
                stage,
                format!("classifier invoked in phase {}", state.phase()),
            )
            .into());
        }

        let prompt = StructuredPrompt::new(INSTRUCTIONS)
            .section("Email", email_section(state.raw_email()));
        let out = reason(
            self.port.as_ref(),
            stage,
            AgentRole::Classifier,
            &prompt,
            &CONSTRAINTS,
        )
        .await?;

        let parsed: ClassifierResponse = parse_output(stage, out.output, &out.cost)?;
        Ok(StageOutput {
            value: into_classification(parsed),
            cost: out.cost,
        })
    }
}

fn into_classification(r: ClassifierResponse) -> Classification {
    let confidence = if r.confidence.is_finite() {
        r.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };
    Classification {
        intent: Intent::parse_lenient(&r.intent),
        urgency: Urgency::parse_lenient(&r.urgency),
        confidence,
        company_name: r
            .company_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty()),
        key_requirements: r
            .key_requirements
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect(),
    }
}
