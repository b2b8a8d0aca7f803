//! Writer Stage: drafts the reply. On a retry the reviewer's feedback goes
//! into the prompt, so a re-draft is informed rather than a blind repeat.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::StageError;
use crate::llm::{AgentRole, Billed, Constraints, ReasoningPort, StructuredPrompt};
use crate::pipeline::stages::{
    Stage, StageResult, bullet_list, email_section, parse_output, reason, require,
};
use crate::pipeline::state::PipelineState;
use crate::pipeline::types::{
    CompanyProfile, DraftResponse, QualityScores, RetrievedContext, StageKind, StageOutput,
};

const CONSTRAINTS: Constraints = Constraints::new(0.7, 1024);

/// Snippets shown to the writer, and how much of each.
const MAX_SNIPPETS: usize = 3;
const SNIPPET_CHARS: usize = 400;

const INSTRUCTIONS: &str = "You are a business development representative writing email responses.\n\n\
Guidelines:\n\
- Keep responses 150-300 words\n\
- Be professional and helpful\n\
- Address every requirement the sender listed\n\
- Only state facts found in the company profile or knowledge sections\n\
- Reference relevant case studies when available\n\
- Include a clear next step\n\
- Write a complete, ready-to-send email\n\n\
Format: {\"subject\": \"...\", \"body\": \"...\", \"tone\": \"...\", \"key_points\": [\"...\"]}";

#[derive(Debug, Deserialize)]
struct WriterResponse {
    subject: String,
    body: String,
    #[serde(default)]
    tone: String,
    #[serde(default)]
    key_points: Vec<String>,
}

pub struct WriterStage {
    port: Arc<dyn ReasoningPort>,
}

impl WriterStage {
    pub fn new(port: Arc<dyn ReasoningPort>) -> Self {
        Self { port }
    }
}

fn company_section(profile: &CompanyProfile) -> String {
    match profile {
        CompanyProfile::Found { facts } => {
            let mut out = format!("Name: {}", facts.name);
            if let Some(ref industry) = facts.industry {
                out.push_str(&format!("\nIndustry: {industry}"));
            }
            if let Some(ref size) = facts.size {
                out.push_str(&format!("\nSize: {size}"));
            }
            if !facts.products_services.is_empty() {
                out.push_str(&format!(
                    "\nProducts/services: {}",
                    facts.products_services.join(", ")
                ));
            }
            if !facts.key_insights.is_empty() {
                out.push_str(&format!("\nInsights:\n{}", bullet_list(&facts.key_insights)));
            }
            out
        }
        CompanyProfile::NotFound { .. } => {
            "No company information available. Do not guess company details.".to_string()
        }
    }
}

fn knowledge_section(context: &RetrievedContext) -> String {
    context
        .snippets
        .iter()
        .take(MAX_SNIPPETS)
        .enumerate()
        .map(|(i, s)| {
            let excerpt: String = s.content.chars().take(SNIPPET_CHARS).collect();
            format!("{}. {} ({}): {}", i + 1, s.title, s.category, excerpt.replace('\n', " "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn feedback_section(quality: &QualityScores) -> String {
    let mut out = format!(
        "The previous draft scored {:.2} and was rejected.",
        quality.overall
    );
    if !quality.feedback.trim().is_empty() {
        out.push_str(&format!("\n{}", quality.feedback.trim()));
    }
    for issue in &quality.issues {
        out.push_str(&format!(
            "\n- [{:?}] {} Fix: {}",
            issue.severity, issue.issue, issue.suggestion
        ));
    }
    if !quality.requirements_missed.is_empty() {
        out.push_str(&format!(
            "\nRequirements not addressed:\n{}",
            bullet_list(&quality.requirements_missed)
        ));
    }
    out
}

/// Build the writer prompt for the current state.
pub fn build_prompt(state: &PipelineState) -> Result<StructuredPrompt, StageError> {
    let stage = StageKind::Writer;
    let classification = require(stage, state.classification(), "classification")?;
    let profile = require(stage, state.company_profile(), "company profile")?;
    let context = require(stage, state.retrieved_context(), "retrieved context")?;

    let mut prompt = StructuredPrompt::new(INSTRUCTIONS)
        .section("Original email", email_section(state.raw_email()))
        .section(
            "Classification",
            format!(
                "Intent: {}\nUrgency: {}",
                classification.intent.label(),
                classification.urgency.label()
            ),
        )
        .section("Requirements", bullet_list(&classification.key_requirements))
        .section("Company", company_section(profile))
        .section("Knowledge", knowledge_section(context));

    if state.retry_pending()
        && let Some(quality) = state.quality()
    {
        prompt = prompt.section("Reviewer feedback", feedback_section(quality));
    }
    Ok(prompt)
}

#[async_trait]
impl Stage for WriterStage {
    type Output = DraftResponse;

    fn kind(&self) -> StageKind {
        StageKind::Writer
    }

    async fn run(&self, state: &PipelineState) -> StageResult<DraftResponse> {
        let stage = self.kind();
        let prompt = build_prompt(state)?;
        let out = reason(self.port.as_ref(), stage, AgentRole::Writer, &prompt, &CONSTRAINTS).await?;

        let parsed: WriterResponse = parse_output(stage, out.output, &out.cost)?;
        if parsed.body.trim().is_empty() {
            return Err(Billed::new(
                StageError::retryable(stage, "model returned an empty body"),
                out.cost,
            ));
        }

        let key_points = if parsed.key_points.is_empty() {
            state
                .classification()
                .map(|c| c.key_requirements.iter().take(2).cloned().collect())
                .unwrap_or_default()
        } else {
            parsed.key_points
        };
        let tone = if parsed.tone.trim().is_empty() {
            "professional".to_string()
        } else {
            parsed.tone
        };

        Ok(StageOutput {
            value: DraftResponse {
                subject: parsed.subject,
                body: parsed.body,
                tone,
                key_points,
                model_used: out.model,
                token_cost: out.cost.clone(),
                attempt: state.retry_count() + 1,
            },
            cost: out.cost,
        })
    }
}
