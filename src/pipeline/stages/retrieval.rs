//! Retrieval Stage: top-K supporting snippets for the detected intent.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{KnowledgeError, StageError};
use crate::knowledge::{KnowledgeRetriever, ScoredDocument, SearchQuery};
use crate::pipeline::stages::{Stage, StageResult, require};
use crate::pipeline::state::PipelineState;
use crate::pipeline::types::{
    Classification, RawEmail, RetrievalStrategy, RetrievedContext, RetrievedSnippet, StageKind,
    StageOutput,
};

/// Candidates fetched per kept snippet, so re-ranking has room to work.
const CANDIDATE_FACTOR: usize = 3;

pub struct RetrievalStage {
    retriever: Arc<dyn KnowledgeRetriever>,
    top_k: usize,
}

impl RetrievalStage {
    pub fn new(retriever: Arc<dyn KnowledgeRetriever>, top_k: usize) -> Self {
        Self { retriever, top_k }
    }
}

/// Query text and keywords for a classified email.
///
/// Built from the email and its classification only. Research runs
/// alongside retrieval, so the company profile is never an input here.
pub fn build_query(email: &RawEmail, classification: &Classification) -> SearchQuery {
    let text = if classification.key_requirements.is_empty() {
        format!("{} {}", email.subject, email.body)
    } else {
        classification.key_requirements.join(" ")
    };
    SearchQuery::new(text).with_keywords(classification.key_requirements.clone())
}

/// Score descending, then newer first, then id ascending.
fn rank(a: &RetrievedSnippet, b: &RetrievedSnippet) -> Ordering {
    b.relevance_score
        .total_cmp(&a.relevance_score)
        .then_with(|| b.year.cmp(&a.year))
        .then_with(|| a.id.cmp(&b.id))
}

fn explain_relevance(hit: &ScoredDocument, requirements: &[String]) -> String {
    let doc = &hit.document;
    let mut reasons = Vec::new();
    match doc.category.as_str() {
        "case_study" => reasons.push("similar past project".to_string()),
        "product" => reasons.push("relevant product offering".to_string()),
        _ => {}
    }
    if let Some(ref industry) = doc.industry
        && !industry.is_empty()
    {
        reasons.push(format!("same industry ({industry})"));
    }
    let matching: Vec<&str> = doc
        .tags
        .iter()
        .filter(|tag| {
            let tag = tag.to_lowercase();
            requirements.iter().any(|r| tag.contains(&r.to_lowercase()))
        })
        .take(2)
        .map(String::as_str)
        .collect();
    if !matching.is_empty() {
        reasons.push(format!("matches requirements: {}", matching.join(", ")));
    }
    if reasons.is_empty() {
        "High semantic similarity to query".to_string()
    } else {
        reasons.join(" | ")
    }
}

#[async_trait]
impl Stage for RetrievalStage {
    type Output = RetrievedContext;

    fn kind(&self) -> StageKind {
        StageKind::Retrieval
    }

    async fn run(&self, state: &PipelineState) -> StageResult<RetrievedContext> {
        let stage = self.kind();
        let classification = require(stage, state.classification(), "classification")?;
        let query = build_query(state.raw_email(), classification);
        let strategy = if query.keywords.is_empty() {
            RetrievalStrategy::Semantic
        } else {
            RetrievalStrategy::HybridKeywords
        };

        let hits = self
            .retriever
            .search(&query, self.top_k.saturating_mul(CANDIDATE_FACTOR))
            .await
            .map_err(|e| match e {
                KnowledgeError::Unavailable(reason) => StageError::retryable(stage, reason),
                other => StageError::fatal(stage, other.to_string()),
            })?;

        let mut snippets: Vec<RetrievedSnippet> = hits
            .iter()
            .map(|hit| RetrievedSnippet {
                id: hit.id,
                title: hit.document.title.clone(),
                content: hit.document.content.clone(),
                category: hit.document.category.clone(),
                year: hit.document.year,
                relevance_score: hit.score.clamp(0.0, 1.0),
                why_relevant: explain_relevance(hit, &classification.key_requirements),
            })
            .collect();
        snippets.sort_by(rank);
        snippets.truncate(self.top_k);

        Ok(StageOutput::free(RetrievedContext {
            query: query.text,
            strategy,
            snippets,
        }))
    }

    /// An empty context is valid; the writer works without it.
    fn fallback(&self, state: &PipelineState, _reason: &str) -> Option<RetrievedContext> {
        let query = state
            .classification()
            .map(|c| build_query(state.raw_email(), c).text)
            .unwrap_or_default();
        Some(RetrievedContext::empty(query))
    }
}
