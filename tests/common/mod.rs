//! Shared harness: stub providers behind the real `ProviderPort`.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Value, json};

use agentflow::company::{CompanyFacts, CompanyLookup, CompanyRecord, StaticDirectory};
use agentflow::config::PipelineConfig;
use agentflow::error::LlmError;
use agentflow::knowledge::{InMemoryKnowledgeBase, KnowledgeDocument};
use agentflow::llm::{
    AgentRole, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ProviderPort,
};
use agentflow::observability::{CostLedger, FanoutSink, MetricsCollector};
use agentflow::pipeline::{Orchestrator, OrchestratorDeps};

/// One canned provider reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Json(Value),
    Text(String),
    RateLimited,
    AuthFailed,
}

type Respond = Box<dyn Fn(&str, usize) -> Reply + Send + Sync>;

/// Stub LLM provider (no real API calls).
pub struct StubLlm {
    model: &'static str,
    respond: Respond,
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl StubLlm {
    /// Replies in order; the last reply repeats once the script runs out.
    pub fn scripted(model: &'static str, replies: Vec<Reply>) -> Self {
        Self::with(model, move |_, i| {
            replies
                .get(i)
                .or_else(|| replies.last())
                .cloned()
                .unwrap_or(Reply::AuthFailed)
        })
    }

    /// Replies computed from the user prompt and the call index.
    pub fn with(
        model: &'static str,
        respond: impl Fn(&str, usize) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self {
            model,
            respond: Box::new(respond),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        self.model
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (dec!(0.000003), dec!(0.000015))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push(prompt.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let content = match (self.respond)(&prompt, index) {
            Reply::Json(value) => value.to_string(),
            Reply::Text(text) => text,
            Reply::RateLimited => {
                return Err(LlmError::RateLimited {
                    provider: "stub".into(),
                    retry_after: None,
                });
            }
            Reply::AuthFailed => {
                return Err(LlmError::AuthFailed {
                    provider: "stub".into(),
                });
            }
        };
        Ok(CompletionResponse {
            content,
            input_tokens: 200,
            output_tokens: 100,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

// ── Canned model outputs ────────────────────────────────────────────

pub fn classification(confidence: f64, urgency: &str) -> Reply {
    Reply::Json(json!({
        "intent": "sales_inquiry",
        "urgency": urgency,
        "company_name": "DataFlow",
        "key_requirements": ["pricing", "SSO"],
        "confidence": confidence
    }))
}

pub fn draft() -> Reply {
    Reply::Json(json!({
        "subject": "Re: Enterprise pricing",
        "body": "Hi Sarah, our enterprise plan includes SSO. Shall we set up a call?",
        "tone": "warm",
        "key_points": ["pricing", "SSO"]
    }))
}

/// Reviewer output with every dimension at `score`.
pub fn review(score: f64) -> Reply {
    Reply::Json(json!({
        "scores": {
            "factual_grounding": score,
            "completeness": score,
            "tone": score,
            "clarity": score
        },
        "issues": [{"severity": "medium", "issue": "Pricing is vague", "suggestion": "Quote the tier"}],
        "requirements_missed": [],
        "feedback": "Be specific about the enterprise tier."
    }))
}

pub fn directory() -> StaticDirectory {
    StaticDirectory::new(vec![CompanyRecord {
        domains: vec!["dataflow.io".into()],
        facts: CompanyFacts {
            name: "DataFlow".into(),
            industry: Some("fintech".into()),
            products_services: vec!["data pipelines".into()],
            size: Some("enterprise".into()),
            key_insights: vec!["Series C in 2024".into()],
        },
    }])
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<MetricsCollector>,
    pub costs: Arc<CostLedger>,
    pub classifier: Arc<StubLlm>,
    pub writer: Arc<StubLlm>,
    pub reviewer: Arc<StubLlm>,
}

pub fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.retry.jitter_factor = 0.0;
    config
}

pub async fn harness(
    classifier: StubLlm,
    writer: StubLlm,
    reviewer: StubLlm,
    lookup: Arc<dyn CompanyLookup>,
) -> Harness {
    harness_with(fast_config(), classifier, writer, reviewer, lookup).await
}

pub async fn harness_with(
    config: PipelineConfig,
    classifier: StubLlm,
    writer: StubLlm,
    reviewer: StubLlm,
    lookup: Arc<dyn CompanyLookup>,
) -> Harness {
    let classifier = Arc::new(classifier);
    let writer = Arc::new(writer);
    let reviewer = Arc::new(reviewer);
    let port = ProviderPort::new(writer.clone())
        .with_role(AgentRole::Classifier, classifier.clone())
        .with_role(AgentRole::QualityReviewer, reviewer.clone());

    let knowledge = InMemoryKnowledgeBase::new();
    knowledge
        .add_documents(vec![KnowledgeDocument {
            doc_id: Some("cs-1".into()),
            title: "Fintech SSO rollout".into(),
            content: "Enterprise pricing and SSO for a fintech customer with 500 seats.".into(),
            category: "case_study".into(),
            industry: Some("fintech".into()),
            tags: vec!["SSO".into(), "pricing".into()],
            year: 2024,
        }])
        .await;

    let metrics = Arc::new(MetricsCollector::new());
    let costs = Arc::new(CostLedger::new());
    let sink = FanoutSink::new()
        .with(metrics.clone())
        .with(costs.clone());

    let orchestrator = Orchestrator::new(
        config,
        OrchestratorDeps {
            port: Arc::new(port),
            retriever: Arc::new(knowledge),
            lookup,
            sink: Arc::new(sink),
        },
    )
    .unwrap();

    Harness {
        orchestrator: Arc::new(orchestrator),
        metrics,
        costs,
        classifier,
        writer,
        reviewer,
    }
}
