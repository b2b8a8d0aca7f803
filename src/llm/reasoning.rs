//! Language Reasoning Port: the single capability interface stages use to
//! talk to a model.
//!
//! A stage hands over a role, a structured prompt and call constraints, and
//! gets back parsed JSON plus what the call cost. A call that reached the
//! model and still failed reports what it spent alongside the error. Which
//! concrete provider
//! serves which role is decided once, when the `ProviderPort` is built.

use std::collections::HashMap;
use std::ops::{Add, AddAssign};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Which reasoning job a call performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Classifier,
    Researcher,
    Writer,
    QualityReviewer,
}

impl AgentRole {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Classifier => "classifier",
            Self::Researcher => "researcher",
            Self::Writer => "writer",
            Self::QualityReviewer => "quality_reviewer",
        }
    }
}

/// A prompt made of free-form instructions and titled context sections.
#[derive(Debug, Clone, Default)]
pub struct StructuredPrompt {
    pub instructions: String,
    pub sections: Vec<(String, String)>,
}

impl StructuredPrompt {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            sections: Vec::new(),
        }
    }

    /// Append a titled section. Empty bodies are skipped.
    pub fn section(mut self, title: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        if !body.trim().is_empty() {
            self.sections.push((title.into(), body));
        }
        self
    }

    pub fn has_section(&self, title: &str) -> bool {
        self.sections.iter().any(|(t, _)| t == title)
    }

    /// Render the sections as the user turn.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);
        for (title, body) in &self.sections {
            out.push_str(&format!("{}:\n{}\n\n", title.to_uppercase(), body.trim_end()));
        }
        out.trim_end().to_string()
    }
}

/// Sampling limits for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constraints {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Constraints {
    pub const fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

/// Token usage and USD cost of one or more calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCost {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub usd: Decimal,
}

impl TokenCost {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Price token usage at per-token rates.
    pub fn priced(input_tokens: u64, output_tokens: u64, rates: (Decimal, Decimal)) -> Self {
        let usd = Decimal::from(input_tokens) * rates.0 + Decimal::from(output_tokens) * rates.1;
        Self {
            input_tokens,
            output_tokens,
            usd,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens() == 0 && self.usd.is_zero()
    }
}

impl Add for TokenCost {
    type Output = TokenCost;

    fn add(mut self, rhs: TokenCost) -> TokenCost {
        self += rhs;
        self
    }
}

impl AddAssign for TokenCost {
    fn add_assign(&mut self, rhs: TokenCost) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.usd += rhs.usd;
    }
}

/// A failure together with the tokens spent before it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Billed<E> {
    pub error: E,
    pub cost: TokenCost,
}

impl<E> Billed<E> {
    /// A failure that spent nothing (rejected before or by the transport).
    pub fn free(error: E) -> Self {
        Self {
            error,
            cost: TokenCost::zero(),
        }
    }

    pub fn new(error: E, cost: TokenCost) -> Self {
        Self { error, cost }
    }

    pub fn map<F>(self, f: impl FnOnce(E) -> F) -> Billed<F> {
        Billed {
            error: f(self.error),
            cost: self.cost,
        }
    }
}

impl<E> From<E> for Billed<E> {
    fn from(error: E) -> Self {
        Self::free(error)
    }
}

/// Result of a successful port call.
#[derive(Debug, Clone)]
pub struct ReasoningOutput {
    /// The JSON object the model produced.
    pub output: serde_json::Value,
    pub cost: TokenCost,
    pub latency: Duration,
    pub model: String,
}

/// The Language Reasoning Port.
#[async_trait]
pub trait ReasoningPort: Send + Sync {
    async fn invoke(
        &self,
        role: AgentRole,
        prompt: &StructuredPrompt,
        constraints: &Constraints,
    ) -> Result<ReasoningOutput, Billed<ProviderError>>;
}

/// `ReasoningPort` backed by `LlmProvider`s, with one provider per role
/// (falling back to a default).
pub struct ProviderPort {
    default: Arc<dyn LlmProvider>,
    by_role: HashMap<AgentRole, Arc<dyn LlmProvider>>,
}

impl ProviderPort {
    pub fn new(default: Arc<dyn LlmProvider>) -> Self {
        Self {
            default,
            by_role: HashMap::new(),
        }
    }

    /// Route `role` to a specific provider.
    pub fn with_role(mut self, role: AgentRole, provider: Arc<dyn LlmProvider>) -> Self {
        self.by_role.insert(role, provider);
        self
    }

    pub fn provider_for(&self, role: AgentRole) -> &Arc<dyn LlmProvider> {
        self.by_role.get(&role).unwrap_or(&self.default)
    }
}

#[async_trait]
impl ReasoningPort for ProviderPort {
    async fn invoke(
        &self,
        role: AgentRole,
        prompt: &StructuredPrompt,
        constraints: &Constraints,
    ) -> Result<ReasoningOutput, Billed<ProviderError>> {
        let provider = self.provider_for(role);
        let request = CompletionRequest::new(vec![
            ChatMessage::system(format!(
                "{}\n\nRespond with ONLY a JSON object.",
                prompt.instructions
            )),
            ChatMessage::user(prompt.render()),
        ])
        .with_temperature(constraints.temperature)
        .with_max_tokens(constraints.max_tokens);

        let started = Instant::now();
        let response = provider
            .complete(request)
            .await
            .map_err(|e| Billed::free(ProviderError::from(e)))?;
        let latency = started.elapsed();

        let cost = TokenCost::priced(
            u64::from(response.input_tokens),
            u64::from(response.output_tokens),
            provider.cost_per_token(),
        );

        let json = extract_json_object(&response.content);
        let output: serde_json::Value = serde_json::from_str(&json).map_err(|e| {
            warn!(
                role = role.label(),
                raw_response = %response.content,
                error = %e,
                "Model output is not valid JSON"
            );
            Billed::new(
                ProviderError::Transient(format!("unparseable {} output: {e}", role.label())),
                cost.clone(),
            )
        })?;

        debug!(
            role = role.label(),
            model = provider.model_name(),
            tokens = cost.total_tokens(),
            latency_ms = latency.as_millis() as u64,
            "Reasoning call complete"
        );

        Ok(ReasoningOutput {
            output,
            cost,
            latency,
            model: provider.model_name().to_string(),
        })
    }
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::{CompletionResponse, FinishReason};
    use rust_decimal_macros::dec;

    struct FixedLlm {
        name: &'static str,
        response: Result<String, fn() -> LlmError>,
    }

    #[async_trait]
    impl LlmProvider for FixedLlm {
        fn model_name(&self) -> &str {
            self.name
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (dec!(0.001), dec!(0.002))
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            match &self.response {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 100,
                    output_tokens: 50,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(make) => Err(make()),
            }
        }
    }

    fn prompt() -> StructuredPrompt {
        StructuredPrompt::new("classify").section("Email", "hello")
    }

    #[tokio::test]
    async fn provider_port_parses_json_and_prices_call() {
        let port = ProviderPort::new(Arc::new(FixedLlm {
            name: "fixed",
            response: Ok("```json\n{\"intent\": \"other\"}\n```".into()),
        }));
        let out = port
            .invoke(AgentRole::Classifier, &prompt(), &Constraints::new(0.0, 100))
            .await
            .unwrap();
        assert_eq!(out.output["intent"], "other");
        assert_eq!(out.cost.input_tokens, 100);
        assert_eq!(out.cost.usd, dec!(0.2));
        assert_eq!(out.model, "fixed");
    }

    #[tokio::test]
    async fn provider_port_routes_roles() {
        let port = ProviderPort::new(Arc::new(FixedLlm {
            name: "cheap",
            response: Ok("{}".into()),
        }))
        .with_role(
            AgentRole::Writer,
            Arc::new(FixedLlm {
                name: "strong",
                response: Ok("{}".into()),
            }),
        );
        assert_eq!(port.provider_for(AgentRole::Writer).model_name(), "strong");
        assert_eq!(port.provider_for(AgentRole::Classifier).model_name(), "cheap");
    }

    #[tokio::test]
    async fn unparseable_output_is_transient() {
        let port = ProviderPort::new(Arc::new(FixedLlm {
            name: "fixed",
            response: Ok("I'm not sure".into()),
        }));
        let err = port
            .invoke(AgentRole::Writer, &prompt(), &Constraints::new(0.7, 100))
            .await
            .unwrap_err();
        assert!(err.error.is_transient());
        // The tokens were spent even though the reply was unusable.
        assert_eq!(err.cost.input_tokens, 100);
        assert_eq!(err.cost.usd, dec!(0.2));
    }

    #[tokio::test]
    async fn auth_failure_is_fatal() {
        let port = ProviderPort::new(Arc::new(FixedLlm {
            name: "fixed",
            response: Err(|| LlmError::AuthFailed {
                provider: "anthropic".into(),
            }),
        }));
        let err = port
            .invoke(AgentRole::Writer, &prompt(), &Constraints::new(0.7, 100))
            .await
            .unwrap_err();
        assert!(matches!(err.error, ProviderError::Fatal(_)));
        assert!(err.cost.is_zero());
    }

    #[test]
    fn token_cost_accumulates() {
        let mut total = TokenCost::zero();
        total += TokenCost::priced(10, 5, (dec!(0.01), dec!(0.02)));
        total += TokenCost::priced(1, 1, (dec!(0.01), dec!(0.02)));
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 6);
        assert_eq!(total.usd, dec!(0.23));
    }

    #[test]
    fn structured_prompt_skips_empty_sections() {
        let p = StructuredPrompt::new("x")
            .section("Email", "body")
            .section("Feedback", "   ");
        assert!(p.has_section("Email"));
        assert!(!p.has_section("Feedback"));
        assert!(p.render().starts_with("EMAIL:\nbody"));
    }

    #[test]
    fn extract_json_embedded_in_text() {
        let input = "My analysis: {\"intent\": \"other\"} done.";
        let result = extract_json_object(input);
        assert!(result.starts_with('{'));
        assert!(result.ends_with('}'));
    }
}
