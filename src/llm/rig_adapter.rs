//! Bridges rig-core's `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionError, CompletionModel};
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::costs::model_cost;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Wraps any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
    input_cost: Decimal,
    output_cost: Decimal,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        let (input_cost, output_cost) = model_cost(model_name);
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
            input_cost,
            output_cost,
        }
    }

    fn map_error(&self, err: CompletionError) -> LlmError {
        let reason = err.to_string();
        let lower = reason.to_lowercase();
        if lower.contains("401") || lower.contains("authentication") || lower.contains("api key") {
            return LlmError::AuthFailed {
                provider: self.provider.to_string(),
            };
        }
        if lower.contains("429") || lower.contains("rate limit") {
            return LlmError::RateLimited {
                provider: self.provider.to_string(),
                retry_after: None,
            };
        }
        if lower.contains("model") && (lower.contains("not found") || lower.contains("404")) {
            return LlmError::ModelNotAvailable {
                provider: self.provider.to_string(),
                model: self.model_name.clone(),
            };
        }
        match err {
            CompletionError::ResponseError(reason) => LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason,
            },
            _ => LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason,
            },
        }
    }
}

/// Split chat messages into (preamble, prompt). System messages become the
/// preamble; everything else is folded into a single prompt in order.
fn split_messages(messages: &[ChatMessage]) -> (String, String) {
    let mut preamble = Vec::new();
    let mut prompt = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => preamble.push(msg.content.as_str()),
            Role::User => prompt.push(msg.content.clone()),
            Role::Assistant => prompt.push(format!("Assistant: {}", msg.content)),
        }
    }
    (preamble.join("\n\n"), prompt.join("\n\n"))
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (self.input_cost, self.output_cost)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, prompt) = split_messages(&request.messages);

        let mut builder = self.model.completion_request(prompt);
        if !preamble.is_empty() {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.to_string(),
                reason: "empty completion".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}
