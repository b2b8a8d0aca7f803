//! LLM integration for AgentFlow.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! Uses the rig-core crate for HTTP transport and the `RigAdapter` to bridge
//! rig's `CompletionModel` trait to our `LlmProvider` trait. Stages never see
//! a provider directly; they go through the `ReasoningPort`.

mod costs;
pub mod provider;
pub mod reasoning;
mod rig_adapter;

pub use costs::model_cost;
pub use provider::*;
pub use reasoning::{
    AgentRole, Billed, Constraints, ProviderPort, ReasoningOutput, ReasoningPort, StructuredPrompt,
    TokenCost, extract_json_object,
};
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, LlmError};

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl std::str::FromStr for LlmBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "gpt" => Ok(Self::OpenAi),
            other => Err(ConfigError::invalid(
                "AGENTFLOW_LLM_BACKEND",
                format!("unknown backend '{other}'"),
            )),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    /// Default model for every role.
    pub model: String,
    /// Cheaper model for classification and quality review, if set.
    pub fast_model: Option<String>,
}

impl LlmConfig {
    /// Read backend, key and model names from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend: LlmBackend = std::env::var("AGENTFLOW_LLM_BACKEND")
            .unwrap_or_else(|_| "anthropic".to_string())
            .parse()?;
        let key_var = match backend {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };
        let api_key = std::env::var(key_var)
            .map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;
        let default_model = match backend {
            LlmBackend::Anthropic => "claude-3-5-sonnet-latest",
            LlmBackend::OpenAi => "gpt-4o",
        };
        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model: std::env::var("AGENTFLOW_MODEL").unwrap_or_else(|_| default_model.to_string()),
            fast_model: std::env::var("AGENTFLOW_FAST_MODEL").ok(),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig, model: &str) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config, model),
        LlmBackend::OpenAi => create_openai_provider(config, model),
    }
}

/// Build the reasoning port: the default model serves every role, and the
/// fast model (when configured) takes classification and quality review.
pub fn create_reasoning_port(config: &LlmConfig) -> Result<ProviderPort, LlmError> {
    let default = create_provider(config, &config.model)?;
    let mut port = ProviderPort::new(default);
    if let Some(ref fast) = config.fast_model {
        let fast = create_provider(config, fast)?;
        port = port
            .with_role(AgentRole::Classifier, Arc::clone(&fast))
            .with_role(AgentRole::QualityReviewer, fast);
    }
    Ok(port)
}

fn create_anthropic_provider(
    config: &LlmConfig,
    model: &str,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let completion_model = client.completion_model(model);
    tracing::info!("Using Anthropic (model: {})", model);
    Ok(Arc::new(RigAdapter::new(completion_model, model, "anthropic")))
}

fn create_openai_provider(
    config: &LlmConfig,
    model: &str,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let completion_model = client.completion_model(model);
    tracing::info!("Using OpenAI (model: {})", model);
    Ok(Arc::new(RigAdapter::new(completion_model, model, "openai")))
}
