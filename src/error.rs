//! Error types for AgentFlow.

use std::time::Duration;

use crate::pipeline::types::StageKind;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Knowledge error: {0}")]
    Knowledge(#[from] KnowledgeError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// LLM transport errors, as reported by a concrete provider.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Context length exceeded: {used} tokens used, {limit} allowed")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("Model {model} not available on provider {provider}")]
    ModelNotAvailable { provider: String, model: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of the Language Reasoning Port, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Worth retrying: rate limits, network failures, malformed output, timeouts.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Retrying cannot help: auth, unknown model, oversized prompt.
    #[error("fatal provider failure: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<LlmError> for ProviderError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RequestFailed { .. }
            | LlmError::RateLimited { .. }
            | LlmError::InvalidResponse { .. }
            | LlmError::Json(_) => Self::Transient(err.to_string()),
            LlmError::ContextLengthExceeded { .. }
            | LlmError::ModelNotAvailable { .. }
            | LlmError::AuthFailed { .. } => Self::Fatal(err.to_string()),
        }
    }
}

/// Knowledge Retriever errors. An empty result is not an error.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("Knowledge index unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to load knowledge base: {0}")]
    Load(String),
}

/// Company Intelligence Lookup errors. "Not found" is a result, not an error.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Company lookup unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to load company directory: {0}")]
    Load(String),
}

/// Failure of a single stage execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// Transient call-layer failure; the orchestrator retries with backoff.
    #[error("{stage} failed (retryable): {reason}")]
    Retryable { stage: StageKind, reason: String },

    /// Exhausted retries or an unrecoverable call failure.
    #[error("{stage} failed: {reason}")]
    Fatal { stage: StageKind, reason: String },

    /// A stage was handed a state missing its prerequisite, or tried to
    /// overwrite a committed field.
    #[error("sequence violation in {stage}: {reason}")]
    Sequence { stage: StageKind, reason: String },
}

impl StageError {
    pub fn retryable(stage: StageKind, reason: impl Into<String>) -> Self {
        Self::Retryable {
            stage,
            reason: reason.into(),
        }
    }

    pub fn fatal(stage: StageKind, reason: impl Into<String>) -> Self {
        Self::Fatal {
            stage,
            reason: reason.into(),
        }
    }

    pub fn sequence(stage: StageKind, reason: impl Into<String>) -> Self {
        Self::Sequence {
            stage,
            reason: reason.into(),
        }
    }

    /// Map a provider failure raised inside `stage`.
    pub fn from_provider(stage: StageKind, err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(reason) => Self::Retryable { stage, reason },
            ProviderError::Fatal(reason) => Self::Fatal { stage, reason },
        }
    }

    pub fn stage(&self) -> StageKind {
        match self {
            Self::Retryable { stage, .. } | Self::Fatal { stage, .. } | Self::Sequence { stage, .. } => {
                *stage
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Errors returned by the orchestrator entry points.
///
/// Stage failures never surface here: they end in an ESCALATE decision.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Sequence error: {0}")]
    Sequence(String),

    #[error("Request {request_id} was cancelled")]
    Cancelled { request_id: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
