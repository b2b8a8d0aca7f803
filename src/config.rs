//! Configuration types.
//!
//! Every threshold and weight the pipeline uses lives here as a named field.
//! `PipelineConfig::validate()` is called by the orchestrator constructor, so
//! an orchestrator never runs with weights that do not sum to one.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tolerance used for the sum-to-one weight checks.
const WEIGHT_EPSILON: f64 = 1e-6;

/// Weights for the quality rubric dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricWeights {
    /// Claims in the draft are backed by retrieved context or research.
    pub factual_grounding: f64,
    /// Every requirement the sender raised is addressed.
    pub completeness: f64,
    /// Professional, helpful register.
    pub tone: f64,
    /// Concise, clear next step.
    pub clarity: f64,
}

impl Default for RubricWeights {
    fn default() -> Self {
        Self {
            factual_grounding: 0.35,
            completeness: 0.30,
            tone: 0.20,
            clarity: 0.15,
        }
    }
}

impl RubricWeights {
    pub fn sum(&self) -> f64 {
        self.factual_grounding + self.completeness + self.tone + self.clarity
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            ("factual_grounding", self.factual_grounding),
            ("completeness", self.completeness),
            ("tone", self.tone),
            ("clarity", self.clarity),
        ];
        for (name, w) in all {
            if !(0.0..=1.0).contains(&w) {
                return Err(ConfigError::invalid(
                    &format!("quality.weights.{name}"),
                    format!("{w} is outside [0, 1]"),
                ));
            }
        }
        check_sums_to_one("quality.weights", self.sum())
    }
}

/// Quality Gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Gate passes iff `overall >= threshold`.
    pub threshold: f64,
    pub weights: RubricWeights,
    /// Maximum number of Writer re-drafts triggered by the gate.
    pub max_retries: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            weights: RubricWeights::default(),
            max_retries: 2,
        }
    }
}

/// Multipliers applied to the composite confidence by urgency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrgencyFactors {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for UrgencyFactors {
    fn default() -> Self {
        // Urgent mail is held to a stricter bar.
        Self {
            high: 0.95,
            medium: 1.0,
            low: 1.05,
        }
    }
}

/// Decision Stage scoring and routing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    /// Weight of the classifier's confidence in the composite.
    pub classification_weight: f64,
    /// Weight of the quality `overall` score in the composite.
    pub quality_weight: f64,
    /// Subtracted once per Writer retry.
    pub retry_penalty: f64,
    /// Subtracted when the company profile is "not found".
    pub missing_profile_penalty: f64,
    pub urgency_factors: UrgencyFactors,
    /// Composite at or above this (with a passed gate) routes AUTONOMOUS.
    pub auto_threshold: f64,
    /// Composite at or above this routes REVIEW.
    pub review_threshold: f64,
    /// A failed gate with `overall` at or above this floor is recoverable by a human.
    pub recoverable_quality_floor: f64,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            classification_weight: 0.4,
            quality_weight: 0.6,
            retry_penalty: 0.05,
            missing_profile_penalty: 0.05,
            urgency_factors: UrgencyFactors::default(),
            auto_threshold: 0.82,
            review_threshold: 0.65,
            recoverable_quality_floor: 0.5,
        }
    }
}

impl DecisionPolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        check_unit("decision.classification_weight", self.classification_weight)?;
        check_unit("decision.quality_weight", self.quality_weight)?;
        check_sums_to_one(
            "decision.weights",
            self.classification_weight + self.quality_weight,
        )?;
        check_unit("decision.retry_penalty", self.retry_penalty)?;
        check_unit("decision.missing_profile_penalty", self.missing_profile_penalty)?;
        check_unit("decision.auto_threshold", self.auto_threshold)?;
        check_unit("decision.review_threshold", self.review_threshold)?;
        check_unit(
            "decision.recoverable_quality_floor",
            self.recoverable_quality_floor,
        )?;
        if self.review_threshold > self.auto_threshold {
            return Err(ConfigError::invalid(
                "decision.review_threshold",
                format!(
                    "{} must not exceed auto_threshold {}",
                    self.review_threshold, self.auto_threshold
                ),
            ));
        }
        let u = &self.urgency_factors;
        for (name, f) in [("high", u.high), ("medium", u.medium), ("low", u.low)] {
            if !(f > 0.0 && f.is_finite()) {
                return Err(ConfigError::invalid(
                    &format!("decision.urgency_factors.{name}"),
                    format!("{f} must be a positive number"),
                ));
            }
        }
        Ok(())
    }
}

/// Retry policy for transient stage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (so total attempts = 1 + max_retries).
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f32,
    pub max_backoff_ms: u64,
    /// Fraction of the delay randomised in either direction.
    pub jitter_factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 2_000,
            jitter_factor: 0.1,
        }
    }
}

/// Complete orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub quality: QualityConfig,
    pub decision: DecisionPolicy,
    pub retry: RetryPolicy,
    /// K for the Retrieval Stage.
    pub retrieval_top_k: usize,
    /// Run Researcher and Retrieval concurrently.
    pub parallel_enrichment: bool,
    /// Bound on every external call.
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality: QualityConfig::default(),
            decision: DecisionPolicy::default(),
            retry: RetryPolicy::default(),
            retrieval_top_k: 3,
            parallel_enrichment: true,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Check every named invariant. Called at orchestrator construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("quality.threshold", self.quality.threshold)?;
        self.quality.weights.validate()?;
        self.decision.validate()?;
        if self.retrieval_top_k == 0 {
            return Err(ConfigError::invalid("retrieval_top_k", "must be at least 1"));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::invalid("call_timeout", "must be non-zero"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "retry.backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        Ok(())
    }

    /// Overlay `AGENTFLOW_*` threshold overrides from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_parse::<f64>("AGENTFLOW_QUALITY_THRESHOLD")? {
            config.quality.threshold = v;
        }
        if let Some(v) = env_parse::<u32>("AGENTFLOW_MAX_RETRIES")? {
            config.quality.max_retries = v;
        }
        if let Some(v) = env_parse::<f64>("AGENTFLOW_AUTO_THRESHOLD")? {
            config.decision.auto_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("AGENTFLOW_REVIEW_THRESHOLD")? {
            config.decision.review_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("AGENTFLOW_TOP_K")? {
            config.retrieval_top_k = v;
        }
        if let Some(v) = env_parse::<u64>("AGENTFLOW_CALL_TIMEOUT_SECS")? {
            config.call_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<bool>("AGENTFLOW_PARALLEL_ENRICHMENT")? {
            config.parallel_enrichment = v;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Process-level settings for the server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// JSON array of knowledge documents.
    pub knowledge_path: Option<PathBuf>,
    /// JSON array of company profiles.
    pub company_path: Option<PathBuf>,
    /// Max concurrent pipeline invocations for batch processing.
    pub max_concurrent: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_parse("AGENTFLOW_PORT")?.unwrap_or(8000),
            db_path: std::env::var("AGENTFLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/history.db")),
            knowledge_path: std::env::var("AGENTFLOW_KNOWLEDGE_PATH").ok().map(PathBuf::from),
            company_path: std::env::var("AGENTFLOW_COMPANY_PATH").ok().map(PathBuf::from),
            max_concurrent: env_parse("AGENTFLOW_MAX_CONCURRENT")?.unwrap_or(8),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}

fn check_unit(key: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(key, format!("{value} is outside [0, 1]")))
    }
}

fn check_sums_to_one(key: &str, sum: f64) -> Result<(), ConfigError> {
    if (sum - 1.0).abs() <= WEIGHT_EPSILON {
        Ok(())
    } else {
        Err(ConfigError::invalid(key, format!("weights sum to {sum}, expected 1.0")))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
