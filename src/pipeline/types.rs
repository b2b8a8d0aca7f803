//! Shared types for the email pipeline.

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::company::CompanyFacts;
use crate::error::PipelineError;
use crate::llm::TokenCost;

static EMAIL_DOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9.\-]+\.[A-Za-z]{2,})\s*>?\s*$").unwrap());

// ── Inbound email ───────────────────────────────────────────────────

/// The immutable input to one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEmail {
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    pub body: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl RawEmail {
    pub fn new(
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    /// Sender and body must be non-empty.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sender.trim().is_empty() {
            return Err(PipelineError::Validation("sender must not be empty".into()));
        }
        if self.body.trim().is_empty() {
            return Err(PipelineError::Validation("body must not be empty".into()));
        }
        Ok(())
    }

    /// Lower-cased domain of the sender address, if it has one.
    pub fn sender_domain(&self) -> Option<String> {
        EMAIL_DOMAIN
            .captures(self.sender.trim())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_lowercase())
    }

    /// Parse an RFC 822 / MIME message.
    pub fn from_rfc822(raw: &[u8]) -> Result<Self, PipelineError> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| PipelineError::Validation("not a parseable email message".into()))?;

        let sender = parsed
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .unwrap_or_default();
        let subject = parsed.subject().unwrap_or_default().to_string();
        let body = if let Some(text) = parsed.body_text(0) {
            text.to_string()
        } else if let Some(html) = parsed.body_html(0) {
            strip_html(html.as_ref())
        } else {
            String::new()
        };
        let received_at = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or_else(Utc::now);

        let email = Self {
            sender,
            subject,
            body,
            received_at,
        };
        email.validate()?;
        Ok(email)
    }
}

/// Naive tag stripper for HTML-only messages.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Classification ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    SalesInquiry,
    SupportRequest,
    Partnership,
    Other,
}

impl Intent {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SalesInquiry => "sales_inquiry",
            Self::SupportRequest => "support_request",
            Self::Partnership => "partnership",
            Self::Other => "other",
        }
    }

    /// Lenient parse of model output; unknown labels map to `Other`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "sales_inquiry" | "sales" => Self::SalesInquiry,
            "support_request" | "support" => Self::SupportRequest,
            "partnership" => Self::Partnership,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    High,
    Medium,
    Low,
}

impl Urgency {
    pub fn label(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Lenient parse of model output; unknown labels map to `Medium`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" | "urgent" | "critical" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// Output of the Classifier Stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub urgency: Urgency,
    /// In [0, 1].
    pub confidence: f64,
    /// Formal company name from the signature or sender, when present.
    pub company_name: Option<String>,
    /// The sender's explicit asks, in order.
    pub key_requirements: Vec<String>,
}

// ── Research ────────────────────────────────────────────────────────

/// Output of the Researcher Stage: facts, or an explicit "not found" marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompanyProfile {
    Found { facts: CompanyFacts },
    NotFound { reason: String },
}

impl CompanyProfile {
    pub fn facts(&self) -> Option<&CompanyFacts> {
        match self {
            Self::Found { facts } => Some(facts),
            Self::NotFound { .. } => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found { .. })
    }
}

// ── Retrieval ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Query text plus requirement keywords.
    HybridKeywords,
    /// Query text only.
    Semantic,
    /// Retriever unavailable; context intentionally empty.
    Unavailable,
}

/// One ranked knowledge snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSnippet {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub category: String,
    /// Publication year, used to break score ties.
    pub year: i32,
    /// In [0, 1].
    pub relevance_score: f64,
    pub why_relevant: String,
}

/// Output of the Retrieval Stage. `snippets` may be empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub query: String,
    pub strategy: RetrievalStrategy,
    pub snippets: Vec<RetrievedSnippet>,
}

impl RetrievedContext {
    pub fn empty(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            strategy: RetrievalStrategy::Unavailable,
            snippets: Vec::new(),
        }
    }
}

// ── Draft ───────────────────────────────────────────────────────────

/// Output of the Writer Stage. Only the latest draft is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftResponse {
    pub subject: String,
    pub body: String,
    pub tone: String,
    pub key_points: Vec<String>,
    pub model_used: String,
    pub token_cost: TokenCost,
    /// 1 for the first draft, incremented per re-draft.
    pub attempt: u32,
}

// ── Quality ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "high" | "critical" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: Severity,
    pub issue: String,
    pub suggestion: String,
}

/// Per-dimension rubric scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RubricScores {
    pub factual_grounding: f64,
    pub completeness: f64,
    pub tone: f64,
    pub clarity: f64,
}

impl RubricScores {
    pub fn dimensions(&self) -> [(&'static str, f64); 4] {
        [
            ("factual_grounding", self.factual_grounding),
            ("completeness", self.completeness),
            ("tone", self.tone),
            ("clarity", self.clarity),
        ]
    }
}

/// Output of one Quality Gate pass. Recomputed fresh every pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub scores: RubricScores,
    /// Weighted sum of `scores`.
    pub overall: f64,
    pub passed: bool,
    pub issues: Vec<QualityIssue>,
    #[serde(default)]
    pub requirements_addressed: Vec<String>,
    pub requirements_missed: Vec<String>,
    /// Free-text guidance handed to the Writer on a retry.
    pub feedback: String,
    /// Draft attempt these scores belong to.
    pub attempt: u32,
    /// Produced by the rule-based check because the reviewer model was
    /// unavailable. Degraded scores never pass the gate.
    #[serde(default)]
    pub degraded: bool,
}

impl QualityScores {
    pub fn worst_severity(&self) -> Option<Severity> {
        self.issues.iter().map(|i| i.severity).max()
    }
}

// ── Decision ────────────────────────────────────────────────────────

/// Terminal routing outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Autonomous,
    Review,
    Escalate,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Autonomous => "AUTONOMOUS",
            Self::Review => "REVIEW",
            Self::Escalate => "ESCALATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AUTONOMOUS" => Some(Self::Autonomous),
            "REVIEW" => Some(Self::Review),
            "ESCALATE" => Some(Self::Escalate),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPriority {
    Low,
    Medium,
    High,
}

/// Every factor that went into the composite confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub classification_confidence: f64,
    pub quality_overall: f64,
    /// Weighted classification + quality, before penalties.
    pub weighted_base: f64,
    pub retry_penalty: f64,
    pub missing_profile_penalty: f64,
    pub urgency_factor: f64,
    pub quality_passed: bool,
    /// Set when an upstream Fatal failure forced the verdict.
    pub forced_by_failure: bool,
}

/// The terminal field. Its presence marks the state as terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    /// Composite confidence in [0, 1].
    pub confidence: f64,
    pub rationale: String,
    pub priority: ReviewPriority,
    pub estimated_review_minutes: u32,
    pub breakdown: ConfidenceBreakdown,
    pub decided_at: DateTime<Utc>,
}

// ── Stages ──────────────────────────────────────────────────────────

/// The six pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Classifier,
    Researcher,
    Retrieval,
    Writer,
    QualityGate,
    Decision,
}

impl StageKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Classifier => "classifier",
            Self::Researcher => "researcher",
            Self::Retrieval => "retrieval",
            Self::Writer => "writer",
            Self::QualityGate => "quality_gate",
            Self::Decision => "decision",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A Fatal stage failure recorded on the state before the forced decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: StageKind,
    pub reason: String,
}

/// What a stage produced, plus what producing it cost.
#[derive(Debug, Clone)]
pub struct StageOutput<T> {
    pub value: T,
    pub cost: TokenCost,
}

impl<T> StageOutput<T> {
    pub fn free(value: T) -> Self {
        Self {
            value,
            cost: TokenCost::zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_sender_and_body() {
        assert!(RawEmail::new("", "s", "body").validate().is_err());
        assert!(RawEmail::new("a@b.com", "s", "   ").validate().is_err());
        assert!(RawEmail::new("a@b.com", "", "body").validate().is_ok());
    }

    #[test]
    fn sender_domain_handles_display_names() {
        let email = RawEmail::new("Sarah Chen <sarah@DataFlow.io>", "", "x");
        assert_eq!(email.sender_domain().as_deref(), Some("dataflow.io"));
        let bare = RawEmail::new("bob@autoparts.de", "", "x");
        assert_eq!(bare.sender_domain().as_deref(), Some("autoparts.de"));
        assert_eq!(RawEmail::new("bob", "", "x").sender_domain(), None);
    }

    #[test]
    fn from_rfc822_extracts_fields() {
        let raw = b"From: Michael Schmidt <michael@techcorp.de>\r\n\
                    To: sales@example.com\r\n\
                    Subject: Partnership Inquiry\r\n\
                    Date: Tue, 14 Jan 2025 10:00:00 +0000\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    We need automated email responses.\r\n";
        let email = RawEmail::from_rfc822(raw).unwrap();
        assert_eq!(email.sender, "michael@techcorp.de");
        assert_eq!(email.subject, "Partnership Inquiry");
        assert!(email.body.contains("automated email responses"));
        assert_eq!(email.received_at.timestamp(), 1_736_848_800);
    }

    #[test]
    fn from_rfc822_rejects_message_without_body() {
        let raw = b"From: a@b.com\r\nSubject: empty\r\n\r\n";
        assert!(RawEmail::from_rfc822(raw).is_err());
    }

    #[test]
    fn strip_html_collapses_tags() {
        assert_eq!(strip_html("<p>Hello <b>there</b></p>"), "Hello there");
    }

    #[test]
    fn lenient_parsers() {
        assert_eq!(Intent::parse_lenient("Support Request"), Intent::SupportRequest);
        assert_eq!(Intent::parse_lenient("billing"), Intent::Other);
        assert_eq!(Urgency::parse_lenient("URGENT"), Urgency::High);
        assert_eq!(Urgency::parse_lenient("whenever"), Urgency::Medium);
        assert_eq!(Severity::parse_lenient("critical"), Severity::High);
    }

    #[test]
    fn verdict_serializes_screaming_case() {
        let json = serde_json::to_value(Verdict::Autonomous).unwrap();
        assert_eq!(json, "AUTONOMOUS");
        assert_eq!(Verdict::parse("REVIEW"), Some(Verdict::Review));
    }

    #[test]
    fn company_profile_not_found_is_tagged() {
        let profile = CompanyProfile::NotFound {
            reason: "no match".into(),
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["status"], "not_found");
        assert!(!profile.is_found());
    }
}
