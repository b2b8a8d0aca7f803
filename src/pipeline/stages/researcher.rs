//! Researcher Stage: company intelligence for the sender.

use std::sync::Arc;

use async_trait::async_trait;

use crate::company::{CompanyIdentifier, CompanyLookup, LookupResult, is_free_mail_domain};
use crate::error::{LookupError, StageError};
use crate::pipeline::stages::{Stage, StageResult, require};
use crate::pipeline::state::PipelineState;
use crate::pipeline::types::{CompanyProfile, StageKind, StageOutput};

pub struct ResearcherStage {
    lookup: Arc<dyn CompanyLookup>,
}

impl ResearcherStage {
    pub fn new(lookup: Arc<dyn CompanyLookup>) -> Self {
        Self { lookup }
    }
}

/// Sender domain first, unless it is a free-mail provider; then the
/// company name the classifier found.
pub fn company_identifier(state: &PipelineState) -> Option<CompanyIdentifier> {
    if let Some(domain) = state.raw_email().sender_domain()
        && !is_free_mail_domain(&domain)
    {
        return Some(CompanyIdentifier::Domain(domain));
    }
    state
        .classification()
        .and_then(|c| c.company_name.clone())
        .map(CompanyIdentifier::Name)
}

#[async_trait]
impl Stage for ResearcherStage {
    type Output = CompanyProfile;

    fn kind(&self) -> StageKind {
        StageKind::Researcher
    }

    async fn run(&self, state: &PipelineState) -> StageResult<CompanyProfile> {
        let stage = self.kind();
        require(stage, state.classification(), "classification")?;

        let Some(identifier) = company_identifier(state) else {
            return Ok(StageOutput::free(CompanyProfile::NotFound {
                reason: "no company identifier in sender or signature".into(),
            }));
        };

        let profile = match self.lookup.lookup(&identifier).await {
            Ok(LookupResult::Found(facts)) => CompanyProfile::Found { facts },
            Ok(LookupResult::NotFound) => CompanyProfile::NotFound {
                reason: format!("no match for {identifier}"),
            },
            Err(LookupError::Unavailable(reason)) => {
                return Err(StageError::retryable(stage, reason).into());
            }
            Err(e @ LookupError::Load(_)) => {
                return Err(StageError::fatal(stage, e.to_string()).into());
            }
        };
        Ok(StageOutput::free(profile))
    }

    /// Missing enrichment only lowers confidence downstream.
    fn fallback(&self, _state: &PipelineState, reason: &str) -> Option<CompanyProfile> {
        Some(CompanyProfile::NotFound {
            reason: format!("lookup failed: {reason}"),
        })
    }
}
