//! Company Intelligence Lookup.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LookupError;

/// Consumer mailbox providers. A sender on one of these says nothing about
/// their employer.
const FREE_MAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "icloud.com",
    "me.com",
    "aol.com",
    "proton.me",
    "protonmail.com",
    "gmx.de",
    "gmx.net",
    "web.de",
    "mail.com",
];

pub fn is_free_mail_domain(domain: &str) -> bool {
    FREE_MAIL_DOMAINS.contains(&domain.trim().to_lowercase().as_str())
}

/// Structured facts about a company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyFacts {
    pub name: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub products_services: Vec<String>,
    /// e.g. "enterprise", "SME", "startup".
    #[serde(default)]
    pub size: Option<String>,
    /// Facts worth mentioning in a reply.
    #[serde(default)]
    pub key_insights: Vec<String>,
}

/// What to look a company up by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompanyIdentifier {
    Domain(String),
    Name(String),
}

impl std::fmt::Display for CompanyIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(d) => write!(f, "domain:{d}"),
            Self::Name(n) => write!(f, "name:{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupResult {
    Found(CompanyFacts),
    NotFound,
}

/// The Company Intelligence Lookup contract. "Not found" is a result;
/// errors mean the lookup itself could not run.
#[async_trait]
pub trait CompanyLookup: Send + Sync {
    async fn lookup(&self, identifier: &CompanyIdentifier) -> Result<LookupResult, LookupError>;
}

/// A company entry in a directory file.
#[derive(Debug, Clone, Deserialize)]
pub struct CompanyRecord {
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(flatten)]
    pub facts: CompanyFacts,
}

/// Fixed directory keyed by domain and by normalized name.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    by_domain: HashMap<String, CompanyFacts>,
    by_name: HashMap<String, CompanyFacts>,
}

impl StaticDirectory {
    pub fn new(records: Vec<CompanyRecord>) -> Self {
        let mut dir = Self::default();
        for record in records {
            for domain in &record.domains {
                dir.by_domain
                    .insert(domain.trim().to_lowercase(), record.facts.clone());
            }
            dir.by_name
                .insert(normalize_name(&record.facts.name), record.facts);
        }
        dir
    }

    /// Load a JSON array of `CompanyRecord`s.
    pub async fn from_json_file(path: &Path) -> Result<Self, LookupError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LookupError::Load(format!("{}: {e}", path.display())))?;
        let records: Vec<CompanyRecord> = serde_json::from_str(&raw)
            .map_err(|e| LookupError::Load(format!("{}: {e}", path.display())))?;
        let dir = Self::new(records);
        info!(path = %path.display(), companies = dir.len(), "Company directory loaded");
        Ok(dir)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[async_trait]
impl CompanyLookup for StaticDirectory {
    async fn lookup(&self, identifier: &CompanyIdentifier) -> Result<LookupResult, LookupError> {
        let hit = match identifier {
            CompanyIdentifier::Domain(d) => self.by_domain.get(&d.trim().to_lowercase()),
            CompanyIdentifier::Name(n) => self.by_name.get(&normalize_name(n)),
        };
        Ok(hit
            .cloned()
            .map(LookupResult::Found)
            .unwrap_or(LookupResult::NotFound))
    }
}

/// Lower-case, drop punctuation and common legal suffixes.
fn normalize_name(name: &str) -> String {
    const SUFFIXES: &[&str] = &["inc", "ltd", "llc", "gmbh", "ag", "corp", "co", "plc", "sa"];
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !SUFFIXES.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticDirectory {
        StaticDirectory::new(vec![CompanyRecord {
            domains: vec!["AutoParts.de".into()],
            facts: CompanyFacts {
                name: "AutoParts GmbH".into(),
                industry: Some("automotive".into()),
                products_services: vec!["brake systems".into()],
                size: Some("SME".into()),
                key_insights: vec!["Runs three plants in Bavaria".into()],
            },
        }])
    }

    #[tokio::test]
    async fn lookup_by_domain_is_case_insensitive() {
        let dir = directory();
        let hit = dir
            .lookup(&CompanyIdentifier::Domain("autoparts.DE".into()))
            .await
            .unwrap();
        assert!(matches!(hit, LookupResult::Found(ref f) if f.name == "AutoParts GmbH"));
    }

    #[tokio::test]
    async fn lookup_by_name_ignores_legal_suffix() {
        let dir = directory();
        let hit = dir
            .lookup(&CompanyIdentifier::Name("Autoparts".into()))
            .await
            .unwrap();
        assert!(matches!(hit, LookupResult::Found(_)));
    }

    #[tokio::test]
    async fn unknown_company_is_not_found() {
        let hit = directory()
            .lookup(&CompanyIdentifier::Domain("example.org".into()))
            .await
            .unwrap();
        assert_eq!(hit, LookupResult::NotFound);
    }

    #[test]
    fn free_mail_domains() {
        assert!(is_free_mail_domain("Gmail.com"));
        assert!(!is_free_mail_domain("dataflow.io"));
    }

    #[test]
    fn records_parse_with_flattened_facts() {
        let records: Vec<CompanyRecord> = serde_json::from_str(
            r#"[{"name": "DataFlow Inc.", "domains": ["dataflow.io"], "industry": "saas"}]"#,
        )
        .unwrap();
        let dir = StaticDirectory::new(records);
        assert_eq!(dir.len(), 1);
        assert!(dir.by_name.contains_key("dataflow"));
    }
}
