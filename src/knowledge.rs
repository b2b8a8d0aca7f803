//! Knowledge Retriever: ranked snippets from a content-addressed index.
//!
//! Documents are keyed by a v5 UUID over their title and content, so loading
//! the same document twice is a no-op. Scoring is lexical: the share of query
//! terms found in the document, boosted 20% per matching keyword and capped
//! at 1.0.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::KnowledgeError;

/// Boost applied per keyword found in content or tags.
const KEYWORD_BOOST: f64 = 0.2;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "you", "your", "our", "are", "with", "that", "this", "from", "have",
    "can", "would", "could", "about", "what", "how", "who", "into", "more", "any", "not", "but",
    "was", "will", "all", "some", "they", "their", "there", "been", "also", "need", "like",
];

/// A document as loaded into the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    /// External id from the source file, if it had one.
    #[serde(default)]
    pub doc_id: Option<String>,
    pub title: String,
    pub content: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Publication year; newer wins ties.
    #[serde(default)]
    pub year: i32,
}

fn default_category() -> String {
    "general".to_string()
}

impl KnowledgeDocument {
    /// Content address of this document.
    pub fn content_id(&self) -> Uuid {
        let key = format!("{}\n\n{}", self.title, self.content);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
    }
}

/// What to search for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    /// Requirement terms used for boosting. Empty means plain semantic search.
    pub keywords: Vec<String>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keywords: Vec::new(),
        }
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub id: Uuid,
    pub document: Arc<KnowledgeDocument>,
    /// In [0, 1].
    pub score: f64,
}

/// The Knowledge Retriever contract. An empty result is not an error.
#[async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn search(
        &self,
        query: &SearchQuery,
        k: usize,
    ) -> Result<Vec<ScoredDocument>, KnowledgeError>;
}

// ── In-memory index ─────────────────────────────────────────────────

struct Entry {
    document: Arc<KnowledgeDocument>,
    terms: HashSet<String>,
    haystack: String,
    tags: Vec<String>,
}

/// Content-addressed in-memory index.
#[derive(Default)]
pub struct InMemoryKnowledgeBase {
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of documents.
    pub async fn from_json_file(path: &Path) -> Result<Self, KnowledgeError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KnowledgeError::Load(format!("{}: {e}", path.display())))?;
        let docs: Vec<KnowledgeDocument> = serde_json::from_str(&raw)
            .map_err(|e| KnowledgeError::Load(format!("{}: {e}", path.display())))?;
        let kb = Self::new();
        let added = kb.add_documents(docs).await;
        info!(path = %path.display(), documents = added, "Knowledge base loaded");
        Ok(kb)
    }

    /// Insert documents, skipping ones already indexed. Returns how many
    /// were new.
    pub async fn add_documents(&self, docs: Vec<KnowledgeDocument>) -> usize {
        let mut entries = self.entries.write().await;
        let mut added = 0;
        for doc in docs {
            let id = doc.content_id();
            if entries.contains_key(&id) {
                debug!(%id, title = %doc.title, "Duplicate document skipped");
                continue;
            }
            let haystack = format!(
                "{} {} {}",
                doc.title,
                doc.content,
                doc.industry.as_deref().unwrap_or_default()
            )
            .to_lowercase();
            let mut terms = tokenize(&haystack);
            let tags: Vec<String> = doc.tags.iter().map(|t| t.to_lowercase()).collect();
            for tag in &tags {
                terms.extend(tokenize(tag));
            }
            entries.insert(
                id,
                Entry {
                    document: Arc::new(doc),
                    terms,
                    haystack,
                    tags,
                },
            );
            added += 1;
        }
        added
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KnowledgeRetriever for InMemoryKnowledgeBase {
    async fn search(
        &self,
        query: &SearchQuery,
        k: usize,
    ) -> Result<Vec<ScoredDocument>, KnowledgeError> {
        let query_terms = tokenize(&query.text.to_lowercase());
        if query_terms.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let keywords: Vec<String> = query
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        let entries = self.entries.read().await;
        let mut hits: Vec<ScoredDocument> = entries
            .iter()
            .filter_map(|(id, entry)| {
                let overlap = query_terms.intersection(&entry.terms).count();
                let mut score = overlap as f64 / query_terms.len() as f64;
                let matches = keywords
                    .iter()
                    .filter(|kw| entry.haystack.contains(kw.as_str()) || entry.tags.contains(kw))
                    .count();
                score *= 1.0 + KEYWORD_BOOST * matches as f64;
                (score > 0.0).then(|| ScoredDocument {
                    id: *id,
                    document: Arc::clone(&entry.document),
                    score: score.min(1.0),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str, content: &str, tags: &[&str], year: i32) -> KnowledgeDocument {
        KnowledgeDocument {
            doc_id: None,
            title: title.into(),
            content: content.into(),
            category: "case_study".into(),
            industry: Some("automotive".into()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            year,
        }
    }

    async fn seeded() -> InMemoryKnowledgeBase {
        let kb = InMemoryKnowledgeBase::new();
        kb.add_documents(vec![
            doc(
                "Defect detection at AutoParts",
                "Computer vision quality control for real-time defect detection on assembly lines.",
                &["quality-control", "computer vision"],
                2023,
            ),
            doc(
                "Retail recommendations",
                "Personalised product recommendation engine for online shopping.",
                &["personalization"],
                2024,
            ),
        ])
        .await;
        kb
    }

    #[tokio::test]
    async fn identical_documents_are_indexed_once() {
        let kb = seeded().await;
        let added = kb
            .add_documents(vec![doc(
                "Retail recommendations",
                "Personalised product recommendation engine for online shopping.",
                &[],
                2020,
            )])
            .await;
        assert_eq!(added, 0);
        assert_eq!(kb.len().await, 2);
    }

    #[tokio::test]
    async fn search_ranks_by_overlap() {
        let kb = seeded().await;
        let hits = kb
            .search(&SearchQuery::new("defect detection quality control"), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.title, "Defect detection at AutoParts");
        assert!(hits[0].score > 0.5 && hits[0].score <= 1.0);
    }

    #[tokio::test]
    async fn keywords_boost_but_cap_at_one() {
        let kb = seeded().await;
        let plain = kb
            .search(&SearchQuery::new("assembly recommendation"), 5)
            .await
            .unwrap();
        let boosted = kb
            .search(
                &SearchQuery::new("assembly recommendation")
                    .with_keywords(vec!["personalization".into()]),
                5,
            )
            .await
            .unwrap();
        let score = |hits: &[ScoredDocument], title: &str| {
            hits.iter()
                .find(|h| h.document.title == title)
                .map(|h| h.score)
                .unwrap()
        };
        assert!(
            score(&boosted, "Retail recommendations") > score(&plain, "Retail recommendations")
        );
        assert!(boosted.iter().all(|h| h.score <= 1.0));
    }

    #[tokio::test]
    async fn no_match_is_empty_not_error() {
        let kb = seeded().await;
        let hits = kb
            .search(&SearchQuery::new("blockchain mining"), 3)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.json");
        std::fs::write(
            &path,
            r#"[{"title": "Pricing", "content": "Enterprise plans start at 500 seats.", "tags": ["pricing"], "year": 2024}]"#,
        )
        .unwrap();
        let kb = InMemoryKnowledgeBase::from_json_file(&path).await.unwrap();
        assert_eq!(kb.len().await, 1);

        let missing = InMemoryKnowledgeBase::from_json_file(&dir.path().join("nope.json")).await;
        assert!(matches!(missing, Err(KnowledgeError::Load(_))));
    }
}
