use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeChunk {
    pub content: String,
    pub relevance_score: f32,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct KnowledgeQuery {
    pub query: String,
    pub tenant_id: String,
    pub limit: usize,
    pub threshold: f32,
}

/// Retrieves tenant-scoped reference material for action handlers.
#[async_trait]
pub trait KnowledgeProvider: Send + Sync {
    async fn retrieve(&self, request: &KnowledgeQuery) -> Result<Vec<KnowledgeChunk>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopKnowledgeProvider;

#[async_trait]
impl KnowledgeProvider for NoopKnowledgeProvider {
    async fn retrieve(&self, _request: &KnowledgeQuery) -> Result<Vec<KnowledgeChunk>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
struct StaticDocument {
    tenant_id: String,
    source: String,
    content: String,
    terms: HashSet<String>,
}

/// In-memory provider scoring documents by keyword overlap with the query.
#[derive(Debug, Clone, Default)]
pub struct StaticKnowledgeProvider {
    documents: Vec<StaticDocument>,
}

impl StaticKnowledgeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(
        mut self,
        tenant_id: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        self.documents.push(StaticDocument {
            tenant_id: tenant_id.into(),
            source: source.into(),
            terms: terms(&content),
            content,
        });
        self
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl KnowledgeProvider for StaticKnowledgeProvider {
    async fn retrieve(&self, request: &KnowledgeQuery) -> Result<Vec<KnowledgeChunk>> {
        let query_terms = terms(&request.query);
        if query_terms.is_empty() || request.limit == 0 {
            return Ok(Vec::new());
        }

        let mut chunks = self
            .documents
            .iter()
            .filter(|doc| doc.tenant_id == request.tenant_id)
            .filter_map(|doc| {
                let overlap = query_terms.intersection(&doc.terms).count();
                let score = overlap as f32 / query_terms.len() as f32;
                (overlap > 0 && score >= request.threshold).then(|| KnowledgeChunk {
                    content: doc.content.clone(),
                    relevance_score: score,
                    source: doc.source.clone(),
                })
            })
            .collect::<Vec<_>>();

        chunks.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.source.cmp(&b.source))
        });
        chunks.truncate(request.limit);
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(text: &str, limit: usize, threshold: f32) -> KnowledgeQuery {
        KnowledgeQuery {
            query: text.to_owned(),
            tenant_id: "acme".to_owned(),
            limit,
            threshold,
        }
    }

    #[tokio::test]
    async fn ranks_documents_by_overlap_within_the_tenant() {
        let provider = StaticKnowledgeProvider::new()
            .with_document("acme", "faq", "How to reset your password from the login page")
            .with_document("acme", "billing", "Invoices are sent monthly")
            .with_document("other", "leak", "password reset secrets");

        let chunks = provider
            .retrieve(&query("reset password", 5, 0.1))
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source, "faq");
        assert!((chunks[0].relevance_score - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn threshold_and_limit_bound_the_result() {
        let provider = StaticKnowledgeProvider::new()
            .with_document("acme", "a", "onboarding checklist")
            .with_document("acme", "b", "onboarding survey results");

        let chunks = provider
            .retrieve(&query("onboarding survey", 1, 0.0))
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source, "b");

        let strict = provider
            .retrieve(&query("onboarding survey", 5, 0.9))
            .await
            .unwrap();
        assert_eq!(strict.len(), 1);
    }

    #[tokio::test]
    async fn noop_returns_nothing() {
        let chunks = NoopKnowledgeProvider
            .retrieve(&query("anything", 5, 0.0))
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }
}
