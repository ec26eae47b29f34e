//! Query-time retrieval: embed, search, re-rank.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::embedding::{EmbeddingProvider, HashingEmbedder, DEFAULT_HASH_DIMS};
use crate::error::Result;
use crate::index::{Filter, VectorIndex};
use crate::models::SearchResult;

/// Weight of vector similarity in the blended relevance score.
const SIMILARITY_WEIGHT: f32 = 0.8;
const KEYWORD_WEIGHT: f32 = 0.2;

/// Ranked results for one query.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub results: Vec<SearchResult>,
    /// The query was embedded with the hashing fallback.
    pub degraded: bool,
}

pub struct Retriever {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    max_chunks: usize,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        max_chunks: usize,
    ) -> Self {
        Self {
            embedder,
            index,
            max_chunks: max_chunks.max(1),
        }
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    pub async fn retrieve(&self, query: &str, filter: &Filter) -> Result<Retrieval> {
        let (vector, degraded) = match self.embedder.embed(query).await {
            Ok(vector) => (vector, false),
            Err(e) => {
                let dims = self
                    .index
                    .dims()
                    .unwrap_or_else(|| match self.embedder.dims() {
                        0 => DEFAULT_HASH_DIMS,
                        d => d,
                    });
                warn!(
                    error = %e,
                    dims,
                    "query embedding failed; falling back to bag-of-words hashing"
                );
                (HashingEmbedder::new(dims).embed_sync(query), true)
            }
        };

        let mut results = self
            .index
            .query(&vector, self.max_chunks * 2, filter)
            .await?;

        let terms = query_terms(query);
        for result in &mut results {
            result.relevance_score = relevance(result.similarity, &terms, &result.chunk.text);
        }
        results.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then_with(|| b.similarity.total_cmp(&a.similarity))
        });
        results.truncate(self.max_chunks);

        debug!(
            results = results.len(),
            degraded,
            "retrieved context"
        );
        Ok(Retrieval { results, degraded })
    }
}

/// Distinct lower-cased alphanumeric terms of the query.
fn query_terms(query: &str) -> HashSet<String> {
    crate::embedding::tokens(query).collect()
}

/// Fraction of `terms` that appear in `text`, case-insensitively.
pub fn keyword_overlap(terms: &HashSet<String>, text: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}

pub fn relevance(similarity: f32, terms: &HashSet<String>, text: &str) -> f32 {
    (similarity.clamp(0.0, 1.0) * SIMILARITY_WEIGHT + keyword_overlap(terms, text) * KEYWORD_WEIGHT)
        .clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_overlap() {
        let terms = query_terms("What is the REFUND window?");
        let ratio = keyword_overlap(&terms, "The refund window is 30 days.");
        assert!((ratio - 0.8).abs() < 1e-6);
        assert_eq!(keyword_overlap(&HashSet::new(), "anything"), 0.0);
    }

    #[test]
    fn test_relevance_bounds() {
        let terms = query_terms("refund");
        assert!((relevance(1.0, &terms, "refund") - 1.0).abs() < 1e-6);
        assert_eq!(relevance(-0.5, &terms, "nothing here"), 0.0);
        assert!((relevance(0.5, &terms, "no match") - 0.4).abs() < 1e-6);
    }
}
