//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait stores embedded chunks together with their
//! parent document's metadata and answers nearest-neighbour queries over
//! them. Two backends share the contract:
//!
//! - [`InMemoryVectorIndex`]: `RwLock`-guarded maps with a linear scan.
//! - [`SqliteVectorIndex`]: persistent; filter predicates on indexed
//!   columns are pushed down into SQL, vectors are scored in Rust.
//!
//! Both score by dot product over L2-normalized vectors (cosine similarity),
//! drop anything below the configured similarity threshold, and reject
//! vectors whose dimensionality differs from what the index already holds.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::models::{Chunk, Confidentiality, Document, SearchResult};

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Stores a ready document and its embedded chunks, replacing any
    /// chunks previously stored for the same document id.
    async fn add(&self, document: &Document, chunks: &[Chunk]) -> Result<()>;

    /// Returns up to `k` chunks from documents matching `filter`, most
    /// similar first, none below the similarity threshold.
    async fn query(&self, vector: &[f32], k: usize, filter: &Filter) -> Result<Vec<SearchResult>>;

    /// Removes a document and its chunks. Returns whether anything was removed.
    async fn remove_document(&self, id: &str) -> Result<bool>;

    async fn chunk_count(&self) -> Result<usize>;

    async fn documents(&self) -> Result<Vec<Document>>;

    /// Dimensionality of the stored vectors, once the first batch is added.
    fn dims(&self) -> Option<usize>;

    fn similarity_threshold(&self) -> f32;
}

/// A conjunction of predicates over document metadata.
///
/// Unset fields match everything. Text comparisons are case-insensitive.
/// `max_confidentiality` is a clearance: documents at that level or below match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Filter {
    pub source_type: Option<String>,
    pub department: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub max_confidentiality: Option<Confidentiality>,
    pub uploaded_after: Option<DateTime<Utc>>,
    pub uploaded_before: Option<DateTime<Utc>>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        *self == Filter::default()
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(after), Some(before)) = (self.uploaded_after, self.uploaded_before) {
            if after > before {
                return Err(RagError::input(format!(
                    "invalid filter: uploaded_after ({}) is later than uploaded_before ({})",
                    after.to_rfc3339(),
                    before.to_rfc3339()
                )));
            }
        }
        for (name, value) in [
            ("source_type", &self.source_type),
            ("department", &self.department),
            ("category", &self.category),
            ("tag", &self.tag),
        ] {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                return Err(RagError::input(format!("invalid filter: {} is blank", name)));
            }
        }
        Ok(())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        fn same(want: &Option<String>, have: Option<&str>) -> bool {
            match want {
                None => true,
                Some(w) => have.is_some_and(|h| h.trim().to_lowercase() == w.trim().to_lowercase()),
            }
        }

        let meta = &doc.metadata;
        same(&self.source_type, Some(&doc.source_type))
            && same(&self.department, meta.department.as_deref())
            && same(&self.category, meta.category.as_deref())
            && self.tag.as_ref().is_none_or(|want| {
                meta.tags
                    .iter()
                    .any(|t| t.trim().to_lowercase() == want.trim().to_lowercase())
            })
            && self
                .max_confidentiality
                .is_none_or(|clearance| meta.confidentiality <= clearance)
            && self.uploaded_after.is_none_or(|t| doc.uploaded_at >= t)
            && self.uploaded_before.is_none_or(|t| doc.uploaded_at <= t)
    }

    /// Stable text form used in cache keys.
    pub fn canonical(&self) -> String {
        let normalized = Filter {
            source_type: self.source_type.as_ref().map(|s| s.trim().to_lowercase()),
            department: self.department.as_ref().map(|s| s.trim().to_lowercase()),
            category: self.category.as_ref().map(|s| s.trim().to_lowercase()),
            tag: self.tag.as_ref().map(|s| s.trim().to_lowercase()),
            ..self.clone()
        };
        serde_json::to_string(&normalized).unwrap_or_default()
    }
}

/// Checks a batch of chunks against the index dimensionality, returning the
/// batch's own dimensionality.
pub(crate) fn check_batch_dims(chunks: &[Chunk], expected: Option<usize>) -> Result<usize> {
    let mut dims = expected;
    for chunk in chunks {
        if chunk.embedding.is_empty() {
            return Err(RagError::Internal(format!(
                "chunk {} has not been embedded",
                chunk.id
            )));
        }
        match dims {
            Some(d) if d != chunk.embedding.len() => {
                return Err(RagError::DimensionMismatch {
                    expected: d,
                    actual: chunk.embedding.len(),
                })
            }
            Some(_) => {}
            None => dims = Some(chunk.embedding.len()),
        }
    }
    dims.ok_or_else(|| RagError::input("no chunks to index"))
}

pub(crate) fn check_query_dims(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(RagError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Most similar first; ties broken by document then chunk position so
/// results are deterministic.
pub(crate) fn rank(results: &mut Vec<SearchResult>, k: usize) {
    results.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.chunk.document_id.cmp(&b.chunk.document_id))
            .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
    });
    results.truncate(k);
}

/// Builds a result; the stored vector is not carried along.
pub(crate) fn search_result(mut chunk: Chunk, document: Document, similarity: f32) -> SearchResult {
    chunk.embedding = Vec::new();
    let similarity = similarity.clamp(-1.0, 1.0);
    SearchResult {
        context_snippet: chunk.text.clone(),
        relevance_score: similarity.max(0.0),
        chunk,
        document,
        similarity,
    }
}
