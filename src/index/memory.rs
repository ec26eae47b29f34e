//! In-memory [`VectorIndex`] for tests and throwaway sessions.
//!
//! Documents and chunks live in maps behind `std::sync::RwLock`; queries are
//! a brute-force scan over every stored vector.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{check_batch_dims, check_query_dims, rank, search_result, Filter, VectorIndex};
use crate::embedding::{dot, normalize};
use crate::error::Result;
use crate::models::{Chunk, Document, SearchResult};

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Document>,
    /// Chunks per document, each with a unit-length embedding.
    chunks: HashMap<String, Vec<Chunk>>,
    dims: Option<usize>,
}

pub struct InMemoryVectorIndex {
    inner: RwLock<Inner>,
    threshold: f32,
}

impl InMemoryVectorIndex {
    pub fn new(similarity_threshold: f32) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            threshold: similarity_threshold,
        }
    }

    // A panic while holding the lock cannot leave the maps half-updated:
    // every write below builds its values first and inserts last.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn add(&self, document: &Document, chunks: &[Chunk]) -> Result<()> {
        let expected = self.read().dims;
        let dims = check_batch_dims(chunks, expected)?;

        let stored: Vec<Chunk> = chunks
            .iter()
            .cloned()
            .map(|mut c| {
                normalize(&mut c.embedding);
                c
            })
            .collect();

        let mut inner = self.write();
        // Another writer may have fixed the dimensionality meanwhile.
        check_batch_dims(chunks, inner.dims)?;
        inner.dims = Some(dims);
        inner.docs.insert(document.id.clone(), document.clone());
        inner.chunks.insert(document.id.clone(), stored);
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize, filter: &Filter) -> Result<Vec<SearchResult>> {
        let inner = self.read();
        let Some(dims) = inner.dims else {
            return Ok(Vec::new());
        };
        check_query_dims(vector, dims)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = vector.to_vec();
        normalize(&mut query);

        let mut results = Vec::new();
        for doc in inner.docs.values().filter(|d| filter.matches(d)) {
            for chunk in inner.chunks.get(&doc.id).into_iter().flatten() {
                let similarity = dot(&query, &chunk.embedding);
                if similarity >= self.threshold {
                    results.push(search_result(chunk.clone(), doc.clone(), similarity));
                }
            }
        }

        rank(&mut results, k);
        Ok(results)
    }

    async fn remove_document(&self, id: &str) -> Result<bool> {
        let mut inner = self.write();
        inner.chunks.remove(id);
        Ok(inner.docs.remove(id).is_some())
    }

    async fn chunk_count(&self) -> Result<usize> {
        Ok(self.read().chunks.values().map(Vec::len).sum())
    }

    async fn documents(&self) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self.read().docs.values().cloned().collect();
        docs.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    fn dims(&self) -> Option<usize> {
        self.read().dims
    }

    fn similarity_threshold(&self) -> f32 {
        self.threshold
    }
}
