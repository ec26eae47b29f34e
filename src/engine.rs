//! The [`RagEngine`] facade.
//!
//! Ingestion: `upload → TextExtractor → Chunker → EmbeddingProvider → VectorIndex`.
//! Query: `question → ResponseCache → Retriever → Generator → ResponseCache`.
//!
//! The engine keeps a registry of every document it has seen, including ones
//! still processing or failed. Only documents that finished ingestion reach
//! the index, so queries never see partial documents.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cache::{cache_key, CachedResponse, ResponseCache};
use crate::chunk::Chunker;
use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::extract::{mime_from_name, PlainTextExtractor, TextExtractor};
use crate::generate::Generator;
use crate::index::{Filter, InMemoryVectorIndex, SqliteVectorIndex, VectorIndex};
use crate::llm::{create_llm_client, LlmClient};
use crate::models::{Answer, Chunk, Document, DocumentMetadata, DocumentStatus, Stats, Upload};
use crate::retrieve::Retriever;

pub struct RagEngine {
    config: Config,
    chunker: Chunker,
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    retriever: Retriever,
    generator: Generator,
    cache: Arc<ResponseCache>,
    documents: RwLock<HashMap<String, Document>>,
    sweeper: Option<JoinHandle<()>>,
}

impl RagEngine {
    /// Assembles an engine from explicit parts.
    ///
    /// Starts the cache sweeper when `cache.sweep_interval_secs > 0` and a
    /// Tokio runtime is available.
    pub fn new(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmClient>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        let max_chunks = config.retrieval.max_chunks_per_query;
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(config.cache.ttl_secs)));

        let sweeper = match config.cache.sweep_interval_secs {
            0 => None,
            secs => tokio::runtime::Handle::try_current()
                .ok()
                .map(|_| cache.spawn_sweeper(Duration::from_secs(secs))),
        };

        Self {
            chunker: Chunker::from_config(&config.chunking),
            extractor: Arc::new(PlainTextExtractor),
            retriever: Retriever::new(embedder.clone(), index.clone(), max_chunks),
            generator: Generator::new(llm, max_chunks, config.llm.max_tokens, config.llm.temperature),
            embedder,
            index,
            cache,
            documents: RwLock::new(HashMap::new()),
            sweeper,
            config,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Builds the providers and index named in `config` and loads the
    /// documents already present in the index.
    pub async fn from_config(config: Config) -> Result<Self> {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        let llm: Arc<dyn LlmClient> = Arc::from(create_llm_client(&config.llm)?);
        let threshold = config.retrieval.similarity_threshold;
        let index: Arc<dyn VectorIndex> = match config.index.backend.as_str() {
            "memory" => Arc::new(InMemoryVectorIndex::new(threshold)),
            "sqlite" => Arc::new(SqliteVectorIndex::open(&config.index.path, threshold).await?),
            other => {
                return Err(RagError::input(format!("unknown index backend: {}", other)));
            }
        };

        let engine = Self::new(config, embedder, llm, index);
        engine.hydrate().await?;
        Ok(engine)
    }

    /// Registers every document already held by the index.
    pub async fn hydrate(&self) -> Result<usize> {
        let docs = self.index.documents().await?;
        let count = docs.len();
        let mut registry = self.registry_write();
        for doc in docs {
            registry.insert(doc.id.clone(), doc);
        }
        debug!(count, "loaded documents from index");
        Ok(count)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    fn registry_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Document>> {
        self.documents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Document>> {
        self.documents.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Extracts, chunks, embeds and indexes an upload.
    ///
    /// Empty, unreadable or unsupported uploads are rejected before any
    /// document is registered. Once registered, a document ends up either
    /// `ready` (returned) or `error` (the failure is returned and the
    /// document keeps the detail).
    pub async fn add_document(&self, upload: Upload, metadata: DocumentMetadata) -> Result<Document> {
        let name = upload.name.trim().to_string();
        if name.is_empty() {
            return Err(RagError::input("document name is empty"));
        }
        if upload.bytes.is_empty() {
            return Err(RagError::input(format!("document '{}' is empty", name)));
        }

        let mime = upload
            .mime_hint
            .as_deref()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| mime_from_name(&name).to_string());
        let source_type = mime.split(';').next().unwrap_or(&mime).trim().to_string();
        let size_bytes = upload.bytes.len() as u64;

        let extractor = self.extractor.clone();
        let bytes = upload.bytes;
        let mime_for_task = mime.clone();
        let text = tokio::task::spawn_blocking(move || extractor.extract(&bytes, &mime_for_task))
            .await
            .map_err(|e| RagError::Internal(format!("extraction task failed: {}", e)))??;
        if text.trim().is_empty() {
            return Err(RagError::input(format!(
                "document '{}' contains no text",
                name
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let chunks = self.chunker.split(&id, &text);
        if chunks.is_empty() {
            return Err(RagError::input(format!(
                "document '{}' produced no chunks",
                name
            )));
        }

        let mut document = Document {
            id: id.clone(),
            name,
            source_type,
            size_bytes,
            uploaded_at: Utc::now(),
            metadata,
            status: DocumentStatus::Processing,
            error_detail: None,
        };
        self.registry_write().insert(id.clone(), document.clone());
        info!(
            document_id = %id,
            name = %document.name,
            chunks = chunks.len(),
            "ingesting document"
        );

        let started = Instant::now();
        match self.embed_and_index(&document, chunks).await {
            Ok(chunk_count) => {
                document.status = DocumentStatus::Ready;
                self.registry_write().insert(id.clone(), document.clone());
                self.cache.clear();
                info!(
                    document_id = %id,
                    chunks = chunk_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "document ready"
                );
                Ok(document)
            }
            Err(e) => {
                document.status = DocumentStatus::Error;
                document.error_detail = Some(e.to_string());
                self.registry_write().insert(id.clone(), document);
                warn!(document_id = %id, error = %e, "document ingestion failed");
                Err(e)
            }
        }
    }

    async fn embed_and_index(&self, document: &Document, mut chunks: Vec<Chunk>) -> Result<usize> {
        self.embed_chunks(&mut chunks).await?;
        let ready = Document {
            status: DocumentStatus::Ready,
            ..document.clone()
        };
        self.index.add(&ready, &chunks).await?;
        Ok(chunks.len())
    }

    /// Embeds chunk batches on a pool bounded by `embedding.concurrency`.
    async fn embed_chunks(&self, chunks: &mut [Chunk]) -> Result<()> {
        let batch_size = self.config.embedding.batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(self.config.embedding.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedder = self.embedder.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| RagError::Internal(e.to_string()))?;
                let vectors = embedder.embed_batch(&texts).await?;
                Ok::<_, RagError>((batch_no, vectors))
            });
        }

        // Returning early drops the set, which aborts the remaining batches.
        while let Some(joined) = tasks.join_next().await {
            let (batch_no, vectors) =
                joined.map_err(|e| RagError::Internal(format!("embedding task failed: {}", e)))??;
            let start = batch_no * batch_size;
            let end = (start + batch_size).min(chunks.len());
            if vectors.len() != end - start {
                return Err(RagError::embedding(format!(
                    "expected {} embeddings, got {}",
                    end - start,
                    vectors.len()
                )));
            }
            for (chunk, vector) in chunks[start..end].iter_mut().zip(vectors) {
                chunk.embedding = vector;
            }
        }
        Ok(())
    }

    /// Answers `question` from the uploaded documents matching `filter`.
    pub async fn query(&self, question: &str, filter: &Filter) -> Result<Answer> {
        self.query_with_cancel(question, filter, std::future::pending::<()>())
            .await
    }

    /// Like [`query`](Self::query), abandoning the work with
    /// [`RagError::Cancelled`] as soon as `cancel` completes. Nothing is
    /// cached for a cancelled or timed-out query.
    pub async fn query_with_cancel<C>(&self, question: &str, filter: &Filter, cancel: C) -> Result<Answer>
    where
        C: Future<Output = ()> + Send,
    {
        let started = Instant::now();
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::input("question is empty"));
        }
        filter.validate()?;

        let key = cache_key(question, filter);
        if let Some(hit) = self.cache.get(&key) {
            debug!(cache_key = %key, "cache hit");
            return Ok(Answer {
                text: hit.answer,
                sources: hit.sources,
                confidence: hit.confidence,
                cached: true,
                degraded: false,
                model: hit.model,
                usage: None,
                latency_ms: started.elapsed().as_millis() as u64,
            });
        }

        // Answers built across a clear must not outlive it.
        let generation = self.cache.generation();
        let timeout = Duration::from_secs(self.config.retrieval.query_timeout_secs);
        let work = async {
            let retrieval = self.retriever.retrieve(question, filter).await?;
            let generated = self.generator.generate(question, &retrieval.results).await?;
            Ok::<_, RagError>((retrieval, generated))
        };

        let (retrieval, generated) = tokio::select! {
            biased;
            _ = cancel => return Err(RagError::Cancelled),
            outcome = tokio::time::timeout(timeout, work) => {
                outcome.map_err(|_| RagError::Timeout(timeout))??
            }
        };

        if !retrieval.degraded {
            let stored = self.cache.put_if_generation(
                CachedResponse {
                    cache_key: key,
                    answer: generated.text.clone(),
                    sources: retrieval.results.clone(),
                    confidence: generated.confidence,
                    model: generated.model.clone(),
                    created_at: Utc::now(),
                },
                generation,
            );
            if !stored {
                debug!("documents changed during query, answer not cached");
            }
        }

        Ok(Answer {
            text: generated.text,
            sources: retrieval.results,
            confidence: generated.confidence,
            cached: false,
            degraded: retrieval.degraded,
            model: generated.model,
            usage: generated.usage,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Removes a ready or failed document and everything derived from it.
    pub async fn remove_document(&self, id: &str) -> Result<Document> {
        let document = self
            .registry_read()
            .get(id)
            .cloned()
            .ok_or_else(|| RagError::NotFound(id.to_string()))?;
        if document.status == DocumentStatus::Processing {
            return Err(RagError::input(format!(
                "document {} is still processing",
                id
            )));
        }

        self.index.remove_document(id).await?;
        self.registry_write().remove(id);
        self.cache.clear();
        info!(document_id = %id, name = %document.name, "document removed");
        Ok(document)
    }

    pub async fn stats(&self) -> Result<Stats> {
        let document_count = self.registry_read().len();
        Ok(Stats {
            document_count,
            chunk_count: self.index.chunk_count().await?,
            cache_entries: self.cache.len(),
        })
    }

    /// All registered documents, oldest first.
    pub fn list_documents(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self.registry_read().values().cloned().collect();
        docs.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then_with(|| a.id.cmp(&b.id)));
        docs
    }

    pub fn get_document(&self, id: &str) -> Result<Document> {
        self.registry_read()
            .get(id)
            .cloned()
            .ok_or_else(|| RagError::NotFound(id.to_string()))
    }
}

impl Drop for RagEngine {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
