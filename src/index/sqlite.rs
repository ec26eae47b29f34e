//! SQLite-backed [`VectorIndex`].
//!
//! Documents and chunks (with their unit-length embeddings as little-endian
//! `f32` BLOBs) live in the `documents` and `chunks` tables created by
//! [`run_migrations`](crate::migrate::run_migrations). The vector
//! dimensionality is recorded in `index_meta` on first insert so a reopened
//! index keeps rejecting vectors from a different model.
//!
//! Filter predicates on indexed columns (source type, confidentiality rank,
//! upload time) are pushed into the SQL `WHERE` clause; the remaining
//! predicates and the similarity scan run in Rust over the candidate rows.

use std::path::Path;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use super::{check_batch_dims, check_query_dims, rank, search_result, Filter, VectorIndex};
use crate::db;
use crate::embedding::{blob_to_vec, dot, normalize, vec_to_blob};
use crate::error::{RagError, Result};
use crate::migrate::run_migrations;
use crate::models::{Chunk, Confidentiality, Document, DocumentMetadata, DocumentStatus, SearchResult};

const DOC_COLUMNS: &str = "d.id AS d_id, d.name AS d_name, d.source_type AS d_source_type, \
     d.size_bytes AS d_size_bytes, d.uploaded_at AS d_uploaded_at, d.author AS d_author, \
     d.department AS d_department, d.category AS d_category, d.tags_json AS d_tags_json, \
     d.confidentiality AS d_confidentiality, d.status AS d_status, d.error_detail AS d_error_detail";

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    threshold: f32,
    dims: RwLock<Option<usize>>,
    /// Serializes writers so the dimensionality check and insert are atomic.
    write_lock: Mutex<()>,
}

impl SqliteVectorIndex {
    /// Opens the database at `path`, creating tables as needed.
    pub async fn open(path: &Path, similarity_threshold: f32) -> Result<Self> {
        let pool = db::connect(path).await?;
        Self::from_pool(pool, similarity_threshold).await
    }

    pub async fn from_pool(pool: SqlitePool, similarity_threshold: f32) -> Result<Self> {
        run_migrations(&pool).await?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'dims'")
                .fetch_optional(&pool)
                .await?;
        let dims = stored
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|_| RagError::Internal(format!("corrupt index_meta dims: {}", v)))
            })
            .transpose()?;
        debug!(?dims, "opened sqlite vector index");

        Ok(Self {
            pool,
            threshold: similarity_threshold,
            dims: RwLock::new(dims),
            write_lock: Mutex::new(()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RagError::Internal(format!("invalid timestamp '{}': {}", raw, e)))
}

fn doc_from_row(row: &SqliteRow) -> Result<Document> {
    let tags_json: String = row.try_get("d_tags_json")?;
    let confidentiality: String = row.try_get("d_confidentiality")?;
    let status: String = row.try_get("d_status")?;
    let uploaded_at: String = row.try_get("d_uploaded_at")?;
    let size_bytes: i64 = row.try_get("d_size_bytes")?;

    Ok(Document {
        id: row.try_get("d_id")?,
        name: row.try_get("d_name")?,
        source_type: row.try_get("d_source_type")?,
        size_bytes: size_bytes.max(0) as u64,
        uploaded_at: parse_ts(&uploaded_at)?,
        metadata: DocumentMetadata {
            author: row.try_get("d_author")?,
            department: row.try_get("d_department")?,
            category: row.try_get("d_category")?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            confidentiality: confidentiality.parse::<Confidentiality>().unwrap_or_default(),
        },
        status: match status.as_str() {
            "processing" => DocumentStatus::Processing,
            "error" => DocumentStatus::Error,
            _ => DocumentStatus::Ready,
        },
        error_detail: row.try_get("d_error_detail")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let blob: Vec<u8> = row.try_get("embedding")?;
    let start: i64 = row.try_get("start_offset")?;
    let end: i64 = row.try_get("end_offset")?;
    let tokens: i64 = row.try_get("estimated_tokens")?;

    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        chunk_index: row.try_get("chunk_index")?,
        text: row.try_get("text")?,
        start_offset: start as usize,
        end_offset: end as usize,
        section_label: row.try_get("section_label")?,
        hash: row.try_get("hash")?,
        estimated_tokens: tokens as usize,
        embedding: blob_to_vec(&blob),
    })
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn add(&self, document: &Document, chunks: &[Chunk]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let expected = *self.dims.read().unwrap_or_else(PoisonError::into_inner);
        let dims = check_batch_dims(chunks, expected)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&document.id)
            .execute(&mut *tx)
            .await?;

        let meta = &document.metadata;
        sqlx::query(
            r#"
            INSERT INTO documents (id, name, source_type, size_bytes, uploaded_at, uploaded_at_ms,
                                   author, department, category, tags_json,
                                   confidentiality, confidentiality_rank, status, error_detail)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                source_type = excluded.source_type,
                size_bytes = excluded.size_bytes,
                uploaded_at = excluded.uploaded_at,
                uploaded_at_ms = excluded.uploaded_at_ms,
                author = excluded.author,
                department = excluded.department,
                category = excluded.category,
                tags_json = excluded.tags_json,
                confidentiality = excluded.confidentiality,
                confidentiality_rank = excluded.confidentiality_rank,
                status = excluded.status,
                error_detail = excluded.error_detail
            "#,
        )
        .bind(&document.id)
        .bind(&document.name)
        .bind(&document.source_type)
        .bind(document.size_bytes as i64)
        .bind(document.uploaded_at.to_rfc3339())
        .bind(document.uploaded_at.timestamp_millis())
        .bind(&meta.author)
        .bind(&meta.department)
        .bind(&meta.category)
        .bind(serde_json::to_string(&meta.tags).unwrap_or_else(|_| "[]".to_string()))
        .bind(meta.confidentiality.as_str())
        .bind(meta.confidentiality.rank())
        .bind(document.status.as_str())
        .bind(&document.error_detail)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            let mut embedding = chunk.embedding.clone();
            normalize(&mut embedding);

            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, start_offset, end_offset,
                                    section_label, hash, estimated_tokens, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&document.id)
            .bind(chunk.chunk_index)
            .bind(chunk.text.as_str())
            .bind(chunk.start_offset as i64)
            .bind(chunk.end_offset as i64)
            .bind(&chunk.section_label)
            .bind(&chunk.hash)
            .bind(chunk.estimated_tokens as i64)
            .bind(vec_to_blob(&embedding))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO index_meta (key, value) VALUES ('dims', ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(dims.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        *self.dims.write().unwrap_or_else(PoisonError::into_inner) = Some(dims);
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize, filter: &Filter) -> Result<Vec<SearchResult>> {
        let Some(dims) = self.dims() else {
            return Ok(Vec::new());
        };
        check_query_dims(vector, dims)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = vector.to_vec();
        normalize(&mut query);

        let mut sql: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT c.id, c.document_id, c.chunk_index, c.text, c.start_offset, c.end_offset, \
             c.section_label, c.hash, c.estimated_tokens, c.embedding, {} \
             FROM chunks c JOIN documents d ON d.id = c.document_id WHERE 1 = 1",
            DOC_COLUMNS
        ));
        if let Some(source_type) = &filter.source_type {
            sql.push(" AND d.source_type = ").push_bind(source_type.trim().to_lowercase());
        }
        if let Some(clearance) = filter.max_confidentiality {
            sql.push(" AND d.confidentiality_rank <= ").push_bind(clearance.rank());
        }
        if let Some(after) = filter.uploaded_after {
            sql.push(" AND d.uploaded_at_ms >= ").push_bind(after.timestamp_millis());
        }
        if let Some(before) = filter.uploaded_before {
            sql.push(" AND d.uploaded_at_ms <= ").push_bind(before.timestamp_millis());
        }

        let rows = sql.build().fetch_all(&self.pool).await?;

        let mut results = Vec::new();
        for row in &rows {
            let document = doc_from_row(row)?;
            if !filter.matches(&document) {
                continue;
            }
            let chunk = chunk_from_row(row)?;
            check_query_dims(&chunk.embedding, dims)?;
            let similarity = dot(&query, &chunk.embedding);
            if similarity >= self.threshold {
                results.push(search_result(chunk, document, similarity));
            }
        }

        rank(&mut results, k);
        Ok(results)
    }

    async fn remove_document(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn chunk_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents d ORDER BY d.uploaded_at_ms ASC, d.id ASC",
            DOC_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(doc_from_row).collect()
    }

    fn dims(&self) -> Option<usize> {
        *self.dims.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn similarity_threshold(&self) -> f32 {
        self.threshold
    }
}
