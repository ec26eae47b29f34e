//! Core data models used throughout docent.
//!
//! These types represent the documents, chunks, search results and answers
//! that flow through the ingestion and query pipelines.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RagError;

/// A file handed to the engine for ingestion.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Display name, usually the file name.
    pub name: String,
    pub bytes: Vec<u8>,
    /// Content type; guessed from `name` when absent.
    pub mime_hint: Option<String>,
}

impl Upload {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            mime_hint: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime_hint = Some(mime.into());
        self
    }
}

/// Ordered sensitivity levels; a filter clearance admits its own level and below.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidentiality {
    Public,
    #[default]
    Internal,
    Confidential,
    Restricted,
}

impl Confidentiality {
    /// Stable integer rank, stored in SQLite for range filtering.
    pub fn rank(self) -> i64 {
        match self {
            Confidentiality::Public => 0,
            Confidentiality::Internal => 1,
            Confidentiality::Confidential => 2,
            Confidentiality::Restricted => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Confidentiality::Public => "public",
            Confidentiality::Internal => "internal",
            Confidentiality::Confidential => "confidential",
            Confidentiality::Restricted => "restricted",
        }
    }
}

impl fmt::Display for Confidentiality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Confidentiality {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "public" => Ok(Confidentiality::Public),
            "internal" => Ok(Confidentiality::Internal),
            "confidential" => Ok(Confidentiality::Confidential),
            "restricted" => Ok(Confidentiality::Restricted),
            other => Err(RagError::input(format!(
                "unknown confidentiality level '{}': expected public, internal, confidential or restricted",
                other
            ))),
        }
    }
}

/// Operator-supplied descriptive metadata for a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentMetadata {
    pub author: Option<String>,
    pub department: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub confidentiality: Confidentiality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Error => "error",
        }
    }
}

/// A document registered with the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    /// Content type the text was extracted from (e.g. `text/markdown`).
    pub source_type: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
    pub metadata: DocumentMetadata,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// A bounded segment of a document's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Byte offset of `text` in the extracted document text.
    pub start_offset: usize,
    pub end_offset: usize,
    pub section_label: Option<String>,
    /// SHA-256 of `text`.
    pub hash: String,
    pub estimated_tokens: usize,
    /// Empty until the chunk has been embedded.
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// One retrieved chunk together with its scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub document: Document,
    /// Cosine similarity to the query vector, in `[-1, 1]`.
    pub similarity: f32,
    /// Blended rank score, in `[0, 1]`.
    pub relevance_score: f32,
    pub context_snippet: String,
}

/// Token accounting reported by the language model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// The result of [`RagEngine::query`](crate::engine::RagEngine::query).
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SearchResult>,
    pub confidence: f32,
    /// Served from the response cache.
    pub cached: bool,
    /// Retrieval used the bag-of-words fallback because the embedding
    /// provider failed; relevance is much lower than usual.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub latency_ms: u64,
}

/// Engine-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub document_count: usize,
    pub chunk_count: usize,
    pub cache_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidentiality_ordering() {
        assert!(Confidentiality::Public < Confidentiality::Internal);
        assert!(Confidentiality::Confidential < Confidentiality::Restricted);
        assert_eq!(Confidentiality::default(), Confidentiality::Internal);
    }

    #[test]
    fn test_confidentiality_parse() {
        assert_eq!(
            " Confidential ".parse::<Confidentiality>().unwrap(),
            Confidentiality::Confidential
        );
        assert!("secret".parse::<Confidentiality>().is_err());
    }

    #[test]
    fn test_metadata_defaults_from_json() {
        let meta: DocumentMetadata = serde_json::from_str(r#"{"department":"hr"}"#).unwrap();
        assert_eq!(meta.department.as_deref(), Some("hr"));
        assert!(meta.tags.is_empty());
        assert_eq!(meta.confidentiality, Confidentiality::Internal);
    }
}
