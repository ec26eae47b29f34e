//! # Docent
//!
//! A retrieval-augmented question answering engine over uploaded documents.
//!
//! Documents are extracted to text, split into overlapping chunks, embedded
//! and stored in a vector index. A question is embedded the same way, the
//! closest chunks are retrieved (optionally restricted by a metadata
//! [`Filter`](index::Filter)) and an LLM writes an answer grounded in them.
//! Answers are cached per normalized question and filter, and can be
//! delivered over size-bounded channels as ordered frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────┐   ┌─────────────┐
//! │ Extract  │──▶│ Chunker │──▶│ Embedder │──▶│ VectorIndex │
//! └──────────┘   └─────────┘   └──────────┘   └──────┬──────┘
//!                                                    │
//!   question ──▶ ResponseCache ──▶ Retriever ◀───────┘
//!                      ▲              │
//!                      └── Generator ◀┘──▶ ChunkedTransport ──▶ frames
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Error type and classification |
//! | [`extract`] | Upload bytes to plain text |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index (in-memory and SQLite) |
//! | [`cache`] | Response cache |
//! | [`retrieve`] | Query embedding and relevance ranking |
//! | [`llm`] | Chat/completion clients |
//! | [`generate`] | Prompt assembly and confidence |
//! | [`engine`] | The [`RagEngine`] facade |
//! | [`transport`] | Bounded, ordered frame delivery |
//! | [`ingest`] | File and directory ingestion |
//! | [`server`] | HTTP API |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod generate;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod retrieve;
pub mod server;
pub mod transport;

pub use engine::RagEngine;
pub use error::{ErrorKind, RagError, Result};
pub use index::{Filter, VectorIndex};
pub use models::{Answer, Document, DocumentMetadata, Upload};
pub use transport::{ChunkedTransport, Frame, FrameSink};
