//! TOML configuration.
//!
//! Every section is optional; omitted fields take the defaults below.
//!
//! ```toml
//! [index]
//! backend = "sqlite"            # or "memory"
//! path = "./data/docent.sqlite"
//!
//! [chunking]
//! max_chunk_chars = 1000
//! chunk_overlap_chars = 200
//!
//! [retrieval]
//! max_chunks_per_query = 5
//! similarity_threshold = 0.3
//!
//! [cache]
//! ttl_secs = 3600
//!
//! [transport]
//! max_frame_bytes = 950
//! max_answer_bytes = 262144
//!
//! [embedding]
//! provider = "hash"             # hash | openai | ollama | local | disabled
//! concurrency = 4
//!
//! [llm]
//! provider = "openai"           # openai | ollama | disabled
//! model = "gpt-4o-mini"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::transport::TRUNCATION_MARKER;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_backend")]
    pub backend: String,
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: default_index_backend(),
            path: default_index_path(),
        }
    }
}

fn default_index_backend() -> String {
    "sqlite".to_string()
}
fn default_index_path() -> PathBuf {
    PathBuf::from("./data/docent.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_overlap")]
    pub chunk_overlap_chars: usize,
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            chunk_overlap_chars: default_overlap(),
            min_chunk_chars: default_min_chunk_chars(),
        }
    }
}

fn default_max_chunk_chars() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}
fn default_min_chunk_chars() -> usize {
    crate::chunk::DEFAULT_MIN_CHUNK_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_chunks_per_query")]
    pub max_chunks_per_query: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Upper bound on retrieval plus generation for a single query.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_chunks_per_query: default_max_chunks_per_query(),
            similarity_threshold: default_similarity_threshold(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_max_chunks_per_query() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.3
}
fn default_query_timeout_secs() -> u64 {
    90
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Period of the optional expired-entry sweep; `0` disables it.
    #[serde(default)]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: 0,
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_max_answer_bytes")]
    pub max_answer_bytes: usize,
    #[serde(default = "default_frame_delay_ms")]
    pub frame_delay_ms: u64,
    /// Whole-message attempts, each with a fresh message id.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            max_answer_bytes: default_max_answer_bytes(),
            frame_delay_ms: default_frame_delay_ms(),
            max_send_attempts: default_max_send_attempts(),
        }
    }
}

fn default_max_frame_bytes() -> usize {
    950
}
fn default_max_answer_bytes() -> usize {
    256 * 1024
}
fn default_frame_delay_ms() -> u64 {
    20
}
fn default_max_send_attempts() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, OpenAI-compatible gateways).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum embedding requests in flight during ingestion.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_temperature() -> f32 {
    0.2
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.csv".to_string(),
        "**/*.json".to_string(),
        "**/*.html".to_string(),
    ]
}

impl Config {
    /// An offline, in-memory configuration: hashing embedder, no LLM.
    pub fn minimal() -> Self {
        Self {
            index: IndexConfig {
                backend: "memory".to_string(),
                ..IndexConfig::default()
            },
            ..Self::default()
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    match config.index.backend.as_str() {
        "memory" | "sqlite" => {}
        other => bail!(
            "Unknown index backend: '{}'. Must be memory or sqlite.",
            other
        ),
    }

    let chunking = &config.chunking;
    if chunking.max_chunk_chars == 0 {
        bail!("chunking.max_chunk_chars must be > 0");
    }
    if chunking.chunk_overlap_chars >= chunking.max_chunk_chars {
        bail!("chunking.chunk_overlap_chars must be smaller than chunking.max_chunk_chars");
    }
    if chunking.min_chunk_chars >= chunking.max_chunk_chars {
        bail!("chunking.min_chunk_chars must be smaller than chunking.max_chunk_chars");
    }

    if config.retrieval.max_chunks_per_query == 0 {
        bail!("retrieval.max_chunks_per_query must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        bail!("retrieval.similarity_threshold must be in [-1.0, 1.0]");
    }

    // Room for the JSON envelope plus at least one 4-byte character.
    if config.transport.max_frame_bytes < 128 {
        bail!("transport.max_frame_bytes must be >= 128");
    }
    // Room for the truncation marker plus at least one 4-byte character.
    let min_answer_bytes = TRUNCATION_MARKER.len() + 4;
    if config.transport.max_answer_bytes < min_answer_bytes {
        bail!(
            "transport.max_answer_bytes must be >= {}",
            min_answer_bytes
        );
    }
    if config.transport.max_send_attempts == 0 {
        bail!("transport.max_send_attempts must be >= 1");
    }

    if config.embedding.concurrency == 0 {
        bail!("embedding.concurrency must be >= 1");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }
    match config.embedding.provider.as_str() {
        "hash" | "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, local, or disabled.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" => {
            if config.llm.model.is_none() {
                bail!(
                    "llm.model must be specified when provider is '{}'",
                    config.llm.provider
                );
            }
        }
        other => bail!(
            "Unknown llm provider: '{}'. Must be openai, ollama, or disabled.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        bail!("llm.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}
