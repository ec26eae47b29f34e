//! # Docent CLI (`docent`)
//!
//! Ingest documents, ask questions about them, and run the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! docent --config ./config/docent.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docent init` | Create the SQLite index and run schema migrations |
//! | `docent ingest <path>...` | Upload files, or the matching files under directories |
//! | `docent ask "<question>"` | Answer a question from the uploaded documents |
//! | `docent docs` | List registered documents |
//! | `docent remove <id>` | Remove a document and its chunks |
//! | `docent stats` | Document, chunk and cache counters |
//! | `docent serve` | Start the HTTP API |
//!
//! ## Examples
//!
//! ```bash
//! docent ingest ./handbook --department hr --tag onboarding
//! docent ask "How long is the refund window?" --department hr
//! docent ask "How long is the refund window?" --frames
//! ```

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use docent::config;
use docent::engine::RagEngine;
use docent::index::{Filter, SqliteVectorIndex};
use docent::ingest;
use docent::models::{Answer, Confidentiality, DocumentMetadata};
use docent::server;
use docent::transport::{ChunkedTransport, JsonLinesSink};

/// Docent: answers questions from your own documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docent.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docent",
    about = "Docent: retrieval-augmented answers over uploaded documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docent.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the SQLite index schema. Safe to run repeatedly.
    Init,

    /// Upload files or directories.
    ///
    /// Directories are walked recursively and filtered by
    /// `[ingest].include_globs` / `exclude_globs`. Every uploaded file gets
    /// the metadata given by the flags below.
    Ingest {
        /// Files or directories to upload.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(long)]
        author: Option<String>,

        #[arg(long)]
        department: Option<String>,

        #[arg(long)]
        category: Option<String>,

        /// Tag to attach; repeat for several.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// One of `public`, `internal`, `confidential`, `restricted`.
        #[arg(long, default_value = "internal")]
        confidentiality: Confidentiality,
    },

    /// Answer a question from the uploaded documents.
    Ask {
        question: String,

        #[command(flatten)]
        filter: FilterArgs,

        /// Emit the answer as newline-delimited JSON frames.
        #[arg(long, conflicts_with = "json")]
        frames: bool,

        /// Print the full answer object as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List registered documents.
    Docs,

    /// Remove a document by id.
    Remove { id: String },

    /// Show document, chunk and cache counters.
    Stats,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Only documents of this MIME type (e.g. `text/markdown`).
    #[arg(long)]
    source_type: Option<String>,

    #[arg(long)]
    department: Option<String>,

    #[arg(long)]
    category: Option<String>,

    #[arg(long)]
    tag: Option<String>,

    /// Highest confidentiality level to search.
    #[arg(long)]
    max_confidentiality: Option<Confidentiality>,

    /// Only documents uploaded on or after this date (YYYY-MM-DD).
    #[arg(long)]
    after: Option<String>,

    /// Only documents uploaded on or before this date (YYYY-MM-DD).
    #[arg(long)]
    before: Option<String>,
}

impl FilterArgs {
    fn into_filter(self) -> anyhow::Result<Filter> {
        Ok(Filter {
            source_type: self.source_type,
            department: self.department,
            category: self.category,
            tag: self.tag,
            max_confidentiality: self.max_confidentiality,
            uploaded_after: self.after.as_deref().map(|d| parse_day(d, false)).transpose()?,
            uploaded_before: self.before.as_deref().map(|d| parse_day(d, true)).transpose()?,
        })
    }
}

/// Start of the day, or its last second when `end_of_day`.
fn parse_day(s: &str, end_of_day: bool) -> anyhow::Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))?;
    let time = if end_of_day {
        date.and_hms_opt(23, 59, 59)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    match time {
        Some(t) => Ok(t.and_utc()),
        None => bail!("Invalid date '{}'", s),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("docent=info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        if cfg.index.backend != "sqlite" {
            println!("Index backend is '{}'; nothing to initialize.", cfg.index.backend);
            return Ok(());
        }
        let index =
            SqliteVectorIndex::open(&cfg.index.path, cfg.retrieval.similarity_threshold).await?;
        index.close().await;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let engine = RagEngine::from_config(cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Ingest {
            paths,
            author,
            department,
            category,
            tags,
            confidentiality,
        } => {
            let metadata = DocumentMetadata {
                author,
                department,
                category,
                tags,
                confidentiality,
            };
            let summary = ingest::ingest_paths(&engine, &paths, &metadata).await?;

            for doc in &summary.ingested {
                println!("ingested  {}  {} ({} bytes)", doc.id, doc.name, doc.size_bytes);
            }
            for (path, error) in &summary.failed {
                println!("failed    {}: {}", path.display(), error);
            }
            println!();
            println!(
                "{} ingested, {} failed",
                summary.ingested.len(),
                summary.failed.len()
            );

            if summary.ingested.is_empty() && !summary.failed.is_empty() {
                bail!("No files were ingested");
            }
        }
        Commands::Ask {
            question,
            filter,
            frames,
            json,
        } => {
            let filter = filter.into_filter()?;
            let ctrl_c = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            let answer = engine.query_with_cancel(&question, &filter, ctrl_c).await?;

            if frames {
                let transport = ChunkedTransport::new(
                    JsonLinesSink::new(tokio::io::stdout()),
                    engine.config().transport.clone(),
                );
                let id = uuid::Uuid::new_v4().to_string();
                transport.send(&id, &answer.text).await?;
            } else if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print_answer(&answer);
            }
        }
        Commands::Docs => {
            let docs = engine.list_documents();
            if docs.is_empty() {
                println!("No documents.");
            }
            for doc in docs {
                println!(
                    "{}  {:<10}  {}  {}",
                    doc.id,
                    doc.status.as_str(),
                    doc.uploaded_at.format("%Y-%m-%d"),
                    doc.name
                );
                if let Some(detail) = &doc.error_detail {
                    println!("    error: {}", detail);
                }
            }
        }
        Commands::Remove { id } => {
            let doc = engine.remove_document(&id).await?;
            println!("Removed {} ({})", doc.name, doc.id);
        }
        Commands::Stats => {
            let stats = engine.stats().await?;
            println!("Docent Stats");
            println!("============");
            println!();
            println!("  Backend:     {}", engine.config().index.backend);
            println!("  Documents:   {}", stats.document_count);
            println!("  Chunks:      {}", stats.chunk_count);
            println!("  Cached:      {}", stats.cache_entries);
        }
        Commands::Serve => {
            let bind = engine.config().server.bind.clone();
            server::run_server(Arc::new(engine), &bind).await?;
        }
    }

    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.text.trim_end());
    println!();

    let mut flags = Vec::new();
    if answer.cached {
        flags.push("cached");
    }
    if answer.degraded {
        flags.push("degraded");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" ({})", flags.join(", "))
    };
    println!("confidence: {:.2}{}", answer.confidence, flags);

    if answer.sources.is_empty() {
        return;
    }
    println!();
    println!("Sources:");
    for (i, source) in answer.sources.iter().enumerate() {
        let section = source
            .chunk
            .section_label
            .as_deref()
            .map(|s| format!(" / {}", s))
            .unwrap_or_default();
        println!(
            "{}. [{:.2}] {}{}",
            i + 1,
            source.relevance_score,
            source.document.name,
            section
        );
    }
}
