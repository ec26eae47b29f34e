//! Bulk ingestion of files and directories.
//!
//! Directories are walked recursively; files whose path relative to the
//! walked root matches `ingest.include_globs` and none of
//! `ingest.exclude_globs` (plus `.git`, `target` and `node_modules`) are
//! uploaded to the engine one at a time. Files named explicitly are always
//! uploaded.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::engine::RagEngine;
use crate::models::{Document, DocumentMetadata, Upload};

/// Per-file outcome of [`ingest_paths`].
#[derive(Debug, Default)]
pub struct IngestSummary {
    pub ingested: Vec<Document>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Expands `paths` into the sorted list of files to upload.
pub fn collect_files(paths: &[PathBuf], config: &IngestConfig) -> Result<Vec<PathBuf>> {
    let include_set = build_globset(&config.include_globs)?;

    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            files.push(root.clone());
            continue;
        }
        if !root.is_dir() {
            anyhow::bail!("No such file or directory: {}", root.display());
        }

        let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }
            files.push(path.to_path_buf());
        }
    }

    // Sort for deterministic ordering
    files.sort();
    files.dedup();
    Ok(files)
}

/// Uploads every file under `paths` with the same metadata.
///
/// A failing file is recorded in the summary and does not stop the rest.
pub async fn ingest_paths(
    engine: &RagEngine,
    paths: &[PathBuf],
    metadata: &DocumentMetadata,
) -> Result<IngestSummary> {
    let files = collect_files(paths, &engine.config().ingest)?;
    let mut summary = IngestSummary::default();

    for path in files {
        match ingest_file(engine, &path, metadata).await {
            Ok(document) => summary.ingested.push(document),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping file");
                summary.failed.push((path, format!("{:#}", e)));
            }
        }
    }
    Ok(summary)
}

async fn ingest_file(engine: &RagEngine, path: &Path, metadata: &DocumentMetadata) -> Result<Document> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    Ok(engine
        .add_document(Upload::new(name, bytes), metadata.clone())
        .await?)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
