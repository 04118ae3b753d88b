// SPDX-License-Identifier: MIT OR Apache-2.0

//! Directory ingestion: scan, read in parallel, skip unchanged content and
//! feed the rest to the retrieval engine.

use anyhow::{Context, Result};
use colored::Colorize;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

use crate::indexer::scanner::{content_id, FileScanner};
use ragdex::errors::RagError;
use ragdex::parser::language_for_path;
use ragdex::types::{ChunkId, Modality};
use ragdex::RetrievalEngine;

/// Files ingested concurrently. Each file's chunks are embedded
/// concurrently too, bounded by the generator's own limits.
const FILE_CONCURRENCY: usize = 4;

#[derive(Debug, Default, Serialize)]
pub struct IndexSummary {
    pub total_files: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub unreadable: usize,
    pub unsupported: usize,
    pub chunks: usize,
    pub embeddings: usize,
    pub failures: Vec<ChunkId>,
}

enum ScannedFile {
    Changed {
        content_id: String,
        modality: Modality,
        bytes: Vec<u8>,
    },
    Unchanged {
        content_id: String,
    },
    ReadError {
        content_id: String,
    },
}

/// Options for one index run.
pub struct IndexRequest<'a> {
    pub root: &'a Path,
    pub modality: Option<Modality>,
    pub force: bool,
    pub excludes: &'a [String],
    pub skip_dir: Option<&'a str>,
    pub show_progress: bool,
}

/// Modality for a path when none is forced: code for recognized source
/// files, prose otherwise.
pub fn modality_for(path: &Path, forced: Option<Modality>) -> Modality {
    forced.unwrap_or_else(|| {
        if language_for_path(path).is_some() {
            Modality::Code
        } else {
            Modality::Prose
        }
    })
}

pub async fn build(engine: &RetrievalEngine, request: &IndexRequest<'_>) -> Result<IndexSummary> {
    let mut scanner = FileScanner::new(request.root).with_excludes(request.excludes);
    if let Some(dir) = request.skip_dir {
        scanner = scanner.skip_dir(dir);
    }
    let files = scanner.list_files()?;

    let mut summary = IndexSummary {
        total_files: files.len(),
        ..IndexSummary::default()
    };

    let pb = if request.show_progress {
        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40.cyan/blue}] {pos}/{len} files | Indexing {msg}")?
                .progress_chars("##."),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let scanned: Vec<ScannedFile> = files
        .par_iter()
        .map(|path| {
            let id = content_id(path);
            let modality = modality_for(path, request.modality);
            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(_) => return ScannedFile::ReadError { content_id: id },
            };
            if !request.force && engine.is_current(&id, modality, &bytes).unwrap_or(false) {
                return ScannedFile::Unchanged { content_id: id };
            }
            ScannedFile::Changed {
                content_id: id,
                modality,
                bytes,
            }
        })
        .collect();

    let mut seen = HashSet::with_capacity(scanned.len());
    let mut changed = Vec::new();
    for file in scanned {
        match file {
            ScannedFile::Unchanged { content_id } => {
                summary.unchanged += 1;
                pb.inc(1);
                seen.insert(content_id);
            }
            ScannedFile::ReadError { content_id } => {
                summary.unreadable += 1;
                pb.inc(1);
                eprintln!("Warning: failed to read {}", content_id);
            }
            ScannedFile::Changed {
                content_id,
                modality,
                bytes,
            } => {
                seen.insert(content_id.clone());
                changed.push((content_id, modality, bytes));
            }
        }
    }

    let mut results = stream::iter(changed)
        .map(|(content_id, modality, bytes)| async move {
            let result = engine.index_content(&content_id, modality, &bytes).await;
            (content_id, result)
        })
        .buffer_unordered(FILE_CONCURRENCY);

    while let Some((content_id, result)) = results.next().await {
        pb.set_message(content_id.clone());
        pb.inc(1);
        match result {
            Ok(outcome) => {
                summary.indexed += 1;
                summary.chunks += outcome.chunks_created;
                summary.embeddings += outcome.embeddings_created;
                summary.failures.extend(outcome.failures);
            }
            Err(RagError::UnsupportedContent { reason, .. }) => {
                summary.unsupported += 1;
                tracing::warn!("skipping {}: {}", content_id, reason);
            }
            Err(err) => {
                pb.finish_and_clear();
                return Err(err).with_context(|| format!("Failed to index {}", content_id));
            }
        }
    }
    pb.finish_and_clear();

    summary.removed = remove_stale(engine, request.root, &seen).await?;
    Ok(summary)
}

/// Removes content indexed from under `root` whose file no longer exists.
async fn remove_stale(engine: &RetrievalEngine, root: &Path, seen: &HashSet<String>) -> Result<usize> {
    let root_id = content_id(root);
    let prefix = format!("{}/", root_id.trim_end_matches('/'));
    let whole_tree = root_id.is_empty() || root_id == ".";

    let mut removed = 0;
    for id in engine.indexed_contents()? {
        let under_root = whole_tree || id == root_id || id.starts_with(&prefix);
        if under_root && !seen.contains(&id) && !Path::new(&id).exists() {
            engine.remove_content(&id).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Print the outcome of an index run
pub fn print_summary(summary: &IndexSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    if summary.unreadable > 0 {
        eprintln!("Warning: {} files could not be read", summary.unreadable);
    }
    if summary.unsupported > 0 {
        eprintln!("Warning: {} files were not valid text", summary.unsupported);
    }
    if !summary.failures.is_empty() {
        eprintln!(
            "Warning: {} chunks could not be embedded (keyword search only)",
            summary.failures.len()
        );
    }

    println!(
        "{} Indexed {} files ({} unchanged, {} removed, {} total): {} chunks, {} embeddings",
        "✓".green(),
        summary.indexed.to_string().cyan(),
        summary.unchanged.to_string().dimmed(),
        summary.removed,
        summary.total_files,
        summary.chunks,
        summary.embeddings
    );
    Ok(())
}
