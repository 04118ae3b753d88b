// SPDX-License-Identifier: MIT OR Apache-2.0

//! File scanner using the ignore crate (same as ripgrep)

use anyhow::{Context, Result};
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

const TEXT_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "py", "go", "java", "c", "h", "cpp", "cc", "hpp", "cs",
    "rb", "php", "swift", "kt", "kts", "scala", "lua", "sh", "md", "markdown", "txt", "rst",
    "adoc", "json", "yaml", "yml", "toml",
];

/// File scanner that respects .gitignore
pub struct FileScanner {
    root: PathBuf,
    excludes: Vec<String>,
    skip_dir: Option<String>,
}

impl FileScanner {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            excludes: Vec::new(),
            skip_dir: None,
        }
    }

    /// Glob patterns to leave out, relative to the root.
    pub fn with_excludes(mut self, excludes: &[String]) -> Self {
        self.excludes = excludes.to_vec();
        self
    }

    /// Directory (by name) never descended into, e.g. the data directory.
    pub fn skip_dir(mut self, name: impl Into<String>) -> Self {
        self.skip_dir = Some(name.into());
        self
    }

    /// Get list of indexable file paths, sorted
    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        if self.root.is_file() {
            return Ok(vec![self.root.clone()]);
        }

        let mut overrides = OverrideBuilder::new(&self.root);
        for pattern in &self.excludes {
            overrides
                .add(&format!("!{}", pattern))
                .with_context(|| format!("Invalid exclude pattern: {}", pattern))?;
        }
        let overrides = overrides.build().context("Failed to build exclude patterns")?;

        let skip_dir = self.skip_dir.clone();
        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .git_exclude(true)
            .overrides(overrides)
            .filter_entry(move |entry| match (&skip_dir, entry.file_name().to_str()) {
                (Some(skip), Some(name)) => name != skip,
                _ => true,
            })
            .build_parallel();

        let (tx, rx) = mpsc::channel();
        walker.run(|| {
            let tx = tx.clone();
            Box::new(move |entry| {
                if let Ok(entry) = entry {
                    let path = entry.path();
                    if path.is_file() && is_indexable(path) {
                        let _ = tx.send(path.to_path_buf());
                    }
                }
                ignore::WalkState::Continue
            })
        });

        drop(tx);
        let mut files: Vec<PathBuf> = rx.into_iter().collect();
        files.sort();
        Ok(files)
    }
}

fn is_indexable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Content id for a scanned path: forward slashes, no leading `./`.
pub fn content_id(path: &Path) -> String {
    let id = path.to_string_lossy().replace('\\', "/");
    id.strip_prefix("./").map(str::to_string).unwrap_or(id)
}
