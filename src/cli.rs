// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI argument parsing using clap

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use ragdex::hybrid::SearchMode;
use ragdex::types::Modality;

/// ragdex - hybrid semantic and keyword search
///
/// Indexes prose, code and captions into a vector store and a BM25 index,
/// then answers queries with reciprocal rank fusion of both.
#[derive(Parser, Debug)]
#[command(name = "ragdex")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for results
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Search mode for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliSearchMode {
    /// BM25 keyword search only
    Keyword,
    /// Embedding-based semantic search only
    Semantic,
    /// Combined BM25 + embedding search
    Hybrid,
}

impl From<CliSearchMode> for SearchMode {
    fn from(mode: CliSearchMode) -> Self {
        match mode {
            CliSearchMode::Keyword => SearchMode::Keyword,
            CliSearchMode::Semantic => SearchMode::Semantic,
            CliSearchMode::Hybrid => SearchMode::Hybrid,
        }
    }
}

/// Content modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliModality {
    Prose,
    Code,
    Caption,
    ImageCaption,
}

impl From<CliModality> for Modality {
    fn from(modality: CliModality) -> Self {
        match modality {
            CliModality::Prose => Modality::Prose,
            CliModality::Code => Modality::Code,
            CliModality::Caption => Modality::Caption,
            CliModality::ImageCaption => Modality::ImageCaption,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Index a file or directory
    Index {
        /// File or directory to index (defaults to current directory)
        path: Option<String>,

        /// Index everything as this modality (default: code for source
        /// files, prose otherwise)
        #[arg(long, value_enum)]
        modality: Option<CliModality>,

        /// Re-index files even when unchanged
        #[arg(short, long)]
        force: bool,

        /// Paths/patterns to exclude (can be specified multiple times)
        #[arg(long = "exclude", short = 'e')]
        exclude_paths: Vec<String>,
    },

    /// Search indexed content
    #[command(alias = "s")]
    Search {
        /// Search query (natural language or keywords)
        query: String,

        /// Modality to search
        #[arg(long, value_enum, default_value = "prose")]
        modality: CliModality,

        /// Maximum number of results
        #[arg(short = 'k', long = "limit")]
        limit: Option<usize>,

        /// Weight of semantic results in hybrid fusion (0.0-1.0)
        #[arg(short, long)]
        weight: Option<f32>,

        /// Search mode: keyword, semantic, or hybrid
        #[arg(long, value_enum)]
        mode: Option<CliSearchMode>,

        /// Fail if the query takes longer than this many milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
    },

    /// Remove indexed content by id
    #[command(alias = "rm")]
    Remove {
        /// Content id (the path used at index time)
        content_id: String,
    },

    /// Show index statistics
    Stats {
        /// Only this modality (default: all)
        #[arg(long, value_enum)]
        modality: Option<CliModality>,
    },

    /// Probe every configured embedding model
    Health,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
