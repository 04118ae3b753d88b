// SPDX-License-Identifier: MIT OR Apache-2.0

//! ragdex - hybrid semantic and keyword search tool
//!
//! Indexes files into an HNSW vector store and a tantivy BM25 index and
//! answers queries with reciprocal rank fusion of both.

mod cli;
mod indexer;
mod query;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Commands, OutputFormat};
use ragdex::config::Config;
use ragdex::embedding::ProviderRegistry;
use ragdex::RetrievalEngine;
use tracing_subscriber::EnvFilter;

fn open_engine(config: &Config) -> Result<RetrievalEngine> {
    let options = config.engine_options().context("Invalid configuration")?;
    let registry = ProviderRegistry::from_config(config).context("Failed to set up embedding models")?;
    let data_dir = config.data_dir();
    RetrievalEngine::open(&data_dir, options, registry)
        .with_context(|| format!("Failed to open index at {}", data_dir.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with RAGDEX_LOG env var (e.g., RAGDEX_LOG=debug ragdex search "query")
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("RAGDEX_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let format = cli.format;

    match cli.command {
        Commands::Index {
            path,
            modality,
            force,
            exclude_paths,
        } => {
            let config = Config::load();
            let engine = open_engine(&config)?;
            let root = std::path::PathBuf::from(path.unwrap_or_else(|| ".".to_string()));
            let data_dir = config.data_dir();
            let skip_dir = data_dir.file_name().and_then(|n| n.to_str());
            let request = indexer::index::IndexRequest {
                root: &root,
                modality: modality.map(Into::into),
                force,
                excludes: &exclude_paths,
                skip_dir,
                show_progress: format == OutputFormat::Text,
            };
            let summary = indexer::index::build(&engine, &request).await?;
            indexer::index::print_summary(&summary, format == OutputFormat::Json)?;
        }
        Commands::Search {
            query,
            modality,
            limit,
            weight,
            mode,
            deadline_ms,
        } => {
            let config = Config::load();
            let engine = open_engine(&config)?;
            let args = query::search::SearchArgs {
                query: &query,
                modality: modality.into(),
                limit: limit.unwrap_or_else(|| config.search.max_results()),
                weight,
                mode: mode.map(Into::into),
                deadline_ms,
            };
            query::search::run(&engine, &args, format).await?;
        }
        Commands::Remove { content_id } => {
            let engine = open_engine(&Config::load())?;
            query::stats::run_remove(&engine, &content_id, format).await?;
        }
        Commands::Stats { modality } => {
            let engine = open_engine(&Config::load())?;
            query::stats::run_stats(&engine, modality.map(Into::into), format)?;
        }
        Commands::Health => {
            let engine = open_engine(&Config::load())?;
            query::stats::run_health(&engine, format)?;
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "ragdex", &mut std::io::stdout());
        }
    }

    Ok(())
}
