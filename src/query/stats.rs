// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stats, health and remove commands

use anyhow::Result;
use colored::Colorize;
use serde_json::json;

use crate::cli::OutputFormat;
use ragdex::output::{colorize_context, colorize_name, colorize_status, use_colors};
use ragdex::types::Modality;
use ragdex::{EngineStats, RetrievalEngine};

/// Run the stats command for one modality or all of them
pub fn run_stats(engine: &RetrievalEngine, modality: Option<Modality>, format: OutputFormat) -> Result<()> {
    let modalities = match modality {
        Some(m) => vec![m],
        None => Modality::ALL.to_vec(),
    };
    let stats = modalities
        .into_iter()
        .map(|m| engine.stats(m))
        .collect::<ragdex::Result<Vec<EngineStats>>>()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            let use_color = use_colors();
            for s in &stats {
                println!(
                    "{}: {} chunks embedded, {} keyword-indexed",
                    colorize_name(s.modality.as_str(), use_color),
                    s.chunk_count,
                    s.keyword_chunks
                );
                println!(
                    "  index: m={} ef_construction={} ef_search={} metric={}",
                    s.index_params.m,
                    s.index_params.ef_construction,
                    s.index_params.ef_search,
                    s.index_params.metric
                );
                for graph in &s.vectors.graphs {
                    println!(
                        "  graph {}: {} dims, {} nodes, {} tombstones",
                        graph.model_id, graph.dimension, graph.nodes, graph.tombstones
                    );
                }
                let models: Vec<&str> = s.models.iter().map(|m| m.model_id.as_str()).collect();
                println!("  models: {}", colorize_context(&models.join(" > "), use_color));
            }
            if let Some(s) = stats.first() {
                println!(
                    "cache: {} entries, hit rate {:.1}% | provider calls: {}, fallbacks: {}",
                    s.cache.entries,
                    s.cache_hit_rate * 100.0,
                    s.generator.provider_calls,
                    s.generator.fallbacks
                );
            }
        }
    }
    Ok(())
}

/// Run the health command
pub fn run_health(engine: &RetrievalEngine, format: OutputFormat) -> Result<()> {
    let report = engine.health();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            let use_color = use_colors();
            if report.is_empty() {
                println!("No embedding models available; only keyword search will work.");
            }
            for model in &report {
                let modalities: Vec<&str> = model.modalities.iter().map(|m| m.as_str()).collect();
                println!(
                    "{}  {}  (priority {}, {} dims, {})",
                    colorize_name(&model.model_id, use_color),
                    colorize_status(model.healthy, use_color),
                    model.priority,
                    model.dimension,
                    modalities.join(", ")
                );
            }
        }
    }
    Ok(())
}

/// Run the remove command
pub async fn run_remove(engine: &RetrievalEngine, content_id: &str, format: OutputFormat) -> Result<()> {
    let known = engine.indexed_contents()?.iter().any(|id| id == content_id);
    let removed = engine.remove_content(content_id).await?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "content_id": content_id, "found": known, "embeddings_removed": removed })
        ),
        OutputFormat::Text => {
            if known {
                println!("{} Removed {} ({} embeddings)", "✓".green(), content_id, removed);
            } else {
                println!("{} Not indexed: {}", "✗".red(), content_id);
            }
        }
    }
    Ok(())
}
