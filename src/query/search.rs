// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hybrid search command

use anyhow::Result;
use colored::Colorize;
use std::time::{Duration, Instant};

use crate::cli::OutputFormat;
use ragdex::hybrid::{SearchHit, SearchMode};
use ragdex::output::{colorize_context, colorize_path, colorize_score, highlight_terms, use_colors};
use ragdex::types::Modality;
use ragdex::RetrievalEngine;

pub struct SearchArgs<'a> {
    pub query: &'a str,
    pub modality: Modality,
    pub limit: usize,
    pub weight: Option<f32>,
    pub mode: Option<SearchMode>,
    pub deadline_ms: Option<u64>,
}

/// Run the search command
pub async fn run(engine: &RetrievalEngine, args: &SearchArgs<'_>, format: OutputFormat) -> Result<()> {
    let mut request = engine.request(args.query, args.modality, args.limit);
    if let Some(mode) = args.mode {
        request.mode = mode;
    }
    if let Some(ms) = args.deadline_ms {
        request.deadline = Some(Duration::from_millis(ms));
    }
    request.weight_semantic = args.weight;

    let start_time = Instant::now();
    let hits = engine.search_with(&request).await?;
    let elapsed = start_time.elapsed();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&hits)?),
        OutputFormat::Text => print_text(args.query, request.mode, &hits, elapsed),
    }
    Ok(())
}

fn print_text(query: &str, mode: SearchMode, hits: &[SearchHit], elapsed: Duration) {
    let use_color = use_colors();
    if hits.is_empty() {
        if use_color {
            println!("{} No results found for: {}", "✗".red(), query.yellow());
        } else {
            println!("No results found for: {}", query);
        }
        return;
    }

    if use_color {
        println!(
            "\n{} Found {} results for: {} ({} search)\n",
            "✓".green(),
            hits.len().to_string().cyan(),
            query.yellow(),
            mode
        );
    } else {
        println!("\nFound {} results for: {} ({} search)\n", hits.len(), query, mode);
    }

    let terms = query_terms(query);
    for hit in hits {
        println!(
            "{}  {} (score: {})",
            colorize_path(&hit.content_id, use_color),
            colorize_context(hit.chunk_id.as_str(), use_color),
            colorize_score(hit.score, use_color)
        );
        if !hit.snippet.is_empty() {
            println!("    {}", highlight_terms(&hit.snippet, &terms, use_color));
        }
        println!();
    }
    println!(
        "{}",
        colorize_context(&format!("{:.1}ms", elapsed.as_secs_f64() * 1000.0), use_color)
    );
}

/// Words worth highlighting in snippets.
fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}
