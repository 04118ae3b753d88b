// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core data model shared across the chunker, stores and query engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{RagError, Result};

/// Kind of content a chunk was cut from. Each modality owns its own
/// vector table and model priority list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Prose,
    Code,
    Caption,
    ImageCaption,
}

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::Prose,
        Modality::Code,
        Modality::Caption,
        Modality::ImageCaption,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Prose => "prose",
            Modality::Code => "code",
            Modality::Caption => "caption",
            Modality::ImageCaption => "image_caption",
        }
    }

    /// SQLite table holding this modality's vectors.
    pub fn table_name(&self) -> &'static str {
        match self {
            Modality::Prose => "vectors_prose",
            Modality::Code => "vectors_code",
            Modality::Caption => "vectors_caption",
            Modality::ImageCaption => "vectors_image_caption",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "prose" | "text" | "p" => Ok(Modality::Prose),
            "code" | "c" => Ok(Modality::Code),
            "caption" => Ok(Modality::Caption),
            "image_caption" | "image" => Ok(Modality::ImageCaption),
            _ => Err(format!("Unknown modality: {}", s)),
        }
    }
}

/// Stable chunk identity: owning content id plus zero-padded ordinal, so
/// lexical order of ids follows document order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(content_id: &str, ordinal: usize) -> Self {
        Self(format!("{}#{:05}", content_id, ordinal))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The owning content id, i.e. everything before the last `#`.
    pub fn content_id(&self) -> &str {
        self.0.rsplit_once('#').map(|(c, _)| c).unwrap_or(&self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChunkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ChunkId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A contiguous span of source content prepared for embedding.
///
/// `start_offset`/`end_offset` are byte offsets into the source text and
/// `start_line`/`end_line` are 1-based inclusive. When overlap is applied,
/// `start_offset` points at the beginning of the overlapped prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub content_id: String,
    pub ordinal: usize,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Bytes of `text` repeated from the previous chunk.
    pub overlap_len: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub modality: Modality,
    pub token_estimate: usize,
    pub language: Option<String>,
}

impl Chunk {
    /// Text that is new to this chunk (overlap stripped).
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap_len..]
    }

    pub fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            content_id: self.content_id.clone(),
            start_offset: self.start_offset,
            end_offset: self.end_offset,
            start_line: self.start_line,
            end_line: self.end_line,
            token_estimate: self.token_estimate,
            snippet: snippet(&self.text, SNIPPET_CHARS),
        }
    }
}

const SNIPPET_CHARS: usize = 240;

/// Metadata persisted next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub content_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub token_estimate: usize,
    pub snippet: String,
}

/// Vector representation of a chunk under one model.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub chunk_id: ChunkId,
    pub modality: Modality,
    pub model_id: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
    /// Unix seconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    DotProduct,
    Euclidean,
}

impl DistanceMetric {
    /// Similarity score, higher is closer.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => cosine_similarity(a, b),
            DistanceMetric::DotProduct => dot(a, b),
            DistanceMetric::Euclidean => {
                let sq: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
                -sq.sqrt()
            }
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::DotProduct => write!(f, "dot_product"),
            DistanceMetric::Euclidean => write!(f, "euclidean"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "dot" | "dot_product" | "ip" => Ok(DistanceMetric::DotProduct),
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            _ => Err(format!("Unknown distance metric: {}", s)),
        }
    }
}

/// Registry entry describing an embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub dimension: usize,
    pub max_tokens: usize,
    /// Lower is preferred.
    pub priority: u32,
    #[serde(default)]
    pub metric: DistanceMetric,
    pub modalities: Vec<Modality>,
    #[serde(default)]
    pub description: String,
}

impl ModelDescriptor {
    pub fn new(model_id: impl Into<String>, dimension: usize, max_tokens: usize, priority: u32) -> Self {
        Self {
            model_id: model_id.into(),
            dimension,
            max_tokens,
            priority,
            metric: DistanceMetric::Cosine,
            modalities: Modality::ALL.to_vec(),
            description: String::new(),
        }
    }

    pub fn with_modalities(mut self, modalities: &[Modality]) -> Self {
        self.modalities = modalities.to_vec();
        self
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn serves(&self, modality: Modality) -> bool {
        self.modalities.contains(&modality)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(RagError::invalid_config("model_id must not be empty"));
        }
        if self.dimension == 0 {
            return Err(RagError::invalid_config(format!(
                "model '{}' must have a non-zero dimension",
                self.model_id
            )));
        }
        if self.max_tokens == 0 {
            return Err(RagError::invalid_config(format!(
                "model '{}' must have non-zero max_tokens",
                self.model_id
            )));
        }
        Ok(())
    }
}

/// Approximate-NN parameters for one modality table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub metric: DistanceMetric,
}

impl Default for IndexDescriptor {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            metric: DistanceMetric::Cosine,
        }
    }
}

impl IndexDescriptor {
    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(RagError::invalid_config("index m must be at least 2"));
        }
        if self.ef_search == 0 {
            return Err(RagError::invalid_config("ef_search must be positive"));
        }
        if self.ef_search > self.ef_construction {
            return Err(RagError::invalid_config(format!(
                "ef_search ({}) must not exceed ef_construction ({})",
                self.ef_search, self.ef_construction
            )));
        }
        Ok(())
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot(a, b) / (norm_a * norm_b)
}

/// First `max_chars` characters of `text`, whitespace collapsed.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &collapsed[..idx]),
        None => collapsed,
    }
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
