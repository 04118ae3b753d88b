// SPDX-License-Identifier: MIT OR Apache-2.0

//! ragdex - retrieval-augmented search library
//!
//! Chunking, embedding, vector and keyword indexing, and hybrid
//! reciprocal-rank-fusion search over prose, code and captions.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod errors;
pub mod hybrid;
pub mod output;
pub mod parser;
pub mod store;
pub mod types;

pub use engine::{EngineOptions, EngineStats, IndexResult, ModelHealth, RetrievalEngine};
pub use errors::{EmbeddingError, RagError, Result};
pub use hybrid::{SearchHit, SearchMode, SearchRequest};
pub use types::{Chunk, ChunkId, Modality, ModelDescriptor};
