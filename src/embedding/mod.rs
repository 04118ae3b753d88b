// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding module - turns content into vectors
//!
//! Chunking, token estimation, provider registry and the batch generator
//! with its cache, retry and rate-limiting plumbing.

pub mod chunker;
pub mod generator;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod tokens;

pub use chunker::{ChunkConfig, Chunker, Chunks};
pub use generator::{BatchOutcome, Embedded, EmbeddingGenerator, GeneratorConfig, GeneratorStats};
pub use provider::{CommandProvider, EmbeddingProvider, FastEmbedder, HashEmbedder};
pub use registry::ProviderRegistry;
pub use retry::{RateLimiter, RetryPolicy, Retryable};
pub use tokens::{HeuristicEstimator, SharedEstimator, TokenEstimator, TokenizerEstimator};
