// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the retrieval engine.
//!
//! `RagError` covers everything surfaced to callers. Per-item embedding
//! outcomes use the smaller `EmbeddingError` so that batch operations can
//! record failures without aborting.

use std::time::Duration;

use thiserror::Error;

use crate::types::Modality;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// Content could not be decoded as text.
    #[error("unsupported content for '{content_id}': {reason}")]
    UnsupportedContent { content_id: String, reason: String },

    /// A vector's length does not match its model's registered dimension.
    #[error("dimension mismatch for model '{model_id}': expected {expected}, got {actual}")]
    DimensionMismatch {
        model_id: String,
        expected: usize,
        actual: usize,
    },

    /// Transient provider failure (retryable).
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    /// Non-retryable embedding failure.
    #[error("fatal embedding error: {0}")]
    EmbeddingFatal(String),

    /// Both retrieval paths failed.
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// The query deadline elapsed before results were ready.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("no embedding model available for modality '{0}'")]
    NoModel(Modality),

    #[error("unknown embedding model '{0}'")]
    UnknownModel(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("keyword index error: {0}")]
    Keyword(#[from] tantivy::TantivyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RagError {
    pub fn unsupported(content_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedContent {
            content_id: content_id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

impl From<EmbeddingError> for RagError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::Transient(msg) | EmbeddingError::Model(msg) => {
                RagError::EmbeddingProvider(msg)
            }
            EmbeddingError::Fatal(msg) => RagError::EmbeddingFatal(msg),
        }
    }
}

/// Outcome of a single provider call that did not produce a vector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbeddingError {
    /// Network or availability failure; may succeed on retry.
    #[error("transient: {0}")]
    Transient(String),
    /// This model cannot serve the request (bad output, no provider).
    /// Not retried, but the next model may still succeed.
    #[error("model: {0}")]
    Model(String),
    /// Will fail again for the same input.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EmbeddingError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::Model(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
