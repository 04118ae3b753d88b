// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token estimation for chunk budgeting.
//!
//! Two estimators exist: an exact one backed by a model's `tokenizer.json`,
//! and a character heuristic. The heuristic is approximate and may under- or
//! over-count real model tokens by a wide margin for unusual text; only the
//! exact estimator gives counts a caller can rely on. A chunking pass uses
//! exactly one estimator from start to finish.

use std::path::Path;
use std::sync::Arc;

use tokenizers::Tokenizer;

use crate::errors::{RagError, Result};
use crate::types::Modality;

pub trait TokenEstimator: Send + Sync {
    /// Number of tokens `text` occupies.
    fn estimate(&self, text: &str) -> usize;

    /// True when counts come from the model's own tokenizer.
    fn is_exact(&self) -> bool;

    fn name(&self) -> &str;
}

/// Characters per token for the heuristic path.
pub fn chars_per_token(modality: Modality) -> f32 {
    match modality {
        Modality::Prose => 4.0,
        Modality::Code => 3.8,
        Modality::Caption | Modality::ImageCaption => 4.2,
    }
}

/// `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicEstimator {
    chars_per_token: f32,
}

impl HeuristicEstimator {
    pub fn new(chars_per_token: f32) -> Self {
        Self {
            chars_per_token: chars_per_token.max(0.1),
        }
    }

    pub fn for_modality(modality: Modality) -> Self {
        Self::new(chars_per_token(modality))
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        (chars as f32 / self.chars_per_token).ceil() as usize
    }

    fn is_exact(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// Exact counts from a HuggingFace tokenizer.
pub struct TokenizerEstimator {
    tokenizer: Tokenizer,
    name: String,
}

impl TokenizerEstimator {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            RagError::invalid_config(format!(
                "failed to load tokenizer {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_tokenizer(tokenizer, path.display().to_string())
    }

    pub fn from_bytes(bytes: &[u8], name: impl Into<String>) -> Result<Self> {
        let tokenizer = Tokenizer::from_bytes(bytes)
            .map_err(|e| RagError::invalid_config(format!("failed to parse tokenizer: {}", e)))?;
        Self::from_tokenizer(tokenizer, name.into())
    }

    fn from_tokenizer(mut tokenizer: Tokenizer, name: String) -> Result<Self> {
        // counts must reflect the full text, not a truncated window
        tokenizer
            .with_truncation(None)
            .map_err(|e| RagError::invalid_config(format!("tokenizer truncation: {}", e)))?;
        tokenizer.with_padding(None);
        Ok(Self { tokenizer, name })
    }
}

impl TokenEstimator for TokenizerEstimator {
    fn estimate(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.len(),
            // byte length bounds any byte-level vocabulary from above
            Err(err) => {
                tracing::debug!("tokenizer {} failed to encode: {}", self.name, err);
                text.len()
            }
        }
    }

    fn is_exact(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub type SharedEstimator = Arc<dyn TokenEstimator>;
