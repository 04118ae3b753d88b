// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding provider interface and implementations.
//!
//! Providers are synchronous and shared behind `Arc`; the generator calls
//! them from blocking tasks. Failures are reported as [`EmbeddingError`] so
//! the caller can tell retryable outages from inputs that will never embed.

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;
use serde_json::Value;
use std::borrow::Cow;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{ModelConfig, ProviderKind};
use crate::errors::{EmbeddingError, RagError, Result};

const DEFAULT_FASTEMBED_BATCH_SIZE: usize = 256;
const DEFAULT_FASTEMBED_MAX_CHARS: usize = 2000;
const DEFAULT_COMMAND_BATCH_SIZE: usize = 64;

/// Exit status a command provider uses to reject its input for good.
pub const COMMAND_EXIT_FATAL: i32 = 65;

/// Trait for embedding providers.
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, matching the registry descriptor.
    fn model_id(&self) -> &str;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;

    /// Preferred number of texts per call.
    fn batch_size(&self) -> usize {
        DEFAULT_COMMAND_BATCH_SIZE
    }

    /// Health check run once at registration and by `health()`.
    fn health_check(&self) -> bool {
        true
    }

    /// Embed a batch of texts, one vector per text, in order.
    fn embed_texts(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError>;

    fn embed_one(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
        self.embed_texts(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::model("provider returned no embedding"))
    }
}

/// Fixed set of exclusive sessions. A call takes the first idle one and
/// only waits when every session is busy.
pub struct SessionPool<T> {
    sessions: Vec<Mutex<T>>,
    next: AtomicUsize,
}

impl<T> SessionPool<T> {
    /// Builds `size` sessions (at least one) with `make`.
    pub fn build(size: usize, mut make: impl FnMut() -> Result<T>) -> Result<Self> {
        let sessions = (0..size.max(1))
            .map(|_| make().map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            sessions,
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.sessions.len()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        for session in &self.sessions {
            if let Some(mut guard) = session.try_lock() {
                return f(&mut guard);
            }
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        f(&mut self.sessions[idx].lock())
    }
}

/// FastEmbed provider running an ONNX sentence-transformer locally.
///
/// Inference needs exclusive access to a session, so concurrent calls run in
/// parallel only up to the pool size set by the model's `sessions` option.
pub struct FastEmbedder {
    pool: SessionPool<TextEmbedding>,
    model_id: String,
    dimension: usize,
    batch_size: usize,
    max_chars: usize,
}

impl FastEmbedder {
    pub fn new(model_id: &str, dimension: usize, sessions: usize) -> Result<Self> {
        let model = builtin_model(model_id).ok_or_else(|| {
            RagError::invalid_config(format!(
                "unsupported builtin model '{}'. Supported: {}",
                model_id,
                BUILTIN_MODELS.join(", ")
            ))
        })?;
        let pool = SessionPool::build(sessions, || {
            TextEmbedding::try_new(InitOptions::new(model.clone())).map_err(|e| {
                RagError::EmbeddingProvider(format!("failed to initialize fastembed model: {}", e))
            })
        })?;
        tracing::debug!("loaded '{}' with {} inference sessions", model_id, pool.size());

        Ok(Self {
            pool,
            model_id: model_id.to_string(),
            dimension,
            batch_size: DEFAULT_FASTEMBED_BATCH_SIZE,
            max_chars: DEFAULT_FASTEMBED_MAX_CHARS,
        })
    }
}

impl EmbeddingProvider for FastEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn embed_texts(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prepared = truncate_texts(texts, self.max_chars);
        let mut embeddings = self
            .pool
            .with(|embedder| embedder.embed(&prepared, Some(self.batch_size)))
            .map_err(|e| EmbeddingError::transient(format!("fastembed: {}", e)))?;

        for embedding in embeddings.iter_mut() {
            l2_normalize(embedding);
        }

        Ok(embeddings)
    }
}

/// Builtin model ids accepted by [`FastEmbedder`].
pub const BUILTIN_MODELS: &[&str] = &[
    "all-minilm-l6-v2",
    "bge-small-en-v1.5",
    "bge-base-en-v1.5",
    "nomic-embed-text-v1.5",
    "mxbai-embed-large-v1",
];

fn builtin_model(model_id: &str) -> Option<EmbeddingModel> {
    match model_id.trim().to_lowercase().as_str() {
        "minilm" | "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
            Some(EmbeddingModel::AllMiniLML6V2)
        }
        "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => Some(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" | "baai/bge-base-en-v1.5" => Some(EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" | "nomic-embed-text" => Some(EmbeddingModel::NomicEmbedTextV15),
        "mxbai-embed-large-v1" | "mxbai-embed-large" => Some(EmbeddingModel::MxbaiEmbedLargeV1),
        _ => None,
    }
}

/// Command provider that shells out to an external process.
///
/// The command receives `{"model": ..., "texts": [...]}` on stdin and prints
/// either a JSON array of vectors or an object with an `embeddings`,
/// `vectors` or `data` field. Exit status 65 marks the input as unembeddable;
/// any other failure is treated as transient.
pub struct CommandProvider {
    command: String,
    model: String,
    dimension: usize,
    batch_size: usize,
}

impl CommandProvider {
    pub fn new(command: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            command: command.into(),
            model: model.into(),
            dimension,
            batch_size: DEFAULT_COMMAND_BATCH_SIZE,
        }
    }

    fn run_command(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let payload = serde_json::json!({
            "model": self.model,
            "texts": texts,
        });

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EmbeddingError::transient(format!(
                    "failed to spawn embedding command '{}': {}",
                    self.command, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.to_string().as_bytes())
                .map_err(|e| EmbeddingError::transient(format!("failed to write payload: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| EmbeddingError::transient(format!("failed to read output: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!(
                "embedding command failed (status {}): {}",
                output.status,
                stderr.trim()
            );
            return Err(if output.status.code() == Some(COMMAND_EXIT_FATAL) {
                EmbeddingError::fatal(message)
            } else {
                EmbeddingError::transient(message)
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_vectors(stdout.trim()).map_err(EmbeddingError::Model)
    }
}

fn parse_vectors(raw: &str) -> std::result::Result<Vec<Vec<f32>>, String> {
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|e| format!("embeddings output is not JSON: {}", e))?;

    let rows = match parsed {
        Value::Array(arr) => arr,
        Value::Object(mut obj) => match ["embeddings", "vectors", "data"]
            .iter()
            .find_map(|key| obj.remove(*key))
        {
            Some(Value::Array(arr)) => arr,
            Some(_) => return Err("embeddings field must be a JSON array".to_string()),
            None => return Err("embeddings output missing 'embeddings' field".to_string()),
        },
        _ => return Err("embeddings output must be JSON array or object".to_string()),
    };

    rows.iter()
        .map(|row| -> std::result::Result<Vec<f32>, String> {
            row.as_array()
                .ok_or_else(|| "embedding row must be an array".to_string())?
                .iter()
                .map(|value| {
                    value
                        .as_f64()
                        .map(|v| v as f32)
                        .ok_or_else(|| "embedding value must be a number".to_string())
                })
                .collect()
        })
        .collect()
}

impl EmbeddingProvider for CommandProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn health_check(&self) -> bool {
        match self.run_command(&["health check".to_string()]) {
            Ok(vectors) => vectors.first().map(Vec::len) == Some(self.dimension),
            Err(err) => {
                tracing::debug!("health check of '{}' failed: {}", self.model, err);
                false
            }
        }
    }

    fn embed_texts(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.run_command(texts)
    }
}

/// Feature-hashing provider. Each lowercase word and word bigram is hashed
/// into a signed bucket; the result is L2-normalized. Needs no model files,
/// so it works as an offline fallback and in tests.
pub struct HashEmbedder {
    model: String,
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension: dimension.max(1),
        }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut vector = vec![0.0f32; self.dimension];
        let mut add = |feature: &str, weight: f32| {
            let hash = blake3::hash(feature.as_bytes());
            let bytes = hash.as_bytes();
            let mut idx = [0u8; 8];
            idx.copy_from_slice(&bytes[..8]);
            let bucket = (u64::from_le_bytes(idx) % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign * weight;
        };
        for word in &words {
            add(word, 1.0);
        }
        for pair in words.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]), 0.5);
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_texts(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

/// Instantiate the provider described by a `[[models]]` entry.
pub fn build_provider(model: &ModelConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match model.provider {
        ProviderKind::Builtin => Arc::new(FastEmbedder::new(
            &model.model_id,
            model.dimension(),
            model.sessions(),
        )?),
        ProviderKind::Command => {
            let command = model.command.clone().ok_or_else(|| {
                RagError::invalid_config(format!(
                    "model '{}' uses the command provider but has no command",
                    model.model_id
                ))
            })?;
            Arc::new(CommandProvider::new(command, model.model_id.clone(), model.dimension()))
        }
        ProviderKind::Hash => Arc::new(HashEmbedder::new(model.model_id.clone(), model.dimension())),
    };
    Ok(provider)
}

fn truncate_texts(texts: &[String], max_chars: usize) -> Vec<Cow<'_, str>> {
    texts
        .iter()
        .map(|text| truncate_to_chars(text.as_str(), max_chars))
        .collect()
}

fn truncate_to_chars(input: &str, max_chars: usize) -> Cow<'_, str> {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => Cow::Owned(input[..idx].to_string()),
        None => Cow::Borrowed(input),
    }
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}
