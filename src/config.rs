// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration file support for ragdex
//!
//! Loads configuration from .ragdexrc.toml in current directory or ~/.config/ragdex/config.toml

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use crate::embedding::generator::{concurrency_for_memory, GeneratorConfig};
use crate::embedding::retry::RetryPolicy;
use crate::engine::EngineOptions;
use crate::errors::{RagError, Result};
use crate::hybrid::{FusionConfig, SearchMode};
use crate::types::{DistanceMetric, IndexDescriptor, Modality, ModelDescriptor};

pub const DEFAULT_DATA_DIR: &str = ".ragdex";
pub const DATA_DIR_ENV: &str = "RAGDEX_DATA_DIR";

/// Chunking configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Fraction of the token budget repeated between consecutive chunks
    pub overlap_ratio: Option<f32>,
    /// Fraction of a model's max_tokens a chunk may use
    pub safety_margin: Option<f32>,
    /// Hard cap on chunk tokens, applied below the model limit
    pub max_tokens: Option<usize>,
}

impl ChunkingConfig {
    /// Get overlap ratio (defaults to 0.15)
    pub fn overlap_ratio(&self) -> f32 {
        self.overlap_ratio.unwrap_or(0.15)
    }

    /// Get safety margin (defaults to 0.8)
    pub fn safety_margin(&self) -> f32 {
        self.safety_margin.unwrap_or(0.8)
    }
}

/// Embedding generation configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Concurrent in-flight provider requests
    pub max_concurrency: Option<usize>,
    /// Available memory in GB, used to derive concurrency when max_concurrency is unset
    pub memory_gb: Option<usize>,
    /// Token-bucket refill rate
    pub requests_per_second: Option<f64>,
    /// Retries per model before falling back
    pub max_retries: Option<u32>,
    /// First backoff delay in milliseconds
    pub retry_base_delay_ms: Option<u64>,
    /// Backoff ceiling in milliseconds
    pub retry_max_delay_ms: Option<u64>,
    /// LRU cache entries (0 disables caching)
    pub cache_capacity: Option<usize>,
}

impl EmbeddingConfig {
    /// Get max concurrency (defaults to 8, or derived from memory_gb)
    pub fn max_concurrency(&self) -> usize {
        match (self.max_concurrency, self.memory_gb) {
            (Some(value), _) => value.max(1),
            (None, Some(gb)) => concurrency_for_memory(gb),
            (None, None) => 8,
        }
    }

    /// Get requests per second (defaults to 10)
    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second.unwrap_or(10.0)
    }

    /// Get retry policy (defaults to 3 retries starting at 1s)
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(3),
            base_delay: Duration::from_millis(self.retry_base_delay_ms.unwrap_or(1000)),
            max_delay: Duration::from_millis(self.retry_max_delay_ms.unwrap_or(30_000)),
        }
    }

    /// Get cache capacity (defaults to 10000)
    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity.unwrap_or(crate::cache::DEFAULT_CAPACITY)
    }
}

/// Search configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Default search mode (keyword, semantic, hybrid)
    pub default_mode: Option<SearchMode>,
    /// Weight of the vector side in fusion (0.0-1.0)
    pub weight_semantic: Option<f32>,
    /// Fusion constant K
    pub rrf_k: Option<f32>,
    /// Candidates fetched per side, as a multiple of k
    pub candidate_multiplier: Option<usize>,
    /// Per-query deadline in milliseconds
    pub deadline_ms: Option<u64>,
    /// Default number of results
    pub max_results: Option<usize>,
}

impl SearchConfig {
    /// Get default search mode (defaults to Hybrid)
    pub fn mode(&self) -> SearchMode {
        self.default_mode.unwrap_or_default()
    }

    /// Get fusion parameters (defaults to K=60, weight 0.7, 2k candidates)
    pub fn fusion(&self) -> FusionConfig {
        let defaults = FusionConfig::default();
        FusionConfig {
            rrf_k: self.rrf_k.unwrap_or(defaults.rrf_k),
            weight_semantic: self.weight_semantic.unwrap_or(defaults.weight_semantic),
            candidate_multiplier: self
                .candidate_multiplier
                .unwrap_or(defaults.candidate_multiplier),
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Get max results (defaults to 10)
    pub fn max_results(&self) -> usize {
        self.max_results.unwrap_or(10)
    }
}

/// Approximate-NN parameters for one modality
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IndexParamsConfig {
    pub m: Option<usize>,
    pub ef_construction: Option<usize>,
    pub ef_search: Option<usize>,
    pub metric: Option<DistanceMetric>,
}

impl IndexParamsConfig {
    pub fn descriptor(&self) -> IndexDescriptor {
        let defaults = IndexDescriptor::default();
        IndexDescriptor {
            m: self.m.unwrap_or(defaults.m),
            ef_construction: self.ef_construction.unwrap_or(defaults.ef_construction),
            ef_search: self.ef_search.unwrap_or(defaults.ef_search),
            metric: self.metric.unwrap_or(defaults.metric),
        }
    }
}

/// Embedding provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local fastembed model
    #[default]
    Builtin,
    /// External process speaking JSON over stdin/stdout
    Command,
    /// Deterministic feature hashing, no model download
    Hash,
}

/// One `[[models]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    #[serde(default)]
    pub provider: ProviderKind,
    pub dimension: Option<usize>,
    pub max_tokens: Option<usize>,
    pub priority: Option<u32>,
    #[serde(default)]
    pub modalities: Vec<Modality>,
    pub metric: Option<DistanceMetric>,
    /// Shell command for the command provider
    pub command: Option<String>,
    /// tokenizer.json for exact token counts
    pub tokenizer: Option<PathBuf>,
    pub description: Option<String>,
    /// Parallel inference sessions for builtin models; each holds a copy
    /// of the model in memory
    pub sessions: Option<usize>,
}

impl ModelConfig {
    /// Get dimension (defaults to 384)
    pub fn dimension(&self) -> usize {
        self.dimension.unwrap_or(384)
    }

    /// Get max tokens (defaults to 512)
    pub fn max_tokens(&self) -> usize {
        self.max_tokens.unwrap_or(512)
    }

    /// Get priority (defaults to 1)
    pub fn priority(&self) -> u32 {
        self.priority.unwrap_or(1)
    }

    /// Builtin inference sessions (defaults to 1)
    pub fn sessions(&self) -> usize {
        self.sessions.unwrap_or(1).max(1)
    }

    /// Modalities served (defaults to all)
    pub fn modalities(&self) -> Vec<Modality> {
        if self.modalities.is_empty() {
            Modality::ALL.to_vec()
        } else {
            self.modalities.clone()
        }
    }

    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor::new(
            self.model_id.clone(),
            self.dimension(),
            self.max_tokens(),
            self.priority(),
        )
        .with_modalities(&self.modalities())
        .with_metric(self.metric.unwrap_or_default())
        .with_description(self.description.clone().unwrap_or_default())
    }

    fn builtin(model_id: &str, dimension: usize, max_tokens: usize, priority: u32) -> Self {
        Self {
            model_id: model_id.to_string(),
            provider: ProviderKind::Builtin,
            dimension: Some(dimension),
            max_tokens: Some(max_tokens),
            priority: Some(priority),
            modalities: Vec::new(),
            metric: None,
            command: None,
            tokenizer: None,
            description: None,
            sessions: None,
        }
    }
}

/// Models used when the config file declares none: a local MiniLM model
/// with a hashing fallback that always works offline.
pub fn default_models() -> Vec<ModelConfig> {
    let mut hash = ModelConfig::builtin("hash-384", 384, 512, 100);
    hash.provider = ProviderKind::Hash;
    hash.description = Some("feature hashing fallback".to_string());
    let mut minilm = ModelConfig::builtin("all-minilm-l6-v2", 384, 256, 1);
    minilm.description = Some("sentence-transformers/all-MiniLM-L6-v2".to_string());
    vec![minilm, hash]
}

/// Configuration loaded from .ragdexrc.toml or ~/.config/ragdex/config.toml
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the vector database and keyword index
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub search: SearchConfig,

    /// Per-modality index parameters keyed by modality name
    #[serde(default)]
    pub index: HashMap<String, IndexParamsConfig>,

    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

impl Config {
    /// Load configuration from files
    ///
    /// Precedence (highest to lowest):
    /// 1. .ragdexrc.toml in current directory
    /// 2. ~/.config/ragdex/config.toml
    pub fn load() -> Self {
        if let Some(config) = Self::load_from_path(&PathBuf::from(".ragdexrc.toml")) {
            return config;
        }

        if let Some(home) = dirs::home_dir() {
            let config_path = home.join(".config").join("ragdex").join("config.toml");
            if let Some(config) = Self::load_from_path(&config_path) {
                return config;
            }
        }

        Self::default()
    }

    fn load_from_path(path: &PathBuf) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match Self::from_toml(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Data directory: `RAGDEX_DATA_DIR`, then config, then `.ragdex`
    pub fn data_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    /// Configured models, or the built-in defaults
    pub fn models(&self) -> Vec<ModelConfig> {
        if self.models.is_empty() {
            default_models()
        } else {
            self.models.clone()
        }
    }

    /// Index parameters per modality, validated
    pub fn index_params(&self) -> Result<BTreeMap<Modality, IndexDescriptor>> {
        let mut params: BTreeMap<Modality, IndexDescriptor> = Modality::ALL
            .iter()
            .map(|m| (*m, IndexDescriptor::default()))
            .collect();
        for (name, entry) in &self.index {
            let modality: Modality = name.parse().map_err(RagError::InvalidConfig)?;
            let descriptor = entry.descriptor();
            descriptor.validate()?;
            params.insert(modality, descriptor);
        }
        Ok(params)
    }

    /// Resolve the file into options consumed by the engine
    pub fn engine_options(&self) -> Result<EngineOptions> {
        let overlap_ratio = self.chunking.overlap_ratio();
        if !(0.0..0.5).contains(&overlap_ratio) {
            return Err(RagError::invalid_config(
                "chunking.overlap_ratio must be in [0, 0.5)",
            ));
        }
        let safety_margin = self.chunking.safety_margin();
        if !(safety_margin > 0.0 && safety_margin <= 1.0) {
            return Err(RagError::invalid_config(
                "chunking.safety_margin must be in (0, 1]",
            ));
        }
        let fusion = self.search.fusion();
        fusion.validate()?;

        Ok(EngineOptions {
            overlap_ratio,
            safety_margin,
            max_chunk_tokens: self.chunking.max_tokens,
            generator: GeneratorConfig {
                max_concurrency: self.embedding.max_concurrency(),
                requests_per_second: self.embedding.requests_per_second(),
                retry: self.embedding.retry_policy(),
            },
            cache_capacity: self.embedding.cache_capacity(),
            fusion,
            default_mode: self.search.mode(),
            deadline: self.search.deadline(),
            index: self.index_params()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        let options = config.engine_options().unwrap();
        assert!((options.overlap_ratio - 0.15).abs() < f32::EPSILON);
        assert!((options.safety_margin - 0.8).abs() < f32::EPSILON);
        assert_eq!(options.generator.max_concurrency, 8);
        assert_eq!(options.generator.retry.max_retries, 3);
        assert_eq!(options.fusion.rrf_k, 60.0);
        assert_eq!(options.default_mode, SearchMode::Hybrid);
        assert_eq!(options.index[&Modality::Code].ef_search, 100);
        assert_eq!(config.models().len(), 2);
    }

    #[test]
    fn test_parse_full_file() {
        let config = Config::from_toml(
            r#"
data_dir = "/tmp/rag"

[chunking]
overlap_ratio = 0.1

[embedding]
memory_gb = 6
requests_per_second = 2.5

[search]
default_mode = "keyword"
weight_semantic = 0.5
rrf_k = 30

[index.code]
m = 32
ef_construction = 400
ef_search = 200

[[models]]
model_id = "embedder-a"
provider = "command"
command = "embed.sh"
dimension = 768
priority = 1
modalities = ["prose", "image_caption"]

[[models]]
model_id = "hash-64"
provider = "hash"
dimension = 64
priority = 5
sessions = 4
"#,
        )
        .unwrap();

        let options = config.engine_options().unwrap();
        assert_eq!(options.generator.max_concurrency, 3);
        assert_eq!(options.fusion.weight_semantic, 0.5);
        assert_eq!(options.fusion.rrf_k, 30.0);
        assert_eq!(options.default_mode, SearchMode::Keyword);
        assert_eq!(options.index[&Modality::Code].m, 32);
        assert_eq!(options.index[&Modality::Prose].m, 16);

        let models = config.models();
        assert_eq!(models[0].provider, ProviderKind::Command);
        assert_eq!(
            models[0].descriptor().modalities,
            vec![Modality::Prose, Modality::ImageCaption]
        );
        assert_eq!(models[1].descriptor().modalities.len(), 4);
        assert_eq!(models[0].sessions(), 1);
        assert_eq!(models[1].sessions(), 4);
    }

    #[test]
    fn test_rejects_ef_search_above_construction() {
        let config = Config::from_toml(
            r#"
[index.prose]
ef_construction = 50
ef_search = 100
"#,
        )
        .unwrap();
        assert!(config.engine_options().is_err());
    }

    #[test]
    fn test_rejects_unknown_modality() {
        let config = Config::from_toml("[index.video]\nm = 8\n").unwrap();
        assert!(matches!(
            config.index_params(),
            Err(RagError::InvalidConfig(_))
        ));
    }
}
