// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retrieval engine: ingestion, deletion, search and introspection over one
//! data directory.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, EmbeddingCache};
use crate::embedding::chunker::{DEFAULT_OVERLAP_RATIO, DEFAULT_SAFETY_MARGIN};
use crate::embedding::tokens::HeuristicEstimator;
use crate::embedding::{
    ChunkConfig, Chunker, EmbeddingGenerator, GeneratorConfig, GeneratorStats, ProviderRegistry,
};
use crate::errors::{RagError, Result};
use crate::hybrid::{FusionConfig, HybridSearcher, SearchHit, SearchMode, SearchRequest, SearchStats};
use crate::parser::language_for_path;
use crate::store::{content_hash, ContentEntry, KeywordIndex, VectorStats, VectorStorage, VectorStore};
use crate::types::{unix_now, Chunk, ChunkId, EmbeddingRecord, IndexDescriptor, Modality, ModelDescriptor};

const VECTOR_DB: &str = "vectors.sqlite";
const KEYWORD_DIR: &str = "keyword";

/// Resolved engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub overlap_ratio: f32,
    pub safety_margin: f32,
    /// Caps the chunk token limit below the models' own limits.
    pub max_chunk_tokens: Option<usize>,
    pub generator: GeneratorConfig,
    /// Embedding cache entries; 0 disables caching.
    pub cache_capacity: usize,
    pub fusion: FusionConfig,
    pub default_mode: SearchMode,
    pub deadline: Option<Duration>,
    pub index: BTreeMap<Modality, IndexDescriptor>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            overlap_ratio: DEFAULT_OVERLAP_RATIO,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            max_chunk_tokens: None,
            generator: GeneratorConfig::default(),
            cache_capacity: crate::cache::DEFAULT_CAPACITY,
            fusion: FusionConfig::default(),
            default_mode: SearchMode::default(),
            deadline: None,
            index: BTreeMap::new(),
        }
    }
}

/// Outcome of ingesting one content item.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexResult {
    pub chunks_created: usize,
    pub embeddings_created: usize,
    /// Chunks that could not be embedded. They remain keyword-searchable.
    pub failures: Vec<ChunkId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub modality: Modality,
    pub chunk_count: usize,
    pub index_params: IndexDescriptor,
    pub cache_hit_rate: f64,
    pub cache: CacheStats,
    pub keyword_chunks: usize,
    pub vectors: VectorStats,
    pub models: Vec<ModelDescriptor>,
    pub search: SearchStats,
    pub generator: GeneratorStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelHealth {
    pub model_id: String,
    pub healthy: bool,
    pub dimension: usize,
    pub priority: u32,
    pub modalities: Vec<Modality>,
}

pub struct RetrievalEngine {
    options: EngineOptions,
    registry: Arc<ProviderRegistry>,
    generator: Arc<EmbeddingGenerator>,
    storage: Arc<VectorStorage>,
    vectors: Arc<VectorStore>,
    keywords: Arc<KeywordIndex>,
    searcher: HybridSearcher,
}

impl RetrievalEngine {
    /// Opens (or creates) the engine state stored under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>, options: EngineOptions, registry: ProviderRegistry) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let storage = VectorStorage::open(data_dir.join(VECTOR_DB))?;
        let keywords = KeywordIndex::open(data_dir.join(KEYWORD_DIR))?;
        debug!("opened engine state in {}", data_dir.display());
        Self::assemble(options, registry, storage, keywords)
    }

    /// Engine with no persistent state.
    pub fn in_memory(options: EngineOptions, registry: ProviderRegistry) -> Result<Self> {
        Self::assemble(
            options,
            registry,
            VectorStorage::open_in_memory()?,
            KeywordIndex::in_memory()?,
        )
    }

    fn assemble(
        options: EngineOptions,
        registry: ProviderRegistry,
        storage: VectorStorage,
        keywords: KeywordIndex,
    ) -> Result<Self> {
        options.fusion.validate()?;
        for params in options.index.values() {
            params.validate()?;
        }

        let registry = Arc::new(registry);
        let cache = EmbeddingCache::shared(options.cache_capacity);
        let generator = Arc::new(EmbeddingGenerator::new(
            Arc::clone(&registry),
            cache,
            options.generator,
        ));
        let storage = Arc::new(storage);
        let vectors = Arc::new(VectorStore::open(
            Arc::clone(&storage),
            registry.models(),
            options.index.clone(),
        )?);
        let keywords = Arc::new(keywords);
        let searcher = HybridSearcher::new(
            Arc::clone(&vectors),
            Arc::clone(&keywords),
            Arc::clone(&generator),
            options.fusion,
        );

        Ok(Self {
            options,
            registry,
            generator,
            storage,
            vectors,
            keywords,
            searcher,
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Chunker for `modality`, sized for the smallest token limit among
    /// the models that may embed its chunks.
    pub fn chunker(&self, modality: Modality) -> Result<Chunker> {
        let models = self.registry.resolve(modality);
        let primary = models.first().ok_or(RagError::NoModel(modality))?;
        let mut max_tokens = models.iter().map(|m| m.max_tokens).min().unwrap_or(primary.max_tokens);
        if let Some(cap) = self.options.max_chunk_tokens {
            max_tokens = max_tokens.min(cap);
        }

        let config = ChunkConfig::new(max_tokens)?
            .with_safety_margin(self.options.safety_margin)
            .with_overlap_ratio(self.options.overlap_ratio);
        config.validate()?;

        let estimator = self
            .registry
            .estimator(&primary.model_id)
            .unwrap_or_else(|| Arc::new(HeuristicEstimator::for_modality(modality)));
        Ok(Chunker::new(config, estimator))
    }

    /// Chunks, embeds and keyword-indexes `content`, replacing anything
    /// previously stored under `content_id`.
    ///
    /// The previous version stays searchable until the new one is ready.
    /// Vectors are swapped first, then keyword postings, then the bookkeeping
    /// row; a failure part way leaves the old hash recorded, so the next run
    /// re-indexes the content.
    ///
    /// Embedding failures do not fail the call; they are listed in
    /// [`IndexResult::failures`].
    pub async fn index_content(
        &self,
        content_id: &str,
        modality: Modality,
        content: impl AsRef<[u8]>,
    ) -> Result<IndexResult> {
        let bytes = content.as_ref();
        let chunker = self.chunker(modality)?;
        let language = if modality == Modality::Code {
            language_for_path(content_id)
        } else {
            None
        };
        let chunks: Vec<Chunk> = chunker.chunk(content_id, modality, bytes, language)?.collect();

        let outcome = self.generator.embed_batch(&chunks, modality).await;
        let failures = outcome.failed_ids();
        let created_at = unix_now();
        let records: Vec<EmbeddingRecord> = chunks
            .iter()
            .zip(outcome.items)
            .filter_map(|(chunk, (_, result))| {
                let embedded = result.ok()?;
                Some(EmbeddingRecord {
                    chunk_id: chunk.id.clone(),
                    modality,
                    model_id: embedded.model_id,
                    vector: embedded.vector.to_vec(),
                    metadata: chunk.metadata(),
                    created_at,
                })
            })
            .collect();

        let vectors = Arc::clone(&self.vectors);
        let keywords = Arc::clone(&self.keywords);
        let id = content_id.to_string();
        let (chunks, embeddings_created) = tokio::task::spawn_blocking(move || -> Result<(Vec<Chunk>, usize)> {
            let embeddings_created = vectors.replace_content(&id, records)?;
            if let Err(err) = keywords.replace_content(&id, &chunks) {
                warn!(
                    "{}: vectors replaced but keyword postings still hold the previous version: {}",
                    id, err
                );
                return Err(err);
            }
            Ok((chunks, embeddings_created))
        })
        .await??;

        self.storage.upsert_content(&ContentEntry {
            content_id: content_id.to_string(),
            modality,
            content_hash: content_hash(bytes),
            chunk_count: chunks.len(),
            indexed_at: created_at,
        })?;

        info!(
            "indexed {} ({}): {} chunks, {} embeddings, {} failures",
            content_id,
            modality,
            chunks.len(),
            embeddings_created,
            failures.len()
        );
        Ok(IndexResult {
            chunks_created: chunks.len(),
            embeddings_created,
            failures,
        })
    }

    /// Deletes every chunk and embedding owned by `content_id`. Returns the
    /// number of embedding records removed.
    pub async fn remove_content(&self, content_id: &str) -> Result<usize> {
        let vectors = Arc::clone(&self.vectors);
        let keywords = Arc::clone(&self.keywords);
        let id = content_id.to_string();
        tokio::task::spawn_blocking(move || {
            let removed = vectors.remove_content(&id)?;
            keywords.remove_content(&id)?;
            Ok(removed)
        })
        .await?
    }

    /// True when `content` is already indexed unchanged under `content_id`.
    pub fn is_current(&self, content_id: &str, modality: Modality, content: impl AsRef<[u8]>) -> Result<bool> {
        self.storage
            .is_current(content_id, modality, &content_hash(content.as_ref()))
    }

    pub fn indexed_contents(&self) -> Result<Vec<String>> {
        self.storage.list_contents()
    }

    /// Top `k` chunks for `query` using the configured mode and deadline.
    pub async fn search(
        &self,
        query: &str,
        modality: Modality,
        k: usize,
        weight_semantic: Option<f32>,
    ) -> Result<Vec<SearchHit>> {
        let mut request = self.request(query, modality, k);
        request.weight_semantic = weight_semantic;
        self.searcher.search(&request).await
    }

    /// A request pre-filled with the configured mode and deadline.
    pub fn request(&self, query: &str, modality: Modality, k: usize) -> SearchRequest {
        let mut request = SearchRequest::new(query, modality, k).with_mode(self.options.default_mode);
        request.deadline = self.options.deadline;
        request
    }

    pub async fn search_with(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        self.searcher.search(request).await
    }

    pub fn compact(&self, modality: Modality) -> usize {
        self.vectors.compact(modality)
    }

    pub fn stats(&self, modality: Modality) -> Result<EngineStats> {
        let vectors = self.vectors.stats(modality);
        let cache = self.generator.cache().stats();
        Ok(EngineStats {
            modality,
            chunk_count: vectors.chunk_count,
            index_params: vectors.params,
            cache_hit_rate: cache.hit_rate,
            cache,
            keyword_chunks: self.keywords.modality_count(modality)?,
            vectors,
            models: self.registry.resolve(modality).to_vec(),
            search: self.searcher.stats(),
            generator: self.generator.stats(),
        })
    }

    /// Re-checks every registered model.
    pub fn health(&self) -> Vec<ModelHealth> {
        self.registry
            .health()
            .into_iter()
            .filter_map(|(model_id, healthy)| {
                let descriptor = self.registry.descriptor(&model_id)?;
                Some(ModelHealth {
                    healthy,
                    dimension: descriptor.dimension,
                    priority: descriptor.priority,
                    modalities: descriptor.modalities.clone(),
                    model_id,
                })
            })
            .collect()
    }
}
