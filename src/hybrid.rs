// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hybrid search combining BM25 and embedding similarity.
//!
//! Vector and keyword sub-queries run concurrently and their ranked lists are
//! merged with weighted reciprocal rank fusion:
//!
//! ```text
//! combined = w * 1/(K + rank_vector) + (1 - w) * 1/(K + rank_keyword)
//! ```
//!
//! An item missing from one list contributes 0 for that side. If one
//! sub-query fails the other list is used alone; if both fail the query
//! fails with `RetrievalUnavailable`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::embedding::EmbeddingGenerator;
use crate::errors::{RagError, Result};
use crate::store::vector::sort_hits;
use crate::store::{KeywordHit, KeywordIndex, VectorHit, VectorStore};
use crate::types::{snippet, ChunkId, Modality};

/// Characters of chunk text kept in a result snippet.
pub const SNIPPET_CHARS: usize = 240;

/// Search mode for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// BM25 keyword search only
    Keyword,
    /// Embedding-based semantic search only
    Semantic,
    /// Combined BM25 + embedding search
    #[default]
    Hybrid,
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchMode::Keyword => write!(f, "keyword"),
            SearchMode::Semantic => write!(f, "semantic"),
            SearchMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keyword" | "k" => Ok(SearchMode::Keyword),
            "semantic" | "s" => Ok(SearchMode::Semantic),
            "hybrid" | "h" => Ok(SearchMode::Hybrid),
            _ => Err(format!("Unknown search mode: {}", s)),
        }
    }
}

/// Rank fusion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionConfig {
    /// RRF constant `K`; larger values flatten rank differences.
    pub rrf_k: f32,
    /// Weight of the vector list, in `[0, 1]`.
    pub weight_semantic: f32,
    /// Each sub-query fetches `k * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            weight_semantic: 0.7,
            candidate_multiplier: 2,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.rrf_k.is_finite() && self.rrf_k > 0.0) {
            return Err(RagError::invalid_config(format!(
                "rrf_k must be positive, got {}",
                self.rrf_k
            )));
        }
        check_weight(self.weight_semantic)?;
        if self.candidate_multiplier == 0 {
            return Err(RagError::invalid_config("candidate_multiplier must be at least 1"));
        }
        Ok(())
    }
}

fn check_weight(weight: f32) -> Result<()> {
    if (0.0..=1.0).contains(&weight) {
        Ok(())
    } else {
        Err(RagError::invalid_config(format!(
            "weight_semantic must be within [0, 1], got {}",
            weight
        )))
    }
}

/// One fused item with its 1-based rank in each list.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub vector_rank: Option<usize>,
    pub keyword_rank: Option<usize>,
}

/// Weighted reciprocal rank fusion of two ranked lists, best first, at most
/// `k` items. Ties are broken by chunk id. A repeated id keeps its best rank.
pub fn reciprocal_rank_fusion(
    vector: &[ChunkId],
    keyword: &[ChunkId],
    rrf_k: f32,
    weight_semantic: f32,
    k: usize,
) -> Vec<FusedHit> {
    let mut fused: HashMap<&ChunkId, FusedHit> = HashMap::new();
    for (idx, id) in vector.iter().enumerate() {
        let hit = slot(&mut fused, id);
        hit.vector_rank = hit.vector_rank.or(Some(idx + 1));
    }
    for (idx, id) in keyword.iter().enumerate() {
        let hit = slot(&mut fused, id);
        hit.keyword_rank = hit.keyword_rank.or(Some(idx + 1));
    }

    let rrf = |rank: Option<usize>| rank.map_or(0.0, |r| 1.0 / (rrf_k + r as f32));
    let mut hits: Vec<FusedHit> = fused
        .into_values()
        .map(|mut hit| {
            hit.score = weight_semantic * rrf(hit.vector_rank)
                + (1.0 - weight_semantic) * rrf(hit.keyword_rank);
            hit
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k);
    hits
}

fn slot<'a, 'b>(fused: &'b mut HashMap<&'a ChunkId, FusedHit>, id: &'a ChunkId) -> &'b mut FusedHit {
    fused.entry(id).or_insert_with(|| FusedHit {
        chunk_id: id.clone(),
        score: 0.0,
        vector_rank: None,
        keyword_rank: None,
    })
}

/// A query against one modality.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub modality: Modality,
    pub k: usize,
    /// Overrides the configured fusion weight.
    pub weight_semantic: Option<f32>,
    pub mode: SearchMode,
    pub deadline: Option<Duration>,
    /// Overrides the modality's `ef_search`.
    pub ef_search: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, modality: Modality, k: usize) -> Self {
        Self {
            query: query.into(),
            modality,
            k,
            weight_semantic: None,
            mode: SearchMode::Hybrid,
            deadline: None,
            ef_search: None,
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_weight(mut self, weight_semantic: f32) -> Self {
        self.weight_semantic = Some(weight_semantic);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A ranked search result.
///
/// In hybrid mode `score` is the fused RRF score; in single modes it is the
/// sub-query's own score (similarity or BM25).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub content_id: String,
    pub score: f32,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_rank: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SearchStats {
    pub queries: u64,
    /// Hybrid queries answered from one side only.
    pub degraded: u64,
    pub deadline_exceeded: u64,
    pub unavailable: u64,
    pub mean_latency_ms: f64,
}

#[derive(Default)]
struct SearchCounters {
    queries: AtomicU64,
    degraded: AtomicU64,
    deadline_exceeded: AtomicU64,
    unavailable: AtomicU64,
    latency_micros: AtomicU64,
}

pub struct HybridSearcher {
    vectors: Arc<VectorStore>,
    keywords: Arc<KeywordIndex>,
    generator: Arc<EmbeddingGenerator>,
    fusion: FusionConfig,
    counters: SearchCounters,
}

impl HybridSearcher {
    pub fn new(
        vectors: Arc<VectorStore>,
        keywords: Arc<KeywordIndex>,
        generator: Arc<EmbeddingGenerator>,
        fusion: FusionConfig,
    ) -> Self {
        Self {
            vectors,
            keywords,
            generator,
            fusion,
            counters: SearchCounters::default(),
        }
    }

    pub fn fusion(&self) -> &FusionConfig {
        &self.fusion
    }

    pub fn stats(&self) -> SearchStats {
        let queries = self.counters.queries.load(Ordering::Relaxed);
        let micros = self.counters.latency_micros.load(Ordering::Relaxed);
        SearchStats {
            queries,
            degraded: self.counters.degraded.load(Ordering::Relaxed),
            deadline_exceeded: self.counters.deadline_exceeded.load(Ordering::Relaxed),
            unavailable: self.counters.unavailable.load(Ordering::Relaxed),
            mean_latency_ms: if queries == 0 {
                0.0
            } else {
                micros as f64 / queries as f64 / 1000.0
            },
        }
    }

    /// Runs `request`, failing with `DeadlineExceeded` if its deadline
    /// passes first. In-flight sub-queries are abandoned on timeout.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        if let Some(weight) = request.weight_semantic {
            check_weight(weight)?;
        }
        if request.k == 0 {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let result = match request.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, self.run(request)).await {
                Ok(result) => result,
                Err(_) => Err(RagError::DeadlineExceeded(deadline)),
            },
            None => self.run(request).await,
        };
        let elapsed = started.elapsed();

        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        self.counters
            .latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        match &result {
            Err(RagError::DeadlineExceeded(_)) => {
                self.counters.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(RagError::RetrievalUnavailable(_)) => {
                self.counters.unavailable.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        debug!(
            "{} search '{}' in {}: {:?}",
            request.mode, request.query, request.modality, elapsed
        );
        result
    }

    async fn run(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let candidates = request.k.saturating_mul(self.fusion.candidate_multiplier);
        match request.mode {
            SearchMode::Keyword => {
                let hits = self
                    .keyword_side(&request.query, request.modality, request.k)
                    .await
                    .map_err(|e| unavailable("keyword", &e))?;
                Ok(hits.into_iter().map(keyword_only).collect())
            }
            SearchMode::Semantic => {
                let hits = self
                    .vector_side(&request.query, request.modality, request.k, request.ef_search)
                    .await
                    .map_err(|e| unavailable("vector", &e))?;
                Ok(hits.into_iter().map(vector_only).collect())
            }
            SearchMode::Hybrid => {
                let (vector, keyword) = tokio::join!(
                    self.vector_side(&request.query, request.modality, candidates, request.ef_search),
                    self.keyword_side(&request.query, request.modality, candidates),
                );
                let (vector, keyword) = match (vector, keyword) {
                    (Ok(v), Ok(k)) => (v, k),
                    (Ok(v), Err(e)) => {
                        warn!("keyword search failed, using vector results only: {}", e);
                        self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                        (v, Vec::new())
                    }
                    (Err(e), Ok(k)) => {
                        warn!("vector search failed, using keyword results only: {}", e);
                        self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                        (Vec::new(), k)
                    }
                    (Err(ve), Err(ke)) => {
                        return Err(RagError::RetrievalUnavailable(format!(
                            "vector search failed: {}; keyword search failed: {}",
                            ve, ke
                        )))
                    }
                };
                let weight = request.weight_semantic.unwrap_or(self.fusion.weight_semantic);
                Ok(self.fuse(vector, keyword, weight, request.k))
            }
        }
    }

    fn fuse(&self, vector: Vec<VectorHit>, keyword: Vec<KeywordHit>, weight: f32, k: usize) -> Vec<SearchHit> {
        let vector_ids: Vec<ChunkId> = vector.iter().map(|h| h.chunk_id.clone()).collect();
        let keyword_ids: Vec<ChunkId> = keyword.iter().map(|h| h.chunk_id.clone()).collect();
        let fused = reciprocal_rank_fusion(&vector_ids, &keyword_ids, self.fusion.rrf_k, weight, k);

        let mut details: HashMap<ChunkId, (String, String)> = HashMap::new();
        for hit in keyword {
            details.insert(hit.chunk_id, (hit.content_id, snippet(&hit.text, SNIPPET_CHARS)));
        }
        for hit in vector {
            details.insert(
                hit.chunk_id,
                (hit.metadata.content_id.clone(), hit.metadata.snippet.clone()),
            );
        }

        fused
            .into_iter()
            .map(|f| {
                let (content_id, snippet) = details
                    .remove(&f.chunk_id)
                    .unwrap_or_else(|| (f.chunk_id.content_id().to_string(), String::new()));
                SearchHit {
                    chunk_id: f.chunk_id,
                    content_id,
                    score: f.score,
                    snippet,
                    vector_rank: f.vector_rank,
                    keyword_rank: f.keyword_rank,
                }
            })
            .collect()
    }

    /// Embeds the query once per model present in the modality and merges
    /// the per-model hit lists by score.
    async fn vector_side(
        &self,
        query: &str,
        modality: Modality,
        limit: usize,
        ef_search: Option<usize>,
    ) -> Result<Vec<VectorHit>> {
        let models = self.vectors.models_in(modality);
        if models.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        let mut last_err = None;
        for model_id in &models {
            let embedded = match self.generator.embed_query(query, model_id).await {
                Ok(embedded) => embedded,
                Err(err) => {
                    warn!("query embedding with '{}' failed: {}", model_id, err);
                    last_err = Some(RagError::from(err));
                    continue;
                }
            };
            let vectors = Arc::clone(&self.vectors);
            let model_id = model_id.clone();
            let found = tokio::task::spawn_blocking(move || {
                vectors.query(modality, &model_id, &embedded.vector, limit, ef_search)
            })
            .await??;
            hits.extend(found);
        }

        if hits.is_empty() {
            if let Some(err) = last_err {
                return Err(err);
            }
        }
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn keyword_side(&self, query: &str, modality: Modality, limit: usize) -> Result<Vec<KeywordHit>> {
        let keywords = Arc::clone(&self.keywords);
        let query = query.to_string();
        tokio::task::spawn_blocking(move || {
            let terms = keywords.extract_terms(&query);
            keywords.search(&terms, modality, limit)
        })
        .await?
    }
}

fn unavailable(side: &str, err: &RagError) -> RagError {
    RagError::RetrievalUnavailable(format!("{} search failed: {}", side, err))
}

fn keyword_only(hit: KeywordHit) -> SearchHit {
    SearchHit {
        snippet: snippet(&hit.text, SNIPPET_CHARS),
        chunk_id: hit.chunk_id,
        content_id: hit.content_id,
        score: hit.score,
        vector_rank: None,
        keyword_rank: None,
    }
}

fn vector_only(hit: VectorHit) -> SearchHit {
    SearchHit {
        content_id: hit.metadata.content_id.clone(),
        snippet: hit.metadata.snippet.clone(),
        chunk_id: hit.chunk_id,
        score: hit.score,
        vector_rank: None,
        keyword_rank: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingCache;
    use crate::embedding::{GeneratorConfig, HashEmbedder, ProviderRegistry, RetryPolicy};
    use crate::store::VectorStorage;
    use crate::types::{Chunk, EmbeddingRecord, ModelDescriptor};
    use std::collections::BTreeMap;

    fn ids(raw: &[&str]) -> Vec<ChunkId> {
        raw.iter().map(|s| ChunkId::from(*s)).collect()
    }

    #[test]
    fn test_search_mode_parsing() {
        assert_eq!("keyword".parse::<SearchMode>().unwrap(), SearchMode::Keyword);
        assert_eq!("semantic".parse::<SearchMode>().unwrap(), SearchMode::Semantic);
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert_eq!("h".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!("invalid".parse::<SearchMode>().is_err());
        assert_eq!(SearchMode::default(), SearchMode::Hybrid);
    }

    #[test]
    fn test_rrf_scores() {
        let fused = reciprocal_rank_fusion(&ids(&["a", "b"]), &ids(&["b", "c"]), 60.0, 0.7, 10);
        let score = |id: &str| fused.iter().find(|h| h.chunk_id.as_str() == id).unwrap().score;

        assert!((score("a") - 0.7 / 61.0).abs() < 1e-7);
        assert!((score("b") - (0.7 / 62.0 + 0.3 / 61.0)).abs() < 1e-7);
        assert!((score("c") - 0.3 / 62.0).abs() < 1e-7);
        assert_eq!(fused[0].chunk_id.as_str(), "b");
        assert_eq!(fused[0].vector_rank, Some(2));
        assert_eq!(fused[0].keyword_rank, Some(1));
    }

    #[test]
    fn test_first_in_both_beats_first_in_one() {
        for weight in [0.0, 0.3, 0.5, 0.7, 1.0] {
            let fused = reciprocal_rank_fusion(&ids(&["both", "v"]), &ids(&["both", "k"]), 60.0, weight, 10);
            assert_eq!(fused[0].chunk_id.as_str(), "both");

            let only_vector = reciprocal_rank_fusion(&ids(&["v"]), &[], 60.0, weight, 10);
            let only_keyword = reciprocal_rank_fusion(&[], &ids(&["k"]), 60.0, weight, 10);
            let single = only_vector
                .first()
                .map_or(0.0, |h| h.score)
                .max(only_keyword.first().map_or(0.0, |h| h.score));
            assert!(fused[0].score >= single);
            if weight > 0.0 && weight < 1.0 {
                assert!(fused[0].score > single);
            }
        }
    }

    #[test]
    fn test_one_empty_list_keeps_other_ranking() {
        let fused = reciprocal_rank_fusion(&[], &ids(&["x", "y", "z"]), 60.0, 0.7, 2);
        let order: Vec<&str> = fused.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["x", "y"]);
    }

    #[test]
    fn test_ties_break_by_chunk_id() {
        let fused = reciprocal_rank_fusion(&ids(&["b"]), &ids(&["a"]), 60.0, 0.5, 10);
        assert_eq!(fused[0].chunk_id.as_str(), "a");
        assert_eq!(fused[1].chunk_id.as_str(), "b");
    }

    #[test]
    fn test_fusion_config_validation() {
        assert!(FusionConfig::default().validate().is_ok());
        let bad = FusionConfig {
            weight_semantic: 1.5,
            ..FusionConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = FusionConfig {
            rrf_k: 0.0,
            ..FusionConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    fn chunk(content_id: &str, text: &str) -> Chunk {
        Chunk {
            id: ChunkId::new(content_id, 0),
            content_id: content_id.to_string(),
            ordinal: 0,
            text: text.to_string(),
            start_offset: 0,
            end_offset: text.len(),
            overlap_len: 0,
            start_line: 1,
            end_line: 1,
            modality: Modality::Prose,
            token_estimate: 4,
            language: None,
        }
    }

    async fn searcher(docs: &[(&str, &str)]) -> HybridSearcher {
        let descriptor = ModelDescriptor::new("hash-64", 64, 256, 1);
        let mut registry = ProviderRegistry::new();
        registry
            .register_provider(descriptor.clone(), Arc::new(HashEmbedder::new("hash-64", 64)))
            .unwrap();
        let registry = Arc::new(registry);
        let generator = Arc::new(EmbeddingGenerator::new(
            Arc::clone(&registry),
            EmbeddingCache::shared(100),
            GeneratorConfig {
                max_concurrency: 4,
                requests_per_second: 0.0,
                retry: RetryPolicy::none(),
            },
        ));
        let storage = Arc::new(VectorStorage::open_in_memory().unwrap());
        let vectors = Arc::new(VectorStore::open(storage, registry.models(), BTreeMap::new()).unwrap());
        let keywords = Arc::new(KeywordIndex::in_memory().unwrap());

        let chunks: Vec<Chunk> = docs.iter().map(|(id, text)| chunk(id, text)).collect();
        keywords.index_many(&chunks).unwrap();
        let outcome = generator.embed_batch(&chunks, Modality::Prose).await;
        let records: Vec<EmbeddingRecord> = chunks
            .iter()
            .zip(outcome.items)
            .map(|(chunk, (_, result))| {
                let embedded = result.unwrap();
                EmbeddingRecord {
                    chunk_id: chunk.id.clone(),
                    modality: Modality::Prose,
                    model_id: embedded.model_id,
                    vector: embedded.vector.to_vec(),
                    metadata: chunk.metadata(),
                    created_at: 0,
                }
            })
            .collect();
        vectors.upsert_many(records).unwrap();

        HybridSearcher::new(vectors, keywords, generator, FusionConfig::default())
    }

    #[tokio::test]
    async fn test_modes_return_matching_chunks() {
        let searcher = searcher(&[
            ("rust.md", "ownership borrowing lifetimes"),
            ("garden.md", "tomatoes need sunlight"),
        ])
        .await;

        for mode in [SearchMode::Keyword, SearchMode::Semantic, SearchMode::Hybrid] {
            let request = SearchRequest::new("borrowing lifetimes", Modality::Prose, 1).with_mode(mode);
            let hits = searcher.search(&request).await.unwrap();
            assert_eq!(hits.len(), 1, "mode {}", mode);
            assert_eq!(hits[0].content_id, "rust.md", "mode {}", mode);
            assert!(!hits[0].snippet.is_empty());
        }
        assert_eq!(searcher.stats().queries, 3);
    }

    #[tokio::test]
    async fn test_other_modality_is_empty() {
        let searcher = searcher(&[("a.md", "lighthouse keeper")]).await;
        let hits = searcher
            .search(&SearchRequest::new("lighthouse", Modality::Code, 5))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_weight_rejected() {
        let searcher = searcher(&[("a.md", "lighthouse keeper")]).await;
        let request = SearchRequest::new("lighthouse", Modality::Prose, 5).with_weight(-0.1);
        assert!(matches!(
            searcher.search(&request).await,
            Err(RagError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_k_is_empty() {
        let searcher = searcher(&[("a.md", "lighthouse keeper")]).await;
        let hits = searcher
            .search(&SearchRequest::new("lighthouse", Modality::Prose, 0))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
