// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vector store: one HNSW graph per (modality, model), backed by SQLite.
//!
//! Models registered for the same modality may have different dimensions, so
//! each model gets its own graph. A chunk has exactly one live record; writing
//! it again under any model tombstones the previous node.
//!
//! Writers of a modality take its `writes` mutex for the whole operation and
//! hold the graph lock exclusively only while applying in-memory changes.
//! SQLite I/O and graph rebuilds happen while queries keep reading.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::hnsw::{Hnsw, HnswError};
use super::storage::VectorStorage;
use crate::errors::{RagError, Result};
use crate::types::{ChunkId, ChunkMetadata, EmbeddingRecord, IndexDescriptor, Modality, ModelDescriptor};

/// A nearest-neighbor result.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub model_id: String,
    pub metadata: Arc<ChunkMetadata>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub model_id: String,
    pub dimension: usize,
    pub nodes: usize,
    pub tombstones: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorStats {
    pub modality: Modality,
    pub chunk_count: usize,
    pub params: IndexDescriptor,
    pub graphs: Vec<GraphStats>,
}

struct ModelGraph {
    graph: Hnsw,
    ids: Vec<ChunkId>,
}

struct Entry {
    model_id: String,
    node: u32,
    metadata: Arc<ChunkMetadata>,
}

#[derive(Default)]
struct ModalityState {
    graphs: HashMap<String, ModelGraph>,
    chunks: HashMap<ChunkId, Entry>,
    by_content: HashMap<String, BTreeSet<ChunkId>>,
}

impl ModalityState {
    fn insert(&mut self, record: EmbeddingRecord, params: &IndexDescriptor) -> Result<()> {
        self.tombstone(&record.chunk_id);

        let dimension = record.vector.len();
        let graph = self
            .graphs
            .entry(record.model_id.clone())
            .or_insert_with(|| ModelGraph {
                graph: Hnsw::new(params, dimension),
                ids: Vec::new(),
            });
        let node = graph.graph.insert(record.vector).map_err(|e| match e {
            HnswError::DimensionMismatch { expected, actual } => RagError::DimensionMismatch {
                model_id: record.model_id.clone(),
                expected,
                actual,
            },
            HnswError::EmptyVector => RagError::DimensionMismatch {
                model_id: record.model_id.clone(),
                expected: graph.graph.dimension(),
                actual: 0,
            },
        })?;
        graph.ids.push(record.chunk_id.clone());

        self.by_content
            .entry(record.metadata.content_id.clone())
            .or_default()
            .insert(record.chunk_id.clone());
        self.chunks.insert(
            record.chunk_id,
            Entry {
                model_id: record.model_id,
                node,
                metadata: Arc::new(record.metadata),
            },
        );
        Ok(())
    }

    fn tombstone(&mut self, chunk_id: &ChunkId) -> bool {
        let Some(entry) = self.chunks.remove(chunk_id) else {
            return false;
        };
        if let Some(graph) = self.graphs.get_mut(&entry.model_id) {
            graph.graph.delete(entry.node);
        }
        if let Some(ids) = self.by_content.get_mut(&entry.metadata.content_id) {
            ids.remove(chunk_id);
            if ids.is_empty() {
                self.by_content.remove(&entry.metadata.content_id);
            }
        }
        true
    }

    fn remove_content(&mut self, content_id: &str) -> usize {
        let Some(ids) = self.by_content.remove(content_id) else {
            return 0;
        };
        let mut removed = 0;
        for id in &ids {
            if let Some(entry) = self.chunks.remove(id) {
                if let Some(graph) = self.graphs.get_mut(&entry.model_id) {
                    graph.graph.delete(entry.node);
                }
                removed += 1;
            }
        }
        removed
    }

    fn needs_compaction(&self) -> bool {
        self.graphs.values().any(|g| g.graph.should_compact())
    }

    /// Fresh graphs holding only the live nodes. Leaves `self` untouched so
    /// the rebuild can run under a shared lock.
    fn compacted(&self, params: &IndexDescriptor) -> Compacted {
        let mut out = Compacted::default();
        for (model_id, old) in &self.graphs {
            out.dropped += old.graph.tombstones();
            if old.graph.live_len() == 0 {
                continue;
            }
            let mut graph = ModelGraph {
                graph: Hnsw::new(params, old.graph.dimension()),
                ids: Vec::with_capacity(old.graph.live_len()),
            };
            for (node, vector) in old.graph.live() {
                let chunk_id = old.ids[node as usize].clone();
                // dimension is unchanged, so insert cannot fail
                if let Ok(new_node) = graph.graph.insert(vector.to_vec()) {
                    out.nodes.push((chunk_id.clone(), new_node));
                    graph.ids.push(chunk_id);
                }
            }
            out.graphs.insert(model_id.clone(), graph);
        }
        out
    }

    fn swap_in(&mut self, compacted: Compacted) {
        self.graphs = compacted.graphs;
        for (chunk_id, node) in compacted.nodes {
            if let Some(entry) = self.chunks.get_mut(&chunk_id) {
                entry.node = node;
            }
        }
    }
}

#[derive(Default)]
struct Compacted {
    graphs: HashMap<String, ModelGraph>,
    nodes: Vec<(ChunkId, u32)>,
    dropped: usize,
}

#[derive(Default)]
struct Shard {
    state: RwLock<ModalityState>,
    writes: Mutex<()>,
}

pub struct VectorStore {
    storage: Arc<VectorStorage>,
    dimensions: HashMap<String, usize>,
    params: BTreeMap<Modality, IndexDescriptor>,
    shards: HashMap<Modality, Shard>,
}

impl VectorStore {
    /// Builds the store and loads persisted records into fresh graphs.
    ///
    /// Records from models that are no longer registered, or whose dimension
    /// changed, are skipped.
    pub fn open<'a>(
        storage: Arc<VectorStorage>,
        models: impl IntoIterator<Item = &'a ModelDescriptor>,
        params: BTreeMap<Modality, IndexDescriptor>,
    ) -> Result<Self> {
        let dimensions = models
            .into_iter()
            .map(|m| (m.model_id.clone(), m.dimension))
            .collect();
        let store = Self {
            storage,
            dimensions,
            params,
            shards: Modality::ALL.iter().map(|m| (*m, Shard::default())).collect(),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<()> {
        for modality in Modality::ALL {
            let params = self.params(modality);
            let records = self.storage.load_modality(modality)?;
            let total = records.len();
            let mut state = self.state(modality).write();
            let mut skipped = 0;
            for record in records {
                if self.check(&record).is_err() {
                    skipped += 1;
                    continue;
                }
                state.insert(record, &params)?;
            }
            if skipped > 0 {
                warn!(
                    "{}: skipped {} of {} stored vectors from unregistered or resized models",
                    modality, skipped, total
                );
            }
            debug!("{}: loaded {} vectors", modality, total - skipped);
        }
        Ok(())
    }

    fn shard(&self, modality: Modality) -> &Shard {
        // every modality is populated in open()
        &self.shards[&modality]
    }

    fn state(&self, modality: Modality) -> &RwLock<ModalityState> {
        &self.shard(modality).state
    }

    pub fn params(&self, modality: Modality) -> IndexDescriptor {
        self.params.get(&modality).copied().unwrap_or_default()
    }

    pub fn storage(&self) -> &Arc<VectorStorage> {
        &self.storage
    }

    fn check(&self, record: &EmbeddingRecord) -> Result<()> {
        let expected = *self
            .dimensions
            .get(&record.model_id)
            .ok_or_else(|| RagError::UnknownModel(record.model_id.clone()))?;
        if record.vector.len() != expected {
            return Err(RagError::DimensionMismatch {
                model_id: record.model_id.clone(),
                expected,
                actual: record.vector.len(),
            });
        }
        Ok(())
    }

    pub fn upsert(&self, record: EmbeddingRecord) -> Result<()> {
        self.upsert_many(vec![record]).map(|_| ())
    }

    /// Validates every record, then persists and indexes them. Nothing is
    /// written if any record fails validation.
    pub fn upsert_many(&self, records: Vec<EmbeddingRecord>) -> Result<usize> {
        for record in &records {
            self.check(record)?;
        }
        let count = records.len();

        for (modality, group) in group_by_modality(records) {
            let shard = self.shard(modality);
            let params = self.params(modality);
            let _writing = shard.writes.lock();
            self.storage.upsert_records(&group)?;
            {
                let mut state = shard.state.write();
                for record in group {
                    state.insert(record, &params)?;
                }
            }
            if shard.state.read().needs_compaction() {
                self.rebuild(modality, shard, &params);
            }
        }
        Ok(count)
    }

    /// Swaps every record owned by `content_id` for `records` in one step:
    /// readers see either the old set or the new one. Validation runs first
    /// and nothing changes if it fails.
    pub fn replace_content(&self, content_id: &str, records: Vec<EmbeddingRecord>) -> Result<usize> {
        for record in &records {
            self.check(record)?;
        }
        let count = records.len();

        let _writing: Vec<_> = Modality::ALL
            .iter()
            .map(|m| self.shard(*m).writes.lock())
            .collect();
        self.storage.replace_content(content_id, &records)?;

        let mut grouped = group_by_modality(records);
        for modality in Modality::ALL {
            let shard = self.shard(modality);
            let params = self.params(modality);
            {
                let mut state = shard.state.write();
                state.remove_content(content_id);
                for record in grouped.remove(&modality).unwrap_or_default() {
                    state.insert(record, &params)?;
                }
            }
            if shard.state.read().needs_compaction() {
                self.rebuild(modality, shard, &params);
            }
        }
        Ok(count)
    }

    /// Builds tombstone-free graphs under a shared lock and swaps them in.
    /// Callers hold the shard's `writes` mutex, so nothing changes between
    /// the rebuild and the swap.
    fn rebuild(&self, modality: Modality, shard: &Shard, params: &IndexDescriptor) -> usize {
        let compacted = shard.state.read().compacted(params);
        let dropped = compacted.dropped;
        shard.state.write().swap_in(compacted);
        if dropped > 0 {
            info!("{}: compacted vector graphs, dropped {} tombstones", modality, dropped);
        }
        dropped
    }

    /// Nearest neighbors of `vector` in the graph for `model_id`, best first.
    /// Ties are broken by chunk id.
    pub fn query(
        &self,
        modality: Modality,
        model_id: &str,
        vector: &[f32],
        k: usize,
        ef_search: Option<usize>,
    ) -> Result<Vec<VectorHit>> {
        let expected = *self
            .dimensions
            .get(model_id)
            .ok_or_else(|| RagError::UnknownModel(model_id.to_string()))?;
        if vector.len() != expected {
            return Err(RagError::DimensionMismatch {
                model_id: model_id.to_string(),
                expected,
                actual: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let state = self.state(modality).read();
        let Some(graph) = state.graphs.get(model_id) else {
            return Ok(Vec::new());
        };
        let ef = ef_search.unwrap_or(self.params(modality).ef_search).max(k);

        let mut hits: Vec<VectorHit> = graph
            .graph
            .search(vector, k, ef)
            .into_iter()
            .filter_map(|(node, score)| {
                let chunk_id = graph.ids.get(node as usize)?;
                let entry = state.chunks.get(chunk_id)?;
                Some(VectorHit {
                    chunk_id: chunk_id.clone(),
                    score,
                    model_id: model_id.to_string(),
                    metadata: Arc::clone(&entry.metadata),
                })
            })
            .collect();
        sort_hits(&mut hits);
        Ok(hits)
    }

    /// Models with at least one live vector in `modality`, sorted.
    pub fn models_in(&self, modality: Modality) -> Vec<String> {
        let state = self.state(modality).read();
        let mut models: Vec<String> = state
            .graphs
            .iter()
            .filter(|(_, g)| g.graph.live_len() > 0)
            .map(|(id, _)| id.clone())
            .collect();
        models.sort();
        models
    }

    /// Deletes every record owned by `content_id` across modalities.
    pub fn remove_content(&self, content_id: &str) -> Result<usize> {
        let _writing: Vec<_> = Modality::ALL
            .iter()
            .map(|m| self.shard(*m).writes.lock())
            .collect();
        self.storage.delete_content(content_id)?;
        Ok(Modality::ALL
            .iter()
            .map(|m| self.state(*m).write().remove_content(content_id))
            .sum())
    }

    /// Rebuilds the graphs of `modality` without tombstones.
    pub fn compact(&self, modality: Modality) -> usize {
        let shard = self.shard(modality);
        let _writing = shard.writes.lock();
        self.rebuild(modality, shard, &self.params(modality))
    }

    pub fn chunk_count(&self, modality: Modality) -> usize {
        self.state(modality).read().chunks.len()
    }

    pub fn contains(&self, modality: Modality, chunk_id: &ChunkId) -> bool {
        self.state(modality).read().chunks.contains_key(chunk_id)
    }

    pub fn stats(&self, modality: Modality) -> VectorStats {
        let state = self.state(modality).read();
        let mut graphs: Vec<GraphStats> = state
            .graphs
            .iter()
            .map(|(model_id, g)| GraphStats {
                model_id: model_id.clone(),
                dimension: g.graph.dimension(),
                nodes: g.graph.len(),
                tombstones: g.graph.tombstones(),
            })
            .collect();
        graphs.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        VectorStats {
            modality,
            chunk_count: state.chunks.len(),
            params: self.params(modality),
            graphs,
        }
    }
}

fn group_by_modality(records: Vec<EmbeddingRecord>) -> BTreeMap<Modality, Vec<EmbeddingRecord>> {
    let mut grouped: BTreeMap<Modality, Vec<EmbeddingRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(record.modality).or_default().push(record);
    }
    grouped
}

/// Score descending, chunk id ascending.
pub fn sort_hits(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn models() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::new("small", 3, 64, 1),
            ModelDescriptor::new("wide", 5, 64, 2),
        ]
    }

    fn store() -> VectorStore {
        let storage = Arc::new(VectorStorage::open_in_memory().unwrap());
        VectorStore::open(storage, &models(), BTreeMap::new()).unwrap()
    }

    fn record(content_id: &str, ordinal: usize, model_id: &str, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            chunk_id: ChunkId::new(content_id, ordinal),
            modality: Modality::Prose,
            model_id: model_id.to_string(),
            vector,
            metadata: ChunkMetadata {
                content_id: content_id.to_string(),
                start_offset: 0,
                end_offset: 1,
                start_line: 1,
                end_line: 1,
                token_estimate: 1,
                snippet: format!("{} {}", content_id, ordinal),
            },
            created_at: 0,
        }
    }

    #[test]
    fn test_empty_store_returns_empty() {
        let store = store();
        let hits = store
            .query(Modality::Prose, "small", &[1.0, 0.0, 0.0], 5, None)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_dimension_mismatch_rejected_and_nothing_written() {
        let store = store();
        let err = store
            .upsert_many(vec![
                record("a", 0, "small", vec![1.0, 0.0, 0.0]),
                record("a", 1, "small", vec![1.0, 0.0]),
            ])
            .unwrap_err();
        match err {
            RagError::DimensionMismatch {
                model_id,
                expected,
                actual,
            } => {
                assert_eq!(model_id, "small");
                assert_eq!(expected, 3);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.chunk_count(Modality::Prose), 0);
        assert_eq!(store.storage().count(Modality::Prose).unwrap(), 0);

        let err = store
            .query(Modality::Prose, "small", &[1.0; 4], 1, None)
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let store = store();
        let err = store.upsert(record("a", 0, "nope", vec![1.0])).unwrap_err();
        assert!(matches!(err, RagError::UnknownModel(_)));
    }

    #[test]
    fn test_query_orders_by_score_then_chunk_id() {
        let store = store();
        store
            .upsert_many(vec![
                record("b", 0, "small", vec![1.0, 0.0, 0.0]),
                record("a", 0, "small", vec![1.0, 0.0, 0.0]),
                record("c", 0, "small", vec![0.0, 1.0, 0.0]),
            ])
            .unwrap();
        let hits = store
            .query(Modality::Prose, "small", &[1.0, 0.0, 0.0], 3, None)
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a#00000", "b#00000", "c#00000"]);
        assert_eq!(hits[0].metadata.snippet, "a 0");
    }

    #[test]
    fn test_models_have_separate_graphs() {
        let store = store();
        store
            .upsert_many(vec![
                record("a", 0, "small", vec![1.0, 0.0, 0.0]),
                record("b", 0, "wide", vec![0.0, 0.0, 0.0, 0.0, 1.0]),
            ])
            .unwrap();
        assert_eq!(store.models_in(Modality::Prose), vec!["small", "wide"]);
        let hits = store
            .query(Modality::Prose, "wide", &[0.0, 0.0, 0.0, 0.0, 1.0], 5, None)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].model_id, "wide");
    }

    #[test]
    fn test_upsert_replaces_previous_vector() {
        let store = store();
        store.upsert(record("a", 0, "small", vec![1.0, 0.0, 0.0])).unwrap();
        store.upsert(record("a", 0, "small", vec![0.0, 1.0, 0.0])).unwrap();
        assert_eq!(store.chunk_count(Modality::Prose), 1);

        let hits = store
            .query(Modality::Prose, "small", &[0.0, 1.0, 0.0], 5, None)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_remove_content() {
        let store = store();
        store
            .upsert_many(vec![
                record("a", 0, "small", vec![1.0, 0.0, 0.0]),
                record("a", 1, "small", vec![0.9, 0.1, 0.0]),
                record("b", 0, "small", vec![0.8, 0.2, 0.0]),
            ])
            .unwrap();
        assert_eq!(store.remove_content("a").unwrap(), 2);
        assert_eq!(store.remove_content("a").unwrap(), 0);

        let hits = store
            .query(Modality::Prose, "small", &[1.0, 0.0, 0.0], 5, None)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id.content_id(), "b");
    }

    #[test]
    fn test_compaction_keeps_live_vectors() {
        let store = store();
        let records: Vec<_> = (0..10)
            .map(|i| record(&format!("doc{}", i), 0, "small", vec![1.0, i as f32, 0.0]))
            .collect();
        store.upsert_many(records).unwrap();
        for i in 0..5 {
            store.remove_content(&format!("doc{}", i)).unwrap();
        }
        assert_eq!(store.compact(Modality::Prose), 5);
        assert_eq!(store.stats(Modality::Prose).graphs[0].tombstones, 0);

        let hits = store
            .query(Modality::Prose, "small", &[1.0, 9.0, 0.0], 10, None)
            .unwrap();
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].chunk_id.content_id(), "doc9");
    }

    #[test]
    fn test_queries_run_while_a_write_is_persisting() {
        let store = store();
        store.upsert(record("a", 0, "small", vec![1.0, 0.0, 0.0])).unwrap();

        // a writer between its SQLite commit and the graph update holds only
        // the writes mutex
        let _writing = store.shard(Modality::Prose).writes.lock();
        let hits = store
            .query(Modality::Prose, "small", &[1.0, 0.0, 0.0], 1, None)
            .unwrap();
        assert_eq!(hits[0].chunk_id.as_str(), "a#00000");
        assert_eq!(store.chunk_count(Modality::Prose), 1);
    }

    #[test]
    fn test_concurrent_upserts_and_queries() {
        let store = store();
        store.upsert(record("seed", 0, "small", vec![1.0, 0.0, 0.0])).unwrap();

        std::thread::scope(|scope| {
            for writer in 0..2 {
                let store = &store;
                scope.spawn(move || {
                    for i in 0..40 {
                        let content = format!("w{}-{}", writer, i % 10);
                        store
                            .upsert(record(&content, 0, "small", vec![1.0, i as f32, writer as f32]))
                            .unwrap();
                        if i % 7 == 0 {
                            store.remove_content(&content).unwrap();
                        }
                    }
                });
            }
            for _ in 0..2 {
                let store = &store;
                scope.spawn(move || {
                    for _ in 0..100 {
                        let hits = store
                            .query(Modality::Prose, "small", &[1.0, 0.0, 0.0], 5, None)
                            .unwrap();
                        assert!(!hits.is_empty());
                        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
                    }
                });
            }
        });

        let live = store.chunk_count(Modality::Prose);
        assert_eq!(store.storage().count(Modality::Prose).unwrap(), live);
        let graph = &store.stats(Modality::Prose).graphs[0];
        assert_eq!(graph.nodes - graph.tombstones, live);
    }

    #[test]
    fn test_replace_content_is_all_or_nothing() {
        let store = store();
        store
            .upsert_many(vec![
                record("a", 0, "small", vec![1.0, 0.0, 0.0]),
                record("a", 1, "small", vec![0.9, 0.1, 0.0]),
                record("b", 0, "small", vec![0.8, 0.2, 0.0]),
            ])
            .unwrap();

        let err = store
            .replace_content("a", vec![record("a", 0, "small", vec![0.0, 1.0])])
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
        assert_eq!(store.chunk_count(Modality::Prose), 3);
        assert_eq!(store.storage().count(Modality::Prose).unwrap(), 3);

        assert_eq!(
            store
                .replace_content("a", vec![record("a", 0, "small", vec![0.0, 1.0, 0.0])])
                .unwrap(),
            1
        );
        assert_eq!(store.chunk_count(Modality::Prose), 2);
        assert!(!store.contains(Modality::Prose, &ChunkId::new("a", 1)));
        let hits = store
            .query(Modality::Prose, "small", &[0.0, 1.0, 0.0], 1, None)
            .unwrap();
        assert_eq!(hits[0].chunk_id.as_str(), "a#00000");
        assert_eq!(store.storage().count(Modality::Prose).unwrap(), 2);
    }

    #[test]
    fn test_automatic_compaction_swaps_in_clean_graph() {
        let store = store();
        let records: Vec<_> = (0..40)
            .map(|i| record(&format!("doc{}", i), 0, "small", vec![1.0, i as f32, 0.0]))
            .collect();
        store.upsert_many(records).unwrap();
        for i in 0..30 {
            store.remove_content(&format!("doc{}", i)).unwrap();
        }
        // the next write notices the tombstones and rebuilds
        store.upsert(record("doc39", 0, "small", vec![1.0, 39.0, 0.0])).unwrap();

        let graph = &store.stats(Modality::Prose).graphs[0];
        assert_eq!(graph.tombstones, 0);
        assert_eq!(graph.nodes, 10);
        let hits = store
            .query(Modality::Prose, "small", &[1.0, 39.0, 0.0], 1, None)
            .unwrap();
        assert_eq!(hits[0].chunk_id.as_str(), "doc39#00000");
    }

    #[test]
    fn test_reopen_rebuilds_graphs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.sqlite");
        {
            let storage = Arc::new(VectorStorage::open(&path).unwrap());
            let store = VectorStore::open(storage, &models(), BTreeMap::new()).unwrap();
            store.upsert(record("a", 0, "small", vec![0.0, 0.0, 1.0])).unwrap();
        }

        let storage = Arc::new(VectorStorage::open(&path).unwrap());
        let store = VectorStore::open(storage, &models(), BTreeMap::new()).unwrap();
        let hits = store
            .query(Modality::Prose, "small", &[0.0, 0.0, 1.0], 1, None)
            .unwrap();
        assert_eq!(hits[0].chunk_id.as_str(), "a#00000");

        // a resized model drops its stale vectors
        let resized = vec![ModelDescriptor::new("small", 4, 64, 1)];
        let storage = Arc::new(VectorStorage::open(&path).unwrap());
        let store = VectorStore::open(storage, &resized, BTreeMap::new()).unwrap();
        assert_eq!(store.chunk_count(Modality::Prose), 0);
    }
}
