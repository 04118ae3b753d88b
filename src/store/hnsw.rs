// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hierarchical navigable small-world graph.
//!
//! Nodes are numbered densely from zero in insertion order. Deletion only
//! sets a tombstone: deleted nodes keep routing searches but never appear in
//! results. [`Hnsw::should_compact`] tells the owner when rebuilding from
//! live vectors is worthwhile.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use thiserror::Error;

use crate::types::{dot, DistanceMetric, IndexDescriptor};

const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HnswError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("empty vector")]
    EmptyVector,
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    score: f32,
    id: u32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    // higher score wins; on equal scores the lower id wins
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Debug, Clone)]
struct Node {
    vector: Vec<f32>,
    norm: f32,
    neighbors: Vec<Vec<u32>>,
    deleted: bool,
}

#[derive(Debug, Clone)]
pub struct Hnsw {
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    level_mult: f64,
    metric: DistanceMetric,
    dimension: usize,
    nodes: Vec<Node>,
    entry: Option<u32>,
    max_level: usize,
    deleted: usize,
    rng_state: u64,
}

impl Hnsw {
    pub fn new(params: &IndexDescriptor, dimension: usize) -> Self {
        let m = params.m.max(2);
        Self {
            m,
            m_max0: m * 2,
            ef_construction: params.ef_construction.max(m),
            level_mult: 1.0 / (m as f64).ln(),
            metric: params.metric,
            dimension,
            nodes: Vec::new(),
            entry: None,
            max_level: 0,
            deleted: 0,
            rng_state: 0x2545_f491_4f6c_dd1d,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Nodes including tombstones.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn live_len(&self) -> usize {
        self.nodes.len() - self.deleted
    }

    pub fn tombstones(&self) -> usize {
        self.deleted
    }

    pub fn vector(&self, id: u32) -> Option<&[f32]> {
        self.nodes.get(id as usize).map(|n| n.vector.as_slice())
    }

    pub fn is_deleted(&self, id: u32) -> bool {
        self.nodes.get(id as usize).map_or(true, |n| n.deleted)
    }

    /// More than half of a non-trivial graph is tombstones.
    pub fn should_compact(&self) -> bool {
        self.nodes.len() >= 32 && self.deleted * 2 > self.nodes.len()
    }

    /// Insert a vector and return its node id.
    pub fn insert(&mut self, vector: Vec<f32>) -> Result<u32, HnswError> {
        if vector.is_empty() {
            return Err(HnswError::EmptyVector);
        }
        if vector.len() != self.dimension {
            return Err(HnswError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let id = self.nodes.len() as u32;
        let level = self.select_level();
        let norm = dot(&vector, &vector).sqrt();
        self.nodes.push(Node {
            vector,
            norm,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });

        let Some(mut ep) = self.entry else {
            self.entry = Some(id);
            self.max_level = level;
            return Ok(id);
        };

        let query = self.nodes[id as usize].vector.clone();
        for lc in (level + 1..=self.max_level).rev() {
            ep = self.greedy(ep, &query, norm, lc);
        }

        for lc in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(ep, &query, norm, self.ef_construction, lc);
            let limit = if lc == 0 { self.m_max0 } else { self.m };
            let selected: Vec<u32> = candidates
                .iter()
                .filter(|c| c.id != id)
                .take(self.m)
                .map(|c| c.id)
                .collect();

            for &neighbor in &selected {
                self.link(id, neighbor, lc);
                self.link(neighbor, id, lc);
                self.prune(neighbor, lc, limit);
            }
            if let Some(best) = candidates.first() {
                ep = best.id;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(id);
        }
        Ok(id)
    }

    /// Up to `k` live nodes closest to `query`, best first, exploring a beam
    /// of `ef` candidates on the bottom layer.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u32, f32)> {
        let Some(mut ep) = self.entry else {
            return Vec::new();
        };
        if k == 0 || query.len() != self.dimension || self.deleted == self.nodes.len() {
            return Vec::new();
        }

        let norm = dot(query, query).sqrt();
        for lc in (1..=self.max_level).rev() {
            ep = self.greedy(ep, query, norm, lc);
        }
        let beam = ef.max(k) + self.deleted.min(ef);
        self.search_layer(ep, query, norm, beam, 0)
            .into_iter()
            .filter(|c| !self.nodes[c.id as usize].deleted)
            .take(k)
            .map(|c| (c.id, c.score))
            .collect()
    }

    /// Tombstone a node. Returns false if it was unknown or already deleted.
    pub fn delete(&mut self, id: u32) -> bool {
        match self.nodes.get_mut(id as usize) {
            Some(node) if !node.deleted => {
                node.deleted = true;
                self.deleted += 1;
                true
            }
            _ => false,
        }
    }

    /// Live nodes in insertion order, for rebuilding.
    pub fn live(&self) -> impl Iterator<Item = (u32, &[f32])> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.deleted)
            .map(|(id, n)| (id as u32, n.vector.as_slice()))
    }

    fn select_level(&mut self) -> usize {
        // LCG (Knuth MMIX constants)
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let r = ((self.rng_state >> 11) as f64 / (1u64 << 53) as f64).max(1e-12);
        ((-r.ln() * self.level_mult).floor() as usize).min(MAX_LEVEL)
    }

    fn score(&self, id: u32, query: &[f32], query_norm: f32) -> f32 {
        let node = &self.nodes[id as usize];
        match self.metric {
            DistanceMetric::Cosine => {
                if node.norm == 0.0 || query_norm == 0.0 {
                    0.0
                } else {
                    dot(&node.vector, query) / (node.norm * query_norm)
                }
            }
            other => other.similarity(&node.vector, query),
        }
    }

    fn greedy(&self, entry: u32, query: &[f32], norm: f32, level: usize) -> u32 {
        let mut current = entry;
        let mut best = self.score(current, query, norm);
        loop {
            let mut changed = false;
            if let Some(neighbors) = self.nodes[current as usize].neighbors.get(level) {
                for &n in neighbors {
                    let s = self.score(n, query, norm);
                    if s > best {
                        best = s;
                        current = n;
                        changed = true;
                    }
                }
            }
            if !changed {
                return current;
            }
        }
    }

    /// Beam search on one layer; results sorted best first.
    fn search_layer(&self, entry: u32, query: &[f32], norm: f32, ef: usize, level: usize) -> Vec<Scored> {
        let mut visited = HashSet::new();
        let mut candidates = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        let first = Scored {
            score: self.score(entry, query, norm),
            id: entry,
        };
        visited.insert(entry);
        candidates.push(first);
        results.push(Reverse(first));

        while let Some(current) = candidates.pop() {
            let worst = results.peek().map_or(f32::NEG_INFINITY, |r| r.0.score);
            if current.score < worst && results.len() >= ef {
                break;
            }
            let Some(neighbors) = self.nodes[current.id as usize].neighbors.get(level) else {
                continue;
            };
            for &n in neighbors {
                if !visited.insert(n) {
                    continue;
                }
                let scored = Scored {
                    score: self.score(n, query, norm),
                    id: n,
                };
                let worst = results.peek().map_or(f32::NEG_INFINITY, |r| r.0.score);
                if results.len() < ef || scored.score > worst {
                    candidates.push(scored);
                    results.push(Reverse(scored));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    fn link(&mut self, from: u32, to: u32, level: usize) {
        let node = &mut self.nodes[from as usize];
        if let Some(list) = node.neighbors.get_mut(level) {
            if !list.contains(&to) {
                list.push(to);
            }
        }
    }

    fn prune(&mut self, id: u32, level: usize, limit: usize) {
        let neighbors = match self.nodes[id as usize].neighbors.get(level) {
            Some(list) if list.len() > limit => list.clone(),
            _ => return,
        };
        let base = self.nodes[id as usize].vector.clone();
        let norm = self.nodes[id as usize].norm;
        let mut scored: Vec<Scored> = neighbors
            .into_iter()
            .map(|n| Scored {
                score: self.score(n, &base, norm),
                id: n,
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(limit);
        self.nodes[id as usize].neighbors[level] = scored.into_iter().map(|s| s.id).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_vectors(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut state = seed;
        (0..count)
            .map(|_| {
                (0..dim)
                    .map(|_| {
                        state ^= state << 13;
                        state ^= state >> 7;
                        state ^= state << 17;
                        (state % 2000) as f32 / 1000.0 - 1.0
                    })
                    .collect()
            })
            .collect()
    }

    fn brute_force(vectors: &[Vec<f32>], query: &[f32], k: usize) -> Vec<u32> {
        let mut scored: Vec<Scored> = vectors
            .iter()
            .enumerate()
            .map(|(id, v)| Scored {
                score: crate::types::cosine_similarity(v, query),
                id: id as u32,
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.into_iter().take(k).map(|s| s.id).collect()
    }

    #[test]
    fn test_empty_graph_returns_nothing() {
        let graph = Hnsw::new(&IndexDescriptor::default(), 4);
        assert!(graph.search(&[1.0, 0.0, 0.0, 0.0], 5, 50).is_empty());
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let mut graph = Hnsw::new(&IndexDescriptor::default(), 3);
        assert_eq!(
            graph.insert(vec![1.0, 2.0]),
            Err(HnswError::DimensionMismatch { expected: 3, actual: 2 })
        );
        assert_eq!(graph.insert(Vec::new()), Err(HnswError::EmptyVector));
    }

    #[test]
    fn test_exact_match_ranks_first() {
        let vectors = random_vectors(200, 8, 7);
        let mut graph = Hnsw::new(&IndexDescriptor::default(), 8);
        for v in &vectors {
            graph.insert(v.clone()).unwrap();
        }
        let hits = graph.search(&vectors[42], 3, 100);
        assert_eq!(hits[0].0, 42);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
        assert!(hits.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_recall_against_brute_force() {
        let vectors = random_vectors(1000, 16, 99);
        let params = IndexDescriptor::default();
        let mut graph = Hnsw::new(&params, 16);
        for v in &vectors {
            graph.insert(v.clone()).unwrap();
        }

        let queries = random_vectors(20, 16, 12345);
        let mut found = 0;
        for query in &queries {
            let truth: HashSet<u32> = brute_force(&vectors, query, 10).into_iter().collect();
            found += graph
                .search(query, 10, params.ef_search)
                .iter()
                .filter(|(id, _)| truth.contains(id))
                .count();
        }
        let recall = found as f32 / (queries.len() * 10) as f32;
        assert!(recall >= 0.9, "recall {}", recall);
    }

    #[test]
    fn test_deleted_nodes_are_skipped() {
        let vectors = random_vectors(100, 8, 3);
        let mut graph = Hnsw::new(&IndexDescriptor::default(), 8);
        for v in &vectors {
            graph.insert(v.clone()).unwrap();
        }
        assert!(graph.delete(10));
        assert!(!graph.delete(10));
        assert!(!graph.delete(1000));
        let hits = graph.search(&vectors[10], 5, 100);
        assert!(hits.iter().all(|(id, _)| *id != 10));
        assert_eq!(graph.tombstones(), 1);
        assert_eq!(graph.live_len(), 99);
        assert_eq!(graph.live().count(), 99);
    }

    #[test]
    fn test_compaction_threshold() {
        let vectors = random_vectors(40, 4, 5);
        let mut graph = Hnsw::new(&IndexDescriptor::default(), 4);
        for v in &vectors {
            graph.insert(v.clone()).unwrap();
        }
        for id in 0..20 {
            graph.delete(id);
        }
        assert!(!graph.should_compact());
        graph.delete(20);
        assert!(graph.should_compact());
    }

    #[test]
    fn test_all_deleted() {
        let mut graph = Hnsw::new(&IndexDescriptor::default(), 2);
        let id = graph.insert(vec![1.0, 0.0]).unwrap();
        graph.delete(id);
        assert!(graph.search(&[1.0, 0.0], 1, 10).is_empty());
    }

    #[test]
    fn test_euclidean_metric() {
        let params = IndexDescriptor {
            metric: DistanceMetric::Euclidean,
            ..IndexDescriptor::default()
        };
        let mut graph = Hnsw::new(&params, 2);
        graph.insert(vec![0.0, 0.0]).unwrap();
        graph.insert(vec![10.0, 10.0]).unwrap();
        graph.insert(vec![1.0, 1.0]).unwrap();
        let hits = graph.search(&[0.9, 0.9], 2, 10);
        assert_eq!(hits[0].0, 2);
        assert_eq!(hits[1].0, 0);
    }
}
