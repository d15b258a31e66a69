//! HNSW (Hierarchical Navigable Small World) index.
//!
//! A multi-layer proximity graph:
//! - layer 0 contains every node with up to 2*M connections each
//! - higher layers contain a geometrically thinning subset with up to M
//! - search greedily descends from the top layer, then beam-searches layer 0
//!
//! ## Determinism
//!
//! Level assignment draws from a SplitMix64 sequence seeded with a fixed
//! seed plus a monotonic counter, so identical insert sequences produce
//! identical graphs; rebuilds reset the counter and are reproducible.
//!
//! ## Deletion
//!
//! Removal is structural, not mark-and-skip: the node leaves the graph, its
//! back-references are dropped, and the orphaned neighbors are pairwise
//! reconnected where capacity allows. The entry point is re-elected from
//! the highest surviving level.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::io::{Read, Write};

use gibram_core::{Error, Result};
use tracing::debug;

use crate::backend::VectorIndex;
use crate::persist::{self, PersistedNode};
use crate::similarity::cosine_similarity;

/// HNSW configuration parameters.
#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Max connections per node per layer above 0 (layer 0 allows 2*M).
    pub m: usize,
    /// Build-time beam width.
    pub ef_construction: usize,
    /// Search-time beam width.
    pub ef_search: usize,
    /// Hard cap on node levels.
    pub max_level: usize,
    /// Level multiplier: 1/ln(m).
    pub ml: f64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        let m = 16;
        Self {
            m,
            ef_construction: 200,
            ef_search: 50,
            max_level: 16,
            ml: 1.0 / (m as f64).ln(),
        }
    }
}

impl HnswConfig {
    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }
}

/// A node in the HNSW graph.
#[derive(Debug, Clone)]
struct HnswNode {
    vector: Vec<f32>,
    /// Max layer this node appears in.
    level: usize,
    /// Neighbor IDs per layer; `level + 1` buckets.
    neighbors: Vec<Vec<u64>>,
}

impl HnswNode {
    fn new(vector: Vec<f32>, level: usize) -> Self {
        Self {
            vector,
            level,
            neighbors: vec![Vec::new(); level + 1],
        }
    }
}

/// Scored candidate (max-heap by score, ties broken toward lower ID).
#[derive(Debug, Clone, PartialEq)]
struct Scored {
    score: f32,
    id: u64,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Hierarchical navigable small world vector index.
pub struct HnswIndex {
    config: HnswConfig,
    dimension: usize,
    /// BTreeMap for deterministic iteration.
    nodes: BTreeMap<u64, HnswNode>,
    entry: Option<u64>,
    rng_seed: u64,
    rng_counter: u64,
}

impl HnswIndex {
    pub fn new(dimension: usize, config: HnswConfig) -> Self {
        Self {
            config,
            dimension,
            nodes: BTreeMap::new(),
            entry: None,
            rng_seed: 42,
            rng_counter: 0,
        }
    }

    /// Level of the current entry point (the top of the graph).
    fn top_level(&self) -> usize {
        self.entry
            .and_then(|id| self.nodes.get(&id))
            .map(|n| n.level)
            .unwrap_or(0)
    }

    /// Draw a level: count consecutive uniform draws below ml, capped.
    fn assign_level(&mut self) -> usize {
        let mut level = 0;
        while level < self.config.max_level {
            self.rng_counter += 1;
            let hash = splitmix64(self.rng_seed.wrapping_add(self.rng_counter));
            let uniform = (hash as f64) / (u64::MAX as f64);
            if uniform < self.config.ml {
                level += 1;
            } else {
                break;
            }
        }
        level
    }

    fn similarity_to(&self, query: &[f32], id: u64) -> f32 {
        self.nodes
            .get(&id)
            .map(|n| cosine_similarity(query, &n.vector))
            .unwrap_or(0.0)
    }

    /// Beam search at a single layer.
    ///
    /// Returns up to `ef` closest nodes sorted by (score desc, id asc).
    /// Candidates use a max-heap (nearest expanded first); results use a
    /// min-heap so the worst sits on top for O(1) eviction.
    fn search_layer(&self, query: &[f32], entry_id: u64, ef: usize, layer: usize) -> Vec<Scored> {
        let entry_score = self.similarity_to(query, entry_id);

        let mut visited = BTreeSet::new();
        visited.insert(entry_id);

        let mut candidates = BinaryHeap::new();
        candidates.push(Scored {
            score: entry_score,
            id: entry_id,
        });

        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        results.push(Reverse(Scored {
            score: entry_score,
            id: entry_id,
        }));

        while let Some(nearest) = candidates.pop() {
            let worst = results
                .peek()
                .map(|r| r.0.score)
                .unwrap_or(f32::NEG_INFINITY);
            if nearest.score < worst && results.len() >= ef {
                break;
            }

            let Some(node) = self.nodes.get(&nearest.id) else {
                continue;
            };
            if layer >= node.neighbors.len() {
                continue;
            }
            for &neighbor_id in &node.neighbors[layer] {
                if !visited.insert(neighbor_id) {
                    continue;
                }
                let Some(neighbor) = self.nodes.get(&neighbor_id) else {
                    continue;
                };
                let score = cosine_similarity(query, &neighbor.vector);

                let worst = results
                    .peek()
                    .map(|r| r.0.score)
                    .unwrap_or(f32::NEG_INFINITY);
                if results.len() < ef || score > worst {
                    candidates.push(Scored {
                        score,
                        id: neighbor_id,
                    });
                    results.push(Reverse(Scored {
                        score,
                        id: neighbor_id,
                    }));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Greedy descent: at each layer move to the best neighbor until no
    /// neighbor improves, then drop a layer.
    fn greedy_to_layer(&self, query: &[f32], entry_id: u64, from: usize, to: usize) -> u64 {
        let mut current = entry_id;
        for layer in (to..=from).rev() {
            loop {
                let current_score = self.similarity_to(query, current);
                let mut best_score = current_score;
                let mut best_id = current;

                if let Some(node) = self.nodes.get(&current) {
                    if layer < node.neighbors.len() {
                        for &neighbor_id in &node.neighbors[layer] {
                            if let Some(neighbor) = self.nodes.get(&neighbor_id) {
                                let score = cosine_similarity(query, &neighbor.vector);
                                if score > best_score
                                    || (score == best_score && neighbor_id < best_id)
                                {
                                    best_score = score;
                                    best_id = neighbor_id;
                                }
                            }
                        }
                    }
                }

                if best_id == current {
                    break;
                }
                current = best_id;
            }
        }
        current
    }

    /// Keep only the `keep` most similar neighbors of `id` at `layer`.
    fn prune_neighbors(&mut self, id: u64, layer: usize, keep: usize) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let vector = node.vector.clone();
        let mut scored: Vec<Scored> = node.neighbors[layer]
            .iter()
            .filter_map(|&nid| {
                self.nodes.get(&nid).map(|n| Scored {
                    score: cosine_similarity(&vector, &n.vector),
                    id: nid,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        let kept: Vec<u64> = scored.into_iter().take(keep).map(|s| s.id).collect();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.neighbors[layer] = kept;
        }
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.entry = None;
    }
}

impl VectorIndex for HnswIndex {
    fn add(&mut self, id: u64, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::dimension_mismatch(self.dimension, vector.len()));
        }
        if self.nodes.contains_key(&id) {
            return Err(Error::Conflict(format!("vector {id} already indexed")));
        }

        let level = self.assign_level();
        let query = vector.clone();
        self.nodes.insert(id, HnswNode::new(vector, level));

        let Some(entry_id) = self.entry else {
            // First node becomes the entry point at its own level.
            self.entry = Some(id);
            return Ok(());
        };
        let top = self.top_level();

        // Greedy descent to the insertion band.
        let mut current = entry_id;
        if top > level {
            current = self.greedy_to_layer(&query, entry_id, top, level + 1);
        }

        // Connect at each layer from min(level, top) down to 0.
        for layer in (0..=level.min(top)).rev() {
            let candidates = self.search_layer(&query, current, self.config.ef_construction, layer);
            let selected: Vec<u64> = candidates
                .iter()
                .filter(|s| s.id != id)
                .take(self.config.m)
                .map(|s| s.id)
                .collect();

            if let Some(node) = self.nodes.get_mut(&id) {
                node.neighbors[layer] = selected.clone();
            }

            for &neighbor_id in &selected {
                let overflow = {
                    let Some(neighbor) = self.nodes.get_mut(&neighbor_id) else {
                        continue;
                    };
                    if !neighbor.neighbors[layer].contains(&id) {
                        neighbor.neighbors[layer].push(id);
                    }
                    neighbor.neighbors[layer].len() > 2 * self.config.m
                };
                if overflow {
                    self.prune_neighbors(neighbor_id, layer, self.config.m);
                }
            }

            if let Some(closest) = candidates.first() {
                current = closest.id;
            }
        }

        if level > top {
            self.entry = Some(id);
        }
        Ok(())
    }

    fn remove(&mut self, id: u64) -> Result<bool> {
        let Some(node) = self.nodes.remove(&id) else {
            return Ok(false);
        };

        for (layer, affected) in node.neighbors.iter().enumerate() {
            // Drop back-references to the removed node.
            for &neighbor_id in affected {
                if let Some(neighbor) = self.nodes.get_mut(&neighbor_id) {
                    if layer < neighbor.neighbors.len() {
                        neighbor.neighbors[layer].retain(|&nid| nid != id);
                    }
                }
            }

            // Pairwise reconnection among the orphaned neighbors.
            let cap = self.config.max_connections(layer);
            for &a in affected {
                let Some(a_node) = self.nodes.get(&a) else {
                    continue;
                };
                if layer >= a_node.neighbors.len() || a_node.neighbors[layer].len() >= cap {
                    continue;
                }
                let a_vector = a_node.vector.clone();

                let mut scored: Vec<Scored> = affected
                    .iter()
                    .filter(|&&b| b != a)
                    .filter(|&&b| {
                        self.nodes
                            .get(&a)
                            .map(|n| !n.neighbors[layer].contains(&b))
                            .unwrap_or(false)
                    })
                    .filter_map(|&b| {
                        self.nodes.get(&b).map(|n| Scored {
                            score: cosine_similarity(&a_vector, &n.vector),
                            id: b,
                        })
                    })
                    .collect();
                scored.sort_by(|x, y| {
                    y.score
                        .partial_cmp(&x.score)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| x.id.cmp(&y.id))
                });

                for candidate in scored {
                    let b = candidate.id;
                    let a_full = self
                        .nodes
                        .get(&a)
                        .map(|n| n.neighbors[layer].len() >= cap)
                        .unwrap_or(true);
                    if a_full {
                        break;
                    }
                    if let Some(a_node) = self.nodes.get_mut(&a) {
                        a_node.neighbors[layer].push(b);
                    }
                    // Reciprocal edge only if the target also has room.
                    if let Some(b_node) = self.nodes.get_mut(&b) {
                        if layer < b_node.neighbors.len()
                            && b_node.neighbors[layer].len() < cap
                            && !b_node.neighbors[layer].contains(&a)
                        {
                            b_node.neighbors[layer].push(a);
                        }
                    }
                }
            }
        }

        if self.entry == Some(id) {
            // Highest surviving level wins; ties go to the lowest ID.
            self.entry = self
                .nodes
                .iter()
                .max_by(|(a_id, a), (b_id, b)| a.level.cmp(&b.level).then(b_id.cmp(a_id)))
                .map(|(&nid, _)| nid);
        }
        if self.nodes.is_empty() {
            self.reset();
        }
        Ok(true)
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        if k == 0 || query.len() != self.dimension {
            return Vec::new();
        }
        let Some(entry_id) = self.entry else {
            return Vec::new();
        };

        let top = self.top_level();
        let mut current = entry_id;
        if top > 0 {
            current = self.greedy_to_layer(query, entry_id, top, 1);
        }

        let ef = self.config.ef_search.max(k);
        self.search_layer(query, current, ef, 0)
            .into_iter()
            .take(k)
            .map(|s| (s.id, s.score))
            .collect()
    }

    fn count(&self) -> usize {
        self.nodes.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn get(&self, id: u64) -> Option<&[f32]> {
        self.nodes.get(&id).map(|n| n.vector.as_slice())
    }

    fn contains(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }

    fn all_vectors(&self) -> BTreeMap<u64, Vec<f32>> {
        self.nodes
            .iter()
            .map(|(&id, node)| (id, node.vector.clone()))
            .collect()
    }

    fn validate_integrity(&self) -> Result<()> {
        let node_count = self.nodes.len();

        for (&id, node) in &self.nodes {
            if node.vector.len() != self.dimension {
                return Err(Error::Integrity(format!(
                    "node {id} has dimension {}, index dimension is {}",
                    node.vector.len(),
                    self.dimension
                )));
            }
            if node.level > self.config.max_level {
                return Err(Error::Integrity(format!(
                    "node {id} level {} exceeds max level {}",
                    node.level, self.config.max_level
                )));
            }
            if node.neighbors.len() != node.level + 1 {
                return Err(Error::Integrity(format!(
                    "node {id} has {} adjacency buckets for level {}",
                    node.neighbors.len(),
                    node.level
                )));
            }
        }

        if let Some(entry_id) = self.entry {
            if !self.nodes.contains_key(&entry_id) {
                return Err(Error::Integrity(format!(
                    "entry point {entry_id} has no node"
                )));
            }
        } else if node_count > 0 {
            return Err(Error::Integrity(
                "non-empty index without entry point".to_string(),
            ));
        }

        let dangling: usize = self
            .nodes
            .values()
            .flat_map(|n| n.neighbors.iter())
            .flatten()
            .filter(|nid| !self.nodes.contains_key(nid))
            .count();
        if dangling as f64 > 0.01 * node_count as f64 {
            return Err(Error::Integrity(format!(
                "{dangling} dangling neighbor references in {node_count} nodes (limit 1%)"
            )));
        }

        if node_count >= 2 {
            let orphans = self
                .nodes
                .values()
                .filter(|n| n.neighbors[0].is_empty())
                .count();
            if orphans as f64 > 0.05 * node_count as f64 {
                return Err(Error::Integrity(format!(
                    "{orphans} level-0 orphan nodes in {node_count} nodes (limit 5%)"
                )));
            }
        }

        Ok(())
    }

    fn rebuild(&mut self) -> Result<()> {
        let pairs: Vec<(u64, Vec<f32>)> = self
            .nodes
            .iter()
            .map(|(&id, node)| (id, node.vector.clone()))
            .collect();

        // Rollback state in case the rebuilt graph fails validation.
        let backup_nodes = std::mem::take(&mut self.nodes);
        let backup_entry = self.entry.take();
        let backup_counter = self.rng_counter;

        self.rng_counter = 0;
        let mut result = Ok(());
        for (id, vector) in pairs {
            if let Err(e) = self.add(id, vector) {
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            result = self.validate_integrity();
        }

        match result {
            Ok(()) => {
                debug!(nodes = self.nodes.len(), "index rebuilt");
                Ok(())
            }
            Err(e) => {
                self.nodes = backup_nodes;
                self.entry = backup_entry;
                self.rng_counter = backup_counter;
                Err(e)
            }
        }
    }

    fn save_to(&self, w: &mut dyn Write) -> Result<()> {
        let max_level = if self.nodes.is_empty() {
            -1
        } else {
            self.top_level() as i32
        };
        persist::write_index(
            w,
            self.dimension,
            self.entry,
            max_level,
            self.nodes.iter().map(|(&id, node)| PersistedNode {
                id,
                level: node.level,
                vector: node.vector.clone(),
                neighbors: node.neighbors.clone(),
            }),
            self.nodes.len(),
        )
    }

    fn load_from(&mut self, r: &mut dyn Read) -> Result<()> {
        let parsed = persist::read_index(r)?;
        self.reset();
        self.dimension = parsed.dimension;
        self.entry = parsed.entry;
        for node in parsed.nodes {
            self.nodes.insert(
                node.id,
                HnswNode {
                    vector: node.vector,
                    level: node.level,
                    neighbors: node.neighbors,
                },
            );
        }
        Ok(())
    }
}

/// SplitMix64 hash, the deterministic source of level draws.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}
