//! Vector index capability trait.
//!
//! Defines the interface for swappable index implementations:
//! `BruteForceIndex` (exact O(n) search) and `HnswIndex` (O(log n) search).
//! The session store owns backends behind `Box<dyn VectorIndex>` and must
//! not depend on which one is in play.

use gibram_core::Result;
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Trait for swappable vector index implementations.
///
/// IDs are assigned externally; the index never allocates them. All
/// mutators are `&mut self` — the owner provides the reader/writer lock.
pub trait VectorIndex: Send + Sync {
    /// Insert a vector.
    ///
    /// Fails with `Conflict` if the ID is already present and `Invalid`
    /// if the vector's dimension does not match the index dimension.
    fn add(&mut self, id: u64, vector: Vec<f32>) -> Result<()>;

    /// Remove a vector, repairing graph structure as needed.
    ///
    /// Returns true if the vector existed.
    fn remove(&mut self, id: u64) -> Result<bool>;

    /// Search for the `k` nearest neighbors of `query`.
    ///
    /// Returns `(id, cosine similarity)` pairs sorted by
    /// (similarity desc, id asc). Empty on an empty index or a
    /// dimension mismatch.
    fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)>;

    /// Number of indexed vectors.
    fn count(&self) -> usize;

    /// Embedding dimension.
    fn dimension(&self) -> usize;

    /// Get a vector by ID.
    fn get(&self, id: u64) -> Option<&[f32]>;

    /// Check if a vector exists.
    fn contains(&self, id: u64) -> bool;

    /// All `(id, vector)` pairs in ascending ID order.
    fn all_vectors(&self) -> BTreeMap<u64, Vec<f32>>;

    /// Check structural health.
    ///
    /// Fails with `Integrity` naming the violated check: wrong vector
    /// dimension, level out of bounds, adjacency arity mismatch, missing
    /// entry point, dangling neighbor references above 1% of node count,
    /// or level-0 orphans above 5% of node count (with at least 2 nodes).
    fn validate_integrity(&self) -> Result<()>;

    /// Rebuild the index from its own vectors.
    ///
    /// Atomic: on validation failure after re-insertion, the previous
    /// structure is restored and the validation error is returned.
    fn rebuild(&mut self) -> Result<()>;

    /// Serialize the index to `w` in the shared little-endian layout.
    fn save_to(&self, w: &mut dyn Write) -> Result<()>;

    /// Replace this index's contents from `r`, validating every field
    /// against defensive bounds and failing fast on violation.
    fn load_from(&mut self, r: &mut dyn Read) -> Result<()>;
}

/// Which backend a session should build its indices from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexKind {
    #[default]
    Hnsw,
    BruteForce,
}

impl IndexKind {
    /// Create a new backend instance of this kind.
    pub fn create(self, dimension: usize) -> Box<dyn VectorIndex> {
        match self {
            IndexKind::Hnsw => Box::new(crate::hnsw::HnswIndex::new(
                dimension,
                crate::hnsw::HnswConfig::default(),
            )),
            IndexKind::BruteForce => Box::new(crate::brute::BruteForceIndex::new(dimension)),
        }
    }
}
