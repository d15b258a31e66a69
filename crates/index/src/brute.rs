//! Brute-force exact search backend.
//!
//! O(n) scan over every vector. Interchangeable with `HnswIndex` behind
//! the `VectorIndex` trait; useful for small sessions and as the oracle
//! in tests.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::{Read, Write};

use gibram_core::{Error, Result};

use crate::backend::VectorIndex;
use crate::persist::{self, PersistedNode};
use crate::similarity::cosine_similarity;

/// Exact O(n) vector index.
pub struct BruteForceIndex {
    dimension: usize,
    vectors: BTreeMap<u64, Vec<f32>>,
}

impl BruteForceIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: BTreeMap::new(),
        }
    }
}

impl VectorIndex for BruteForceIndex {
    fn add(&mut self, id: u64, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::dimension_mismatch(self.dimension, vector.len()));
        }
        if self.vectors.contains_key(&id) {
            return Err(Error::Conflict(format!("vector {id} already indexed")));
        }
        self.vectors.insert(id, vector);
        Ok(())
    }

    fn remove(&mut self, id: u64) -> Result<bool> {
        Ok(self.vectors.remove(&id).is_some())
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        if k == 0 || query.len() != self.dimension {
            return Vec::new();
        }
        let mut scored: Vec<(u64, f32)> = self
            .vectors
            .iter()
            .map(|(&id, v)| (id, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    fn count(&self) -> usize {
        self.vectors.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn get(&self, id: u64) -> Option<&[f32]> {
        self.vectors.get(&id).map(|v| v.as_slice())
    }

    fn contains(&self, id: u64) -> bool {
        self.vectors.contains_key(&id)
    }

    fn all_vectors(&self) -> BTreeMap<u64, Vec<f32>> {
        self.vectors.clone()
    }

    fn validate_integrity(&self) -> Result<()> {
        for (&id, vector) in &self.vectors {
            if vector.len() != self.dimension {
                return Err(Error::Integrity(format!(
                    "vector {id} has dimension {}, index dimension is {}",
                    vector.len(),
                    self.dimension
                )));
            }
        }
        Ok(())
    }

    fn rebuild(&mut self) -> Result<()> {
        // No derived structure to rebuild.
        Ok(())
    }

    fn save_to(&self, w: &mut dyn Write) -> Result<()> {
        let max_level = if self.vectors.is_empty() { -1 } else { 0 };
        let entry = self.vectors.keys().next().copied();
        persist::write_index(
            w,
            self.dimension,
            entry,
            max_level,
            self.vectors.iter().map(|(&id, vector)| PersistedNode {
                id,
                level: 0,
                vector: vector.clone(),
                neighbors: vec![Vec::new()],
            }),
            self.vectors.len(),
        )
    }

    fn load_from(&mut self, r: &mut dyn Read) -> Result<()> {
        let parsed = persist::read_index(r)?;
        self.dimension = parsed.dimension;
        self.vectors = parsed
            .nodes
            .into_iter()
            .map(|node| (node.id, node.vector))
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_ranking() {
        let mut index = BruteForceIndex::new(2);
        index.add(1, vec![1.0, 0.0]).unwrap();
        index.add(2, vec![0.0, 1.0]).unwrap();
        index.add(3, vec![0.7, 0.7]).unwrap();

        let results = index.search(&[1.0, 0.0], 3);
        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 3);
        assert_eq!(results[2].0, 2);
    }

    #[test]
    fn test_duplicate_and_mismatch() {
        let mut index = BruteForceIndex::new(2);
        index.add(1, vec![1.0, 0.0]).unwrap();
        assert!(index.add(1, vec![0.0, 1.0]).unwrap_err().is_conflict());
        assert!(index.add(2, vec![1.0]).is_err());
    }

    #[test]
    fn test_matches_hnsw_top_hit() {
        use crate::hnsw::{HnswConfig, HnswIndex};

        let mut exact = BruteForceIndex::new(4);
        let mut hnsw = HnswIndex::new(4, HnswConfig::default());
        for i in 0..50u64 {
            let v = vec![(i % 7) as f32, (i % 11) as f32, (i % 3) as f32, 1.0];
            exact.add(i + 1, v.clone()).unwrap();
            hnsw.add(i + 1, v).unwrap();
        }
        let query = [3.0, 4.0, 1.0, 1.0];
        let a = exact.search(&query, 1);
        let b = hnsw.search(&query, 1);
        assert_eq!(a[0].0, b[0].0);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let mut index = BruteForceIndex::new(2);
        index.add(1, vec![1.0, 0.0]).unwrap();
        index.add(2, vec![0.0, 1.0]).unwrap();

        let mut buf = Vec::new();
        index.save_to(&mut buf).unwrap();

        let mut loaded = BruteForceIndex::new(2);
        loaded.load_from(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.all_vectors(), index.all_vectors());
    }
}
