//! Shared on-disk layout for vector indices.
//!
//! All fields little-endian:
//!
//! ```text
//! ┌───────────────┬───────────┬──────────────┬────────────────┐
//! │ dimension u32 │ count u64 │ entry id u64 │ max level i32  │
//! └───────────────┴───────────┴──────────────┴────────────────┘
//! Per node:
//! ┌────────┬───────────┬────────────────┬─ per level 0..=level ─┐
//! │ id u64 │ level i32 │ dimension f32s │ count u32 + ids u64   │
//! └────────┴───────────┴────────────────┴───────────────────────┘
//! ```
//!
//! `max level` is -1 and `entry id` is 0 when the index is empty.
//! Every field is validated against the bounds in `gibram_core::limits`
//! before anything is allocated from it.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use gibram_core::{limits, Error, Result};
use std::io::{Read, Write};

/// One node as it appears on disk.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PersistedNode {
    pub id: u64,
    pub level: usize,
    pub vector: Vec<f32>,
    /// `level + 1` buckets of neighbor IDs.
    pub neighbors: Vec<Vec<u64>>,
}

/// The fully parsed file.
#[derive(Debug)]
pub(crate) struct PersistedIndex {
    pub dimension: usize,
    pub entry: Option<u64>,
    pub nodes: Vec<PersistedNode>,
}

pub(crate) fn write_index(
    w: &mut dyn Write,
    dimension: usize,
    entry: Option<u64>,
    max_level: i32,
    nodes: impl Iterator<Item = PersistedNode>,
    count: usize,
) -> Result<()> {
    w.write_u32::<LittleEndian>(dimension as u32)?;
    w.write_u64::<LittleEndian>(count as u64)?;
    w.write_u64::<LittleEndian>(entry.unwrap_or(0))?;
    w.write_i32::<LittleEndian>(max_level)?;

    for node in nodes {
        w.write_u64::<LittleEndian>(node.id)?;
        w.write_i32::<LittleEndian>(node.level as i32)?;
        for &component in &node.vector {
            w.write_f32::<LittleEndian>(component)?;
        }
        for bucket in &node.neighbors {
            w.write_u32::<LittleEndian>(bucket.len() as u32)?;
            for &neighbor in bucket {
                w.write_u64::<LittleEndian>(neighbor)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn read_index(r: &mut dyn Read) -> Result<PersistedIndex> {
    let dimension = r.read_u32::<LittleEndian>()? as usize;
    if dimension == 0 || dimension > limits::MAX_DIMENSION {
        return Err(Error::Invalid(format!(
            "persisted index dimension {dimension} out of bounds"
        )));
    }

    let count = r.read_u64::<LittleEndian>()?;
    if count > limits::MAX_INDEX_VECTORS {
        return Err(Error::Invalid(format!(
            "persisted index count {count} out of bounds"
        )));
    }

    let entry_id = r.read_u64::<LittleEndian>()?;
    let max_level = r.read_i32::<LittleEndian>()?;
    if !(-1..=limits::MAX_PERSISTED_LEVEL).contains(&max_level) {
        return Err(Error::Invalid(format!(
            "persisted index max level {max_level} out of bounds"
        )));
    }
    if count > 0 && max_level < 0 {
        return Err(Error::Invalid(
            "persisted index has nodes but empty max level".to_string(),
        ));
    }

    let mut nodes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = r.read_u64::<LittleEndian>()?;
        let level = r.read_i32::<LittleEndian>()?;
        if !(0..=limits::MAX_PERSISTED_LEVEL).contains(&level) {
            return Err(Error::Invalid(format!(
                "persisted node {id} level {level} out of bounds"
            )));
        }

        let mut vector = vec![0.0f32; dimension];
        for component in vector.iter_mut() {
            *component = r.read_f32::<LittleEndian>()?;
        }

        let mut neighbors = Vec::with_capacity(level as usize + 1);
        for _ in 0..=level {
            let bucket_len = r.read_u32::<LittleEndian>()?;
            if bucket_len > limits::MAX_PERSISTED_NEIGHBORS {
                return Err(Error::Invalid(format!(
                    "persisted node {id} neighbor count {bucket_len} out of bounds"
                )));
            }
            let mut bucket = Vec::with_capacity(bucket_len as usize);
            for _ in 0..bucket_len {
                bucket.push(r.read_u64::<LittleEndian>()?);
            }
            neighbors.push(bucket);
        }

        nodes.push(PersistedNode {
            id,
            level: level as usize,
            vector,
            neighbors,
        });
    }

    let entry = if count > 0 { Some(entry_id) } else { None };
    if let Some(entry_id) = entry {
        if !nodes.iter().any(|n| n.id == entry_id) {
            return Err(Error::Corruption(format!(
                "persisted index entry point {entry_id} has no node"
            )));
        }
    }

    Ok(PersistedIndex {
        dimension,
        entry,
        nodes,
    })
}
