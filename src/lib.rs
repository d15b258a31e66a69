//! Gibram: a session-partitioned, graph-augmented vector retrieval engine.
//!
//! Each session holds a property graph (documents → text chunks → entities
//! → relationships → communities) alongside three HNSW indices. Hybrid
//! queries seed from ANN search, expand over bounded k-hop traversal, and
//! return ranked bundles with auditable traces. State persists through a
//! write-ahead log plus gzip snapshots, served over a length-prefixed
//! binary protocol.
//!
//! This crate re-exports the workspace layers and ships the server binary.

pub use gibram_core::{
    canonical_title, Community, Document, Entity, Error, IdGenerator, RecordKind, Relationship,
    Result, TextUnit,
};

pub use gibram_durability as durability;
pub use gibram_engine as engine;
pub use gibram_index as index;
pub use gibram_wire as wire;
