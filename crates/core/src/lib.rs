//! Core types for the gibram retrieval engine.
//!
//! This crate holds everything the other layers agree on:
//!
//! - **Error**: the unified error taxonomy with wire codes
//! - **IdGenerator**: per-session, per-kind monotone ID allocation
//! - **Records**: Document, TextUnit, Entity, Relationship, Community
//! - **limits**: defensive bounds applied when reading persisted state

pub mod error;
pub mod ids;
pub mod limits;
pub mod records;

pub use error::{Error, Result};
pub use ids::{IdCounters, IdGenerator, RecordKind};
pub use records::{
    canonical_title, Community, Document, Entity, Relationship, TextUnit,
};
