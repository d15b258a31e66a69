//! Record types held by a session.
//!
//! All records are plain data with serde derives: the same structs travel
//! through logged operations, snapshot sections and wire responses.
//! Linkage between records is expressed through ID sets, never through
//! cross-references; the session store maintains the secondary maps and
//! adjacency that make those IDs navigable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Canonical form of an entity title: trimmed, uppercased.
///
/// Stored titles are canonical and lookups canonicalize before comparing,
/// so "BANK" and " bank " name the same entity.
pub fn canonical_title(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// A source document. Owns nothing; text units point back at it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    /// Client-chosen idempotency key, unique within the session.
    pub external_id: String,
    pub filename: String,
}

/// A chunk of text extracted from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: u64,
    pub external_id: String,
    pub document_id: u64,
    pub content: String,
    pub token_count: u32,
    /// Entities mentioned by this chunk. Kept symmetric with
    /// `Entity::text_unit_ids` by the session store.
    pub entity_ids: BTreeSet<u64>,
    /// Absent embeddings are legal; present ones are always indexed.
    pub embedding: Option<Vec<f32>>,
}

/// A named entity extracted from text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: u64,
    /// Optional; unique within the session when non-empty.
    pub external_id: String,
    /// Canonical (trimmed, uppercased) title, unique within the session.
    pub title: String,
    pub entity_type: String,
    pub description: String,
    /// Text units mentioning this entity.
    pub text_unit_ids: BTreeSet<u64>,
    pub embedding: Option<Vec<f32>>,
}

/// A directed, weighted edge between two entities.
///
/// The `(source, target)` pair is unique within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: u64,
    pub external_id: String,
    pub source: u64,
    pub target: u64,
    pub rel_type: String,
    pub description: String,
    /// Zero on insert is coerced to 1.0.
    pub weight: f32,
}

/// A cluster of entities and relationships at a hierarchy level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: u64,
    pub external_id: String,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub level: u32,
    pub entity_ids: Vec<u64>,
    pub relationship_ids: Vec<u64>,
    pub embedding: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_title() {
        assert_eq!(canonical_title(" bank "), "BANK");
        assert_eq!(canonical_title("BANK"), "BANK");
        assert_eq!(canonical_title("Straße"), "STRASSE");
        assert_eq!(canonical_title(""), "");
    }

    #[test]
    fn test_records_roundtrip_through_bincode() {
        let unit = TextUnit {
            id: 3,
            external_id: "t1".into(),
            document_id: 1,
            content: "hello world".into(),
            token_count: 2,
            entity_ids: BTreeSet::from([7, 9]),
            embedding: Some(vec![0.5, 0.5, 0.0]),
        };
        let bytes = bincode::serialize(&unit).unwrap();
        let back: TextUnit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, unit);

        let rel = Relationship {
            id: 1,
            external_id: String::new(),
            source: 7,
            target: 9,
            rel_type: "mentions".into(),
            description: String::new(),
            weight: 1.0,
        };
        let bytes = bincode::serialize(&rel).unwrap();
        let back: Relationship = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, rel);
    }
}
