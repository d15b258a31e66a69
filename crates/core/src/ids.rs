//! Per-session record ID allocation.
//!
//! Every session carries one `IdGenerator` with an independent monotone
//! counter per record kind. IDs start at 1 and are never reused; restoring
//! from a snapshot restores the counters, and replaying logged operations
//! through the normal allocation path reproduces identical IDs.

use serde::{Deserialize, Serialize};

/// The five record kinds that receive numeric IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Document,
    TextUnit,
    Entity,
    Relationship,
    Community,
}

impl RecordKind {
    /// All kinds, in counter order.
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Document,
        RecordKind::TextUnit,
        RecordKind::Entity,
        RecordKind::Relationship,
        RecordKind::Community,
    ];

    fn slot(self) -> usize {
        match self {
            RecordKind::Document => 0,
            RecordKind::TextUnit => 1,
            RecordKind::Entity => 2,
            RecordKind::Relationship => 3,
            RecordKind::Community => 4,
        }
    }

    /// Human-readable name, used in error messages and section labels.
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Document => "document",
            RecordKind::TextUnit => "text_unit",
            RecordKind::Entity => "entity",
            RecordKind::Relationship => "relationship",
            RecordKind::Community => "community",
        }
    }
}

/// Snapshot of all five counters, as persisted.
///
/// `counters[i]` is the last ID handed out for the kind in slot `i`
/// (0 = nothing allocated yet).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdCounters {
    pub counters: [u64; 5],
}

/// Monotone per-kind ID generator.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    counters: [u64; 5],
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next ID for `kind`. First allocation returns 1.
    pub fn next(&mut self, kind: RecordKind) -> u64 {
        let slot = kind.slot();
        self.counters[slot] += 1;
        self.counters[slot]
    }

    /// Raise the counter for `kind` to at least `id`.
    ///
    /// Called while restoring records from a snapshot so that future
    /// allocations never collide with restored IDs.
    pub fn observe(&mut self, kind: RecordKind, id: u64) {
        let slot = kind.slot();
        if self.counters[slot] < id {
            self.counters[slot] = id;
        }
    }

    /// Export counter state for snapshotting.
    pub fn counters(&self) -> IdCounters {
        IdCounters {
            counters: self.counters,
        }
    }

    /// Replace counter state from a snapshot.
    pub fn restore(&mut self, counters: IdCounters) {
        self.counters = counters.counters;
    }

    /// Last ID handed out for `kind` (0 if none).
    pub fn last(&self, kind: RecordKind) -> u64 {
        self.counters[kind.slot()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_one_and_are_independent() {
        let mut ids = IdGenerator::new();
        assert_eq!(ids.next(RecordKind::Document), 1);
        assert_eq!(ids.next(RecordKind::Document), 2);
        assert_eq!(ids.next(RecordKind::Entity), 1);
        assert_eq!(ids.next(RecordKind::Community), 1);
        assert_eq!(ids.last(RecordKind::Document), 2);
        assert_eq!(ids.last(RecordKind::TextUnit), 0);
    }

    #[test]
    fn test_observe_never_lowers() {
        let mut ids = IdGenerator::new();
        ids.observe(RecordKind::Entity, 40);
        ids.observe(RecordKind::Entity, 10);
        assert_eq!(ids.next(RecordKind::Entity), 41);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut ids = IdGenerator::new();
        for _ in 0..7 {
            ids.next(RecordKind::Relationship);
        }
        ids.next(RecordKind::TextUnit);

        let saved = ids.counters();
        let mut restored = IdGenerator::new();
        restored.restore(saved);
        assert_eq!(restored.next(RecordKind::Relationship), 8);
        assert_eq!(restored.next(RecordKind::TextUnit), 2);
    }
}
