//! Community detection.
//!
//! Clustering is a pluggable collaborator: the engine hands a detector an
//! undirected weighted view of the live entity graph and materializes
//! whatever clusters come back as Community records through the normal
//! logged path. `ConnectedComponents` is the built-in detector; richer
//! algorithms (Leiden and friends) implement the same trait.

use crate::engine::Engine;
use crate::ops::LoggedOp;
use gibram_core::Result;
use rustc_hash::FxHashMap;
use tracing::debug;

/// One edge of the entity graph as a detector sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphEdge {
    pub relationship_id: u64,
    pub source: u64,
    pub target: u64,
    pub weight: f32,
}

/// Undirected weighted view of a session's live entity graph.
///
/// Only relationships whose both endpoints exist are included.
#[derive(Debug, Clone, Default)]
pub struct GraphView {
    pub entities: Vec<u64>,
    pub edges: Vec<GraphEdge>,
}

/// A cluster a detector proposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunityDraft {
    pub entity_ids: Vec<u64>,
    pub relationship_ids: Vec<u64>,
}

/// The clustering contract.
///
/// Implementations must return disjoint clusters covering a subset of
/// `view.entities`; determinism is expected for replayable results.
pub trait CommunityDetector: Send + Sync {
    fn detect(&self, view: &GraphView, level: u32) -> Vec<CommunityDraft>;
}

/// Built-in detector: undirected connected components via union-find.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectedComponents;

impl ConnectedComponents {
    fn find(parents: &mut FxHashMap<u64, u64>, id: u64) -> u64 {
        let mut root = id;
        while parents[&root] != root {
            root = parents[&root];
        }
        // Path compression.
        let mut current = id;
        while parents[&current] != root {
            let next = parents[&current];
            parents.insert(current, root);
            current = next;
        }
        root
    }

    fn union(parents: &mut FxHashMap<u64, u64>, a: u64, b: u64) {
        let root_a = Self::find(parents, a);
        let root_b = Self::find(parents, b);
        if root_a != root_b {
            let (low, high) = if root_a < root_b {
                (root_a, root_b)
            } else {
                (root_b, root_a)
            };
            parents.insert(high, low);
        }
    }
}

impl CommunityDetector for ConnectedComponents {
    fn detect(&self, view: &GraphView, _level: u32) -> Vec<CommunityDraft> {
        let mut parents: FxHashMap<u64, u64> =
            view.entities.iter().map(|&id| (id, id)).collect();
        for edge in &view.edges {
            if parents.contains_key(&edge.source) && parents.contains_key(&edge.target) {
                Self::union(&mut parents, edge.source, edge.target);
            }
        }

        let mut clusters: FxHashMap<u64, CommunityDraft> = FxHashMap::default();
        for &id in &view.entities {
            let root = Self::find(&mut parents, id);
            clusters.entry(root).or_default().entity_ids.push(id);
        }
        for edge in &view.edges {
            if !parents.contains_key(&edge.source) || !parents.contains_key(&edge.target) {
                continue;
            }
            let root = Self::find(&mut parents, edge.source);
            if let Some(cluster) = clusters.get_mut(&root) {
                cluster.relationship_ids.push(edge.relationship_id);
            }
        }

        let mut drafts: Vec<(u64, CommunityDraft)> = clusters.into_iter().collect();
        drafts.sort_by_key(|(root, _)| *root);
        drafts
            .into_iter()
            .map(|(_, mut draft)| {
                draft.entity_ids.sort_unstable();
                draft.relationship_ids.sort_unstable();
                draft.relationship_ids.dedup();
                draft
            })
            .collect()
    }
}

impl Default for CommunityDraft {
    fn default() -> Self {
        CommunityDraft {
            entity_ids: Vec::new(),
            relationship_ids: Vec::new(),
        }
    }
}

impl Engine {
    fn graph_view(&self, session_id: &str) -> Result<GraphView> {
        let session = self.session(session_id)?;
        let state = session.read_state();
        let mut entities: Vec<u64> = state.entities.keys().copied().collect();
        entities.sort_unstable();
        let mut edges: Vec<GraphEdge> = state
            .relationships
            .values()
            .filter(|rel| {
                state.entities.contains_key(&rel.source)
                    && state.entities.contains_key(&rel.target)
            })
            .map(|rel| GraphEdge {
                relationship_id: rel.id,
                source: rel.source,
                target: rel.target,
                weight: rel.weight,
            })
            .collect();
        edges.sort_by_key(|edge| edge.relationship_id);
        Ok(GraphView { entities, edges })
    }

    /// Materialize `draft` as a Community record at `level`.
    fn create_community(
        &self,
        session_id: &str,
        level: u32,
        ordinal: usize,
        draft: &CommunityDraft,
    ) -> Result<u64> {
        let session = self.session(session_id)?;
        let member_titles: Vec<String> = {
            let state = session.read_state();
            draft
                .entity_ids
                .iter()
                .filter_map(|id| state.entities.get(id))
                .map(|e| e.title.clone())
                .collect()
        };
        let summary = member_titles
            .iter()
            .take(10)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        let outcome = self.execute(LoggedOp::AddCommunity {
            session: session_id.to_string(),
            external_id: String::new(),
            title: format!("Level {level} community {ordinal}"),
            summary,
            content: member_titles.join(", "),
            level,
            entity_ids: draft.entity_ids.clone(),
            relationship_ids: draft.relationship_ids.clone(),
            embedding: None,
        })?;
        Ok(outcome.id())
    }

    /// Run the detector once and store the clusters at `level`.
    ///
    /// Returns the created community IDs.
    pub fn compute_communities(
        &self,
        session_id: &str,
        level: u32,
        detector: &dyn CommunityDetector,
    ) -> Result<Vec<u64>> {
        let view = self.graph_view(session_id)?;
        let drafts = detector.detect(&view, level);
        debug!(session = session_id, level, clusters = drafts.len(), "communities detected");
        let mut created = Vec::with_capacity(drafts.len());
        for (ordinal, draft) in drafts.iter().enumerate() {
            created.push(self.create_community(session_id, level, ordinal, draft)?);
        }
        Ok(created)
    }

    /// Build a hierarchy: level 0 over the raw graph, each further level
    /// over the previous level's cluster graph (clusters contracted to
    /// their lowest entity ID). Stops when clustering no longer merges
    /// anything or `max_levels` is reached.
    ///
    /// Returns the created community IDs per level.
    pub fn compute_community_hierarchy(
        &self,
        session_id: &str,
        max_levels: u32,
        detector: &dyn CommunityDetector,
    ) -> Result<Vec<Vec<u64>>> {
        let view = self.graph_view(session_id)?;
        let mut all_created = Vec::new();
        let mut previous = detector.detect(&view, 0);
        if previous.is_empty() {
            return Ok(all_created);
        }
        let mut created = Vec::new();
        for (ordinal, draft) in previous.iter().enumerate() {
            created.push(self.create_community(session_id, 0, ordinal, draft)?);
        }
        all_created.push(created);

        for level in 1..max_levels {
            // Contract each previous cluster to its lowest entity ID.
            let mut representative: FxHashMap<u64, u64> = FxHashMap::default();
            for draft in &previous {
                let Some(&rep) = draft.entity_ids.first() else {
                    continue;
                };
                for &id in &draft.entity_ids {
                    representative.insert(id, rep);
                }
            }
            let mut reps: Vec<u64> = previous
                .iter()
                .filter_map(|d| d.entity_ids.first().copied())
                .collect();
            reps.sort_unstable();
            let cross_edges: Vec<GraphEdge> = view
                .edges
                .iter()
                .filter_map(|edge| {
                    let source = *representative.get(&edge.source)?;
                    let target = *representative.get(&edge.target)?;
                    (source != target).then_some(GraphEdge {
                        relationship_id: edge.relationship_id,
                        source,
                        target,
                        weight: edge.weight,
                    })
                })
                .collect();

            let contracted = GraphView {
                entities: reps,
                edges: cross_edges,
            };
            let clusters = detector.detect(&contracted, level);
            if clusters.len() >= previous.len() {
                break;
            }

            // Expand rep clusters back to full entity membership.
            let mut by_rep: FxHashMap<u64, &CommunityDraft> = FxHashMap::default();
            for draft in &previous {
                if let Some(&rep) = draft.entity_ids.first() {
                    by_rep.insert(rep, draft);
                }
            }
            let merged: Vec<CommunityDraft> = clusters
                .iter()
                .map(|cluster| {
                    let mut entity_ids = Vec::new();
                    let mut relationship_ids = cluster.relationship_ids.clone();
                    for rep in &cluster.entity_ids {
                        if let Some(member) = by_rep.get(rep) {
                            entity_ids.extend_from_slice(&member.entity_ids);
                            relationship_ids.extend_from_slice(&member.relationship_ids);
                        }
                    }
                    entity_ids.sort_unstable();
                    relationship_ids.sort_unstable();
                    relationship_ids.dedup();
                    CommunityDraft {
                        entity_ids,
                        relationship_ids,
                    }
                })
                .collect();

            let mut created = Vec::new();
            for (ordinal, draft) in merged.iter().enumerate() {
                created.push(self.create_community(session_id, level, ordinal, draft)?);
            }
            all_created.push(created);
            previous = merged;
        }
        Ok(all_created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use gibram_index::IndexKind;
    use std::time::Duration;

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            dimension: 4,
            index_kind: IndexKind::BruteForce,
            sweep_interval: Duration::from_secs(60),
        })
    }

    fn add_entity(engine: &Engine, title: &str) -> u64 {
        engine
            .execute(LoggedOp::AddEntity {
                session: "s".into(),
                external_id: String::new(),
                title: title.into(),
                entity_type: "t".into(),
                description: String::new(),
                embedding: None,
            })
            .unwrap()
            .id()
    }

    fn add_rel(engine: &Engine, source: u64, target: u64) -> u64 {
        engine
            .execute(LoggedOp::AddRelationship {
                session: "s".into(),
                external_id: String::new(),
                source,
                target,
                rel_type: "rel".into(),
                description: String::new(),
                weight: 1.0,
            })
            .unwrap()
            .id()
    }

    #[test]
    fn test_connected_components_on_two_islands() {
        let view = GraphView {
            entities: vec![1, 2, 3, 10, 11],
            edges: vec![
                GraphEdge {
                    relationship_id: 100,
                    source: 1,
                    target: 2,
                    weight: 1.0,
                },
                GraphEdge {
                    relationship_id: 101,
                    source: 2,
                    target: 3,
                    weight: 1.0,
                },
                GraphEdge {
                    relationship_id: 102,
                    source: 10,
                    target: 11,
                    weight: 1.0,
                },
            ],
        };
        let drafts = ConnectedComponents.detect(&view, 0);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].entity_ids, vec![1, 2, 3]);
        assert_eq!(drafts[0].relationship_ids, vec![100, 101]);
        assert_eq!(drafts[1].entity_ids, vec![10, 11]);
    }

    #[test]
    fn test_compute_communities_creates_records() {
        let e = engine();
        let a = add_entity(&e, "a");
        let b = add_entity(&e, "b");
        let c = add_entity(&e, "c");
        add_rel(&e, a, b);

        let created = e.compute_communities("s", 0, &ConnectedComponents).unwrap();
        assert_eq!(created.len(), 2);

        let session = e.session("s").unwrap();
        let first = session.get_community(created[0]).unwrap();
        assert_eq!(first.level, 0);
        assert_eq!(first.entity_ids, vec![a, b]);
        assert!(first.summary.contains('A'));

        let second = session.get_community(created[1]).unwrap();
        assert_eq!(second.entity_ids, vec![c]);
    }

    #[test]
    fn test_hierarchy_stops_when_nothing_merges() {
        let e = engine();
        let a = add_entity(&e, "a");
        let b = add_entity(&e, "b");
        add_rel(&e, a, b);

        let levels = e
            .compute_community_hierarchy("s", 4, &ConnectedComponents)
            .unwrap();
        // Connected components are already maximal; only level 0 exists.
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 1);
    }

    #[test]
    fn test_missing_session_fails() {
        let e = engine();
        assert!(e
            .compute_communities("missing", 0, &ConnectedComponents)
            .unwrap_err()
            .is_not_found());
    }
}
