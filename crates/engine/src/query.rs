//! Hybrid query pipeline.
//!
//! Three phases over a session:
//!
//! 1. **Seeding**: ANN search over each requested index (text unit,
//!    entity, community); every hit lands in the EXPLAIN seed list.
//! 2. **Expansion**: breadth-first search over entity adjacency up to
//!    `k_hops`, starting from seeded entities and the entities seeded
//!    text units link to. Every traversal step is recorded; visited
//!    entities are deduplicated at their minimum hop.
//! 3. **Aggregation**: ranked, truncated bundles of entities,
//!    relationships (both endpoints in the result set), text units and
//!    communities.
//!
//! Traces live in a process-wide bounded most-recent cache keyed by a
//! monotone query ID.

use crate::engine::Engine;
use crate::session::SessionStore;
use gibram_core::{Error, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

/// How many traces the EXPLAIN cache retains.
const EXPLAIN_CACHE_SIZE: usize = 1024;

/// Which indices seed a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchKind {
    TextUnit,
    Entity,
    Community,
}

/// A hybrid query. Zero-valued knobs take the documented defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub vector: Vec<f32>,
    /// Empty expands to all three kinds.
    pub search_types: Vec<SearchKind>,
    pub top_k: u32,
    pub k_hops: u32,
    pub max_entities: u32,
    pub max_text_units: u32,
    pub max_communities: u32,
}

impl QuerySpec {
    fn normalized(mut self) -> Self {
        if self.search_types.is_empty() {
            self.search_types = vec![
                SearchKind::TextUnit,
                SearchKind::Entity,
                SearchKind::Community,
            ];
        }
        if self.top_k == 0 {
            self.top_k = 10;
        }
        if self.k_hops == 0 {
            self.k_hops = 2;
        }
        if self.max_entities == 0 {
            self.max_entities = 50;
        }
        if self.max_text_units == 0 {
            self.max_text_units = 10;
        }
        if self.max_communities == 0 {
            self.max_communities = 5;
        }
        self
    }
}

/// One ANN hit, as recorded in the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedHit {
    pub kind: SearchKind,
    pub id: u64,
    pub external_id: String,
    pub similarity: f32,
}

/// One BFS edge crossing, as recorded in the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalStep {
    pub from_entity: u64,
    pub to_entity: u64,
    pub relationship_id: u64,
    pub rel_type: String,
    pub weight: f32,
    pub hop: u32,
}

/// The audit record of one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTrace {
    pub query_id: u64,
    pub seeds: Vec<SeedHit>,
    pub traversal: Vec<TraversalStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityHit {
    pub id: u64,
    pub external_id: String,
    pub title: String,
    pub entity_type: String,
    pub description: String,
    pub hop: u32,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipHit {
    pub id: u64,
    pub source: u64,
    pub target: u64,
    pub source_title: String,
    pub target_title: String,
    pub rel_type: String,
    pub description: String,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnitHit {
    pub id: u64,
    pub external_id: String,
    pub document_id: u64,
    pub content: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityHit {
    pub id: u64,
    pub external_id: String,
    pub title: String,
    pub summary: String,
    pub level: u32,
    pub similarity: f32,
}

/// The ranked, deduplicated bundle a query returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: u64,
    pub entities: Vec<EntityHit>,
    pub relationships: Vec<RelationshipHit>,
    pub text_units: Vec<TextUnitHit>,
    pub communities: Vec<CommunityHit>,
    pub duration_micros: u64,
    pub vectors_searched: u64,
    pub edges_scanned: u64,
}

/// Process-wide planner: query ID allocation plus the EXPLAIN cache.
pub struct QueryPlanner {
    next_query_id: AtomicU64,
    traces: Mutex<VecDeque<QueryTrace>>,
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryPlanner {
    pub fn new() -> Self {
        QueryPlanner {
            next_query_id: AtomicU64::new(1),
            traces: Mutex::new(VecDeque::with_capacity(EXPLAIN_CACHE_SIZE)),
        }
    }

    /// Fetch a stored trace.
    pub fn explain(&self, query_id: u64) -> Result<QueryTrace> {
        self.traces
            .lock()
            .iter()
            .find(|trace| trace.query_id == query_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("query trace {query_id}")))
    }

    fn store_trace(&self, trace: QueryTrace) {
        let mut traces = self.traces.lock();
        if traces.len() == EXPLAIN_CACHE_SIZE {
            traces.pop_front();
        }
        traces.push_back(trace);
    }

    /// Run the three-phase pipeline against one session.
    pub fn run(
        &self,
        session: &SessionStore,
        spec: QuerySpec,
        dimension: usize,
    ) -> Result<QueryResult> {
        if spec.vector.len() != dimension {
            return Err(Error::dimension_mismatch(dimension, spec.vector.len()));
        }
        let spec = spec.normalized();
        let started = Instant::now();
        let query_id = self.next_query_id.fetch_add(1, Ordering::SeqCst);

        let state = session.read_state();
        let mut seeds = Vec::new();
        let mut vectors_searched = 0u64;
        let mut edges_scanned = 0u64;

        // Phase 1: ANN seeding per requested kind.
        let mut text_unit_seeds: Vec<(u64, f32)> = Vec::new();
        let mut entity_seeds: Vec<(u64, f32)> = Vec::new();
        let mut community_seeds: Vec<(u64, f32)> = Vec::new();

        for kind in &spec.search_types {
            match kind {
                SearchKind::TextUnit => {
                    let index = state.text_unit_index.read();
                    vectors_searched += index.count() as u64;
                    text_unit_seeds = index.search(&spec.vector, spec.top_k as usize);
                    for &(id, similarity) in &text_unit_seeds {
                        seeds.push(SeedHit {
                            kind: SearchKind::TextUnit,
                            id,
                            external_id: state
                                .text_units
                                .get(&id)
                                .map(|u| u.external_id.clone())
                                .unwrap_or_default(),
                            similarity,
                        });
                    }
                }
                SearchKind::Entity => {
                    let index = state.entity_index.read();
                    vectors_searched += index.count() as u64;
                    entity_seeds = index.search(&spec.vector, spec.top_k as usize);
                    for &(id, similarity) in &entity_seeds {
                        seeds.push(SeedHit {
                            kind: SearchKind::Entity,
                            id,
                            external_id: state
                                .entities
                                .get(&id)
                                .map(|e| e.external_id.clone())
                                .unwrap_or_default(),
                            similarity,
                        });
                    }
                }
                SearchKind::Community => {
                    let index = state.community_index.read();
                    vectors_searched += index.count() as u64;
                    community_seeds = index.search(&spec.vector, spec.top_k as usize);
                    for &(id, similarity) in &community_seeds {
                        seeds.push(SeedHit {
                            kind: SearchKind::Community,
                            id,
                            external_id: state
                                .communities
                                .get(&id)
                                .map(|c| c.external_id.clone())
                                .unwrap_or_default(),
                            similarity,
                        });
                    }
                }
            }
        }

        // Frontier 0: seeded entities plus entities seeded text units link to.
        // visited: entity -> (minimum hop, best similarity)
        let mut visited: FxHashMap<u64, (u32, f32)> = FxHashMap::default();
        for &(id, similarity) in &entity_seeds {
            if state.entities.contains_key(&id) {
                visited.insert(id, (0, similarity));
            }
        }
        for &(unit_id, similarity) in &text_unit_seeds {
            if let Some(unit) = state.text_units.get(&unit_id) {
                for &entity_id in &unit.entity_ids {
                    if !state.entities.contains_key(&entity_id) {
                        continue;
                    }
                    visited
                        .entry(entity_id)
                        .and_modify(|(_, best)| *best = best.max(similarity))
                        .or_insert((0, similarity));
                }
            }
        }

        // Phase 2: bounded BFS over entity adjacency.
        let mut traversal = Vec::new();
        let mut frontier: Vec<u64> = visited.keys().copied().collect();
        frontier.sort_unstable();

        for hop in 1..=spec.k_hops {
            let mut next = Vec::new();
            for &from in &frontier {
                let rel_ids = state
                    .outgoing
                    .get(&from)
                    .into_iter()
                    .flatten()
                    .chain(state.incoming.get(&from).into_iter().flatten());
                for &rel_id in rel_ids {
                    edges_scanned += 1;
                    let Some(rel) = state.relationships.get(&rel_id) else {
                        continue;
                    };
                    let to = if rel.source == from { rel.target } else { rel.source };
                    // Dangling endpoints are filtered out here.
                    if !state.entities.contains_key(&to) {
                        continue;
                    }
                    traversal.push(TraversalStep {
                        from_entity: from,
                        to_entity: to,
                        relationship_id: rel_id,
                        rel_type: rel.rel_type.clone(),
                        weight: rel.weight,
                        hop,
                    });
                    if !visited.contains_key(&to) {
                        visited.insert(to, (hop, 0.0));
                        next.push(to);
                    }
                }
            }
            next.sort_unstable();
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }

        // Phase 3: aggregation.
        let mut entities: Vec<EntityHit> = visited
            .iter()
            .filter_map(|(&id, &(hop, similarity))| {
                state.entities.get(&id).map(|entity| EntityHit {
                    id,
                    external_id: entity.external_id.clone(),
                    title: entity.title.clone(),
                    entity_type: entity.entity_type.clone(),
                    description: entity.description.clone(),
                    hop,
                    similarity,
                })
            })
            .collect();
        entities.sort_by(|a, b| {
            a.hop
                .cmp(&b.hop)
                .then_with(|| {
                    b.similarity
                        .partial_cmp(&a.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });
        entities.truncate(spec.max_entities as usize);

        let result_entity_ids: FxHashMap<u64, f32> = entities
            .iter()
            .map(|hit| (hit.id, hit.similarity))
            .collect();

        let mut relationships: Vec<RelationshipHit> = state
            .relationships
            .values()
            .filter(|rel| {
                result_entity_ids.contains_key(&rel.source)
                    && result_entity_ids.contains_key(&rel.target)
            })
            .map(|rel| RelationshipHit {
                id: rel.id,
                source: rel.source,
                target: rel.target,
                source_title: state
                    .entities
                    .get(&rel.source)
                    .map(|e| e.title.clone())
                    .unwrap_or_default(),
                target_title: state
                    .entities
                    .get(&rel.target)
                    .map(|e| e.title.clone())
                    .unwrap_or_default(),
                rel_type: rel.rel_type.clone(),
                description: rel.description.clone(),
                weight: rel.weight,
            })
            .collect();
        relationships.sort_by_key(|hit| hit.id);

        // Text units: seeded hits keep their ANN similarity; units reached
        // through a result entity inherit that entity's similarity.
        let mut unit_similarity: FxHashMap<u64, f32> = FxHashMap::default();
        for (&entity_id, &entity_similarity) in &result_entity_ids {
            if let Some(entity) = state.entities.get(&entity_id) {
                for &unit_id in &entity.text_unit_ids {
                    if !state.text_units.contains_key(&unit_id) {
                        continue;
                    }
                    unit_similarity
                        .entry(unit_id)
                        .and_modify(|best| *best = best.max(entity_similarity))
                        .or_insert(entity_similarity);
                }
            }
        }
        for &(unit_id, similarity) in &text_unit_seeds {
            unit_similarity.insert(unit_id, similarity);
        }

        let mut text_units: Vec<TextUnitHit> = unit_similarity
            .iter()
            .filter_map(|(&id, &similarity)| {
                state.text_units.get(&id).map(|unit| TextUnitHit {
                    id,
                    external_id: unit.external_id.clone(),
                    document_id: unit.document_id,
                    content: unit.content.clone(),
                    similarity,
                })
            })
            .collect();
        text_units.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        text_units.truncate(spec.max_text_units as usize);

        let mut communities: Vec<CommunityHit> = community_seeds
            .iter()
            .filter_map(|&(id, similarity)| {
                state.communities.get(&id).map(|community| CommunityHit {
                    id,
                    external_id: community.external_id.clone(),
                    title: community.title.clone(),
                    summary: community.summary.clone(),
                    level: community.level,
                    similarity,
                })
            })
            .collect();
        communities.truncate(spec.max_communities as usize);

        drop(state);
        session.touch();

        self.store_trace(QueryTrace {
            query_id,
            seeds,
            traversal,
        });

        let duration_micros = started.elapsed().as_micros() as u64;
        debug!(
            query_id,
            duration_micros,
            entities = entities.len(),
            relationships = relationships.len(),
            "query complete"
        );

        Ok(QueryResult {
            query_id,
            entities,
            relationships,
            text_units,
            communities,
            duration_micros,
            vectors_searched,
            edges_scanned,
        })
    }
}

impl Engine {
    /// Run a hybrid query against an existing session.
    pub fn query(&self, session_id: &str, spec: QuerySpec) -> Result<QueryResult> {
        let session = self.session(session_id)?;
        self.planner().run(&session, spec, self.dimension())
    }

    /// Fetch the trace of an earlier query.
    pub fn explain(&self, query_id: u64) -> Result<QueryTrace> {
        self.planner().explain(query_id)
    }
}
