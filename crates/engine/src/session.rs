//! Per-session store.
//!
//! A session owns five typed tables (documents, text units, entities,
//! relationships, communities), the secondary maps that make them
//! addressable by external ID / title / endpoint pair, entity adjacency,
//! and three vector indices (text unit, entity, community).
//!
//! One reader/writer lock guards the whole session; each vector index sits
//! behind its own lock nested inside. The session lock is always taken
//! first and released last.
//!
//! ## Referential rules
//!
//! - text-unit ↔ entity links are symmetric: the entity's referencing set
//!   contains the text unit iff the text unit's entity set contains the
//!   entity
//! - a record carries an embedding iff the matching index contains its ID;
//!   an index failure rolls the primary insert back
//! - deletes do not cascade: a relationship whose endpoint was deleted
//!   stays in its table but is invisible to expansion and neighbor listing

use gibram_core::{
    canonical_title, limits, Community, Document, Entity, Error, IdCounters, IdGenerator,
    RecordKind, Relationship, Result, TextUnit,
};
use gibram_index::{IndexKind, VectorIndex};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Record counts for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    pub documents: usize,
    pub text_units: usize,
    pub entities: usize,
    pub relationships: usize,
    pub communities: usize,
    pub indexed_vectors: usize,
}

/// Everything a session owns, guarded by the session lock.
pub(crate) struct SessionState {
    pub(crate) ids: IdGenerator,

    pub(crate) documents: FxHashMap<u64, Document>,
    pub(crate) documents_by_external: FxHashMap<String, u64>,
    pub(crate) documents_by_filename: FxHashMap<String, u64>,

    pub(crate) text_units: FxHashMap<u64, TextUnit>,
    pub(crate) text_units_by_external: FxHashMap<String, u64>,

    pub(crate) entities: FxHashMap<u64, Entity>,
    pub(crate) entities_by_external: FxHashMap<String, u64>,
    pub(crate) entities_by_title: FxHashMap<String, u64>,

    pub(crate) relationships: FxHashMap<u64, Relationship>,
    pub(crate) relationships_by_external: FxHashMap<String, u64>,
    pub(crate) relationships_by_pair: FxHashMap<(u64, u64), u64>,

    pub(crate) communities: FxHashMap<u64, Community>,
    pub(crate) communities_by_external: FxHashMap<String, u64>,

    /// entity ID -> relationship IDs leaving / entering it
    pub(crate) outgoing: FxHashMap<u64, Vec<u64>>,
    pub(crate) incoming: FxHashMap<u64, Vec<u64>>,

    pub(crate) text_unit_index: RwLock<Box<dyn VectorIndex>>,
    pub(crate) entity_index: RwLock<Box<dyn VectorIndex>>,
    pub(crate) community_index: RwLock<Box<dyn VectorIndex>>,
}

impl SessionState {
    fn new(dimension: usize, index_kind: IndexKind) -> Self {
        SessionState {
            ids: IdGenerator::new(),
            documents: FxHashMap::default(),
            documents_by_external: FxHashMap::default(),
            documents_by_filename: FxHashMap::default(),
            text_units: FxHashMap::default(),
            text_units_by_external: FxHashMap::default(),
            entities: FxHashMap::default(),
            entities_by_external: FxHashMap::default(),
            entities_by_title: FxHashMap::default(),
            relationships: FxHashMap::default(),
            relationships_by_external: FxHashMap::default(),
            relationships_by_pair: FxHashMap::default(),
            communities: FxHashMap::default(),
            communities_by_external: FxHashMap::default(),
            outgoing: FxHashMap::default(),
            incoming: FxHashMap::default(),
            text_unit_index: RwLock::new(index_kind.create(dimension)),
            entity_index: RwLock::new(index_kind.create(dimension)),
            community_index: RwLock::new(index_kind.create(dimension)),
        }
    }
}

/// Deep-copyable image of a session, as carried in engine snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub created_at_secs: u64,
    pub last_access_secs: u64,
    pub ttl_secs: u64,
    pub idle_ttl_secs: u64,
    pub counters: IdCounters,
    pub documents: Vec<Document>,
    pub text_units: Vec<TextUnit>,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub communities: Vec<Community>,
    pub text_unit_vectors: BTreeMap<u64, Vec<f32>>,
    pub entity_vectors: BTreeMap<u64, Vec<f32>>,
    pub community_vectors: BTreeMap<u64, Vec<f32>>,
}

/// One session: metadata plus locked state.
pub struct SessionStore {
    id: String,
    dimension: usize,
    index_kind: IndexKind,
    created_at_secs: u64,
    last_access_secs: AtomicU64,
    ttl_secs: AtomicU64,
    idle_ttl_secs: AtomicU64,
    /// Serializes logged mutations so WAL order equals apply order.
    pub(crate) op_lock: Mutex<()>,
    state: RwLock<SessionState>,
}

impl SessionStore {
    pub fn new(id: String, dimension: usize, index_kind: IndexKind) -> Self {
        let now = now_secs();
        SessionStore {
            id,
            dimension,
            index_kind,
            created_at_secs: now,
            last_access_secs: AtomicU64::new(now),
            ttl_secs: AtomicU64::new(0),
            idle_ttl_secs: AtomicU64::new(0),
            op_lock: Mutex::new(()),
            state: RwLock::new(SessionState::new(dimension, index_kind)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn created_at_secs(&self) -> u64 {
        self.created_at_secs
    }

    pub fn last_access_secs(&self) -> u64 {
        self.last_access_secs.load(Ordering::Relaxed)
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs.load(Ordering::Relaxed)
    }

    pub fn idle_ttl_secs(&self) -> u64 {
        self.idle_ttl_secs.load(Ordering::Relaxed)
    }

    /// Refresh the last-access watermark.
    pub fn touch(&self) {
        self.last_access_secs.store(now_secs(), Ordering::Relaxed);
    }

    /// Set absolute and idle TTLs (0 = none).
    pub fn set_ttl(&self, ttl_secs: u64, idle_ttl_secs: u64) {
        self.ttl_secs.store(ttl_secs, Ordering::Relaxed);
        self.idle_ttl_secs.store(idle_ttl_secs, Ordering::Relaxed);
        self.touch();
    }

    /// Whether either TTL has lapsed at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        let ttl = self.ttl_secs();
        if ttl > 0 && self.created_at_secs + ttl < now {
            return true;
        }
        let idle = self.idle_ttl_secs();
        idle > 0 && self.last_access_secs() + idle < now
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read()
    }

    // ========================================================================
    // Add operations
    // ========================================================================

    pub fn add_document(&self, external_id: &str, filename: &str) -> Result<u64> {
        let mut state = self.state.write();
        if state.documents_by_external.contains_key(external_id) {
            return Err(Error::Conflict(format!(
                "document external id {external_id:?} already in use"
            )));
        }
        let id = state.ids.next(RecordKind::Document);
        state.documents.insert(
            id,
            Document {
                id,
                external_id: external_id.to_string(),
                filename: filename.to_string(),
            },
        );
        state
            .documents_by_external
            .insert(external_id.to_string(), id);
        state
            .documents_by_filename
            .insert(filename.to_string(), id);
        drop(state);
        self.touch();
        Ok(id)
    }

    pub fn add_text_unit(
        &self,
        external_id: &str,
        document_id: u64,
        content: &str,
        embedding: Option<Vec<f32>>,
        token_count: u32,
    ) -> Result<u64> {
        let mut state = self.state.write();
        if state.text_units_by_external.contains_key(external_id) {
            return Err(Error::Conflict(format!(
                "text unit external id {external_id:?} already in use"
            )));
        }
        if !state.documents.contains_key(&document_id) {
            return Err(Error::NotFound(format!("document {document_id}")));
        }
        let id = state.ids.next(RecordKind::TextUnit);
        state.text_units.insert(
            id,
            TextUnit {
                id,
                external_id: external_id.to_string(),
                document_id,
                content: content.to_string(),
                token_count,
                entity_ids: Default::default(),
                embedding: embedding.clone(),
            },
        );
        state
            .text_units_by_external
            .insert(external_id.to_string(), id);

        if let Some(vector) = embedding {
            let inserted = state.text_unit_index.write().add(id, vector);
            if let Err(e) = inserted {
                // Roll back the primary insert.
                state.text_units.remove(&id);
                state.text_units_by_external.remove(external_id);
                return Err(e);
            }
        }
        drop(state);
        self.touch();
        Ok(id)
    }

    pub fn add_entity(
        &self,
        external_id: &str,
        title: &str,
        entity_type: &str,
        description: &str,
        embedding: Option<Vec<f32>>,
    ) -> Result<u64> {
        let title = canonical_title(title);
        let mut state = self.state.write();
        if state.entities_by_title.contains_key(&title) {
            return Err(Error::Conflict(format!(
                "entity title {title:?} already in use"
            )));
        }
        if !external_id.is_empty() && state.entities_by_external.contains_key(external_id) {
            return Err(Error::Conflict(format!(
                "entity external id {external_id:?} already in use"
            )));
        }
        let id = state.ids.next(RecordKind::Entity);
        state.entities.insert(
            id,
            Entity {
                id,
                external_id: external_id.to_string(),
                title: title.clone(),
                entity_type: entity_type.to_string(),
                description: description.to_string(),
                text_unit_ids: Default::default(),
                embedding: embedding.clone(),
            },
        );
        if !external_id.is_empty() {
            state
                .entities_by_external
                .insert(external_id.to_string(), id);
        }
        state.entities_by_title.insert(title.clone(), id);

        if let Some(vector) = embedding {
            let inserted = state.entity_index.write().add(id, vector);
            if let Err(e) = inserted {
                state.entities.remove(&id);
                state.entities_by_external.remove(external_id);
                state.entities_by_title.remove(&title);
                return Err(e);
            }
        }
        drop(state);
        self.touch();
        Ok(id)
    }

    pub fn update_entity_description(
        &self,
        id: u64,
        description: &str,
        embedding: Option<Vec<f32>>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let Some(entity) = state.entities.get_mut(&id) else {
            return Err(Error::NotFound(format!("entity {id}")));
        };
        entity.description = description.to_string();
        let had_embedding = entity.embedding.is_some();

        if let Some(vector) = embedding {
            let mut index = state.entity_index.write();
            if had_embedding {
                index.remove(id)?;
            }
            match index.add(id, vector.clone()) {
                Ok(()) => {
                    drop(index);
                    if let Some(entity) = state.entities.get_mut(&id) {
                        entity.embedding = Some(vector);
                    }
                }
                Err(e) => {
                    // The stale entry is gone; the record must agree.
                    drop(index);
                    if let Some(entity) = state.entities.get_mut(&id) {
                        entity.embedding = None;
                    }
                    return Err(e);
                }
            }
        }
        drop(state);
        self.touch();
        Ok(())
    }

    pub fn add_relationship(
        &self,
        external_id: &str,
        source: u64,
        target: u64,
        rel_type: &str,
        description: &str,
        weight: f32,
    ) -> Result<u64> {
        let mut state = self.state.write();
        if !state.entities.contains_key(&source) {
            return Err(Error::NotFound(format!("source entity {source}")));
        }
        if !state.entities.contains_key(&target) {
            return Err(Error::NotFound(format!("target entity {target}")));
        }
        if state.relationships_by_pair.contains_key(&(source, target)) {
            return Err(Error::Conflict(format!(
                "relationship ({source}, {target}) already exists"
            )));
        }
        if !external_id.is_empty() && state.relationships_by_external.contains_key(external_id) {
            return Err(Error::Conflict(format!(
                "relationship external id {external_id:?} already in use"
            )));
        }

        let weight = if weight == 0.0 { 1.0 } else { weight };
        let id = state.ids.next(RecordKind::Relationship);
        state.relationships.insert(
            id,
            Relationship {
                id,
                external_id: external_id.to_string(),
                source,
                target,
                rel_type: rel_type.to_string(),
                description: description.to_string(),
                weight,
            },
        );
        if !external_id.is_empty() {
            state
                .relationships_by_external
                .insert(external_id.to_string(), id);
        }
        state.relationships_by_pair.insert((source, target), id);
        state.outgoing.entry(source).or_default().push(id);
        state.incoming.entry(target).or_default().push(id);
        drop(state);
        self.touch();
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_community(
        &self,
        external_id: &str,
        title: &str,
        summary: &str,
        content: &str,
        level: u32,
        entity_ids: Vec<u64>,
        relationship_ids: Vec<u64>,
        embedding: Option<Vec<f32>>,
    ) -> Result<u64> {
        let mut state = self.state.write();
        if !external_id.is_empty() && state.communities_by_external.contains_key(external_id) {
            return Err(Error::Conflict(format!(
                "community external id {external_id:?} already in use"
            )));
        }
        let id = state.ids.next(RecordKind::Community);
        state.communities.insert(
            id,
            Community {
                id,
                external_id: external_id.to_string(),
                title: title.to_string(),
                summary: summary.to_string(),
                content: content.to_string(),
                level,
                entity_ids,
                relationship_ids,
                embedding: embedding.clone(),
            },
        );
        if !external_id.is_empty() {
            state
                .communities_by_external
                .insert(external_id.to_string(), id);
        }

        if let Some(vector) = embedding {
            let inserted = state.community_index.write().add(id, vector);
            if let Err(e) = inserted {
                state.communities.remove(&id);
                state.communities_by_external.remove(external_id);
                return Err(e);
            }
        }
        drop(state);
        self.touch();
        Ok(id)
    }

    /// Link a text unit and an entity, symmetrically. Idempotent.
    pub fn link_text_unit_to_entity(&self, text_unit_id: u64, entity_id: u64) -> Result<()> {
        let mut state = self.state.write();
        if !state.text_units.contains_key(&text_unit_id) {
            return Err(Error::NotFound(format!("text unit {text_unit_id}")));
        }
        if !state.entities.contains_key(&entity_id) {
            return Err(Error::NotFound(format!("entity {entity_id}")));
        }
        if let Some(unit) = state.text_units.get_mut(&text_unit_id) {
            unit.entity_ids.insert(entity_id);
        }
        if let Some(entity) = state.entities.get_mut(&entity_id) {
            entity.text_unit_ids.insert(text_unit_id);
        }
        drop(state);
        self.touch();
        Ok(())
    }

    // ========================================================================
    // Delete operations
    // ========================================================================

    pub fn delete_document(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        let Some(document) = state.documents.remove(&id) else {
            return Err(Error::NotFound(format!("document {id}")));
        };
        state.documents_by_external.remove(&document.external_id);
        state.documents_by_filename.remove(&document.filename);
        drop(state);
        self.touch();
        Ok(())
    }

    pub fn delete_text_unit(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        let Some(unit) = state.text_units.remove(&id) else {
            return Err(Error::NotFound(format!("text unit {id}")));
        };
        state.text_units_by_external.remove(&unit.external_id);
        for entity_id in &unit.entity_ids {
            if let Some(entity) = state.entities.get_mut(entity_id) {
                entity.text_unit_ids.remove(&id);
            }
        }
        if unit.embedding.is_some() {
            state.text_unit_index.write().remove(id)?;
        }
        drop(state);
        self.touch();
        Ok(())
    }

    pub fn delete_entity(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        let Some(entity) = state.entities.remove(&id) else {
            return Err(Error::NotFound(format!("entity {id}")));
        };
        if !entity.external_id.is_empty() {
            state.entities_by_external.remove(&entity.external_id);
        }
        state.entities_by_title.remove(&entity.title);
        for unit_id in &entity.text_unit_ids {
            if let Some(unit) = state.text_units.get_mut(unit_id) {
                unit.entity_ids.remove(&id);
            }
        }
        // Relationships referencing this entity are left in place; they
        // become dangling and query expansion skips them.
        state.outgoing.remove(&id);
        state.incoming.remove(&id);
        if entity.embedding.is_some() {
            state.entity_index.write().remove(id)?;
        }
        drop(state);
        self.touch();
        Ok(())
    }

    pub fn delete_relationship(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        let Some(relationship) = state.relationships.remove(&id) else {
            return Err(Error::NotFound(format!("relationship {id}")));
        };
        if !relationship.external_id.is_empty() {
            state
                .relationships_by_external
                .remove(&relationship.external_id);
        }
        state
            .relationships_by_pair
            .remove(&(relationship.source, relationship.target));
        if let Some(list) = state.outgoing.get_mut(&relationship.source) {
            list.retain(|&rid| rid != id);
        }
        if let Some(list) = state.incoming.get_mut(&relationship.target) {
            list.retain(|&rid| rid != id);
        }
        drop(state);
        self.touch();
        Ok(())
    }

    pub fn delete_community(&self, id: u64) -> Result<()> {
        let mut state = self.state.write();
        let Some(community) = state.communities.remove(&id) else {
            return Err(Error::NotFound(format!("community {id}")));
        };
        if !community.external_id.is_empty() {
            state
                .communities_by_external
                .remove(&community.external_id);
        }
        if community.embedding.is_some() {
            state.community_index.write().remove(id)?;
        }
        drop(state);
        self.touch();
        Ok(())
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn get_document(&self, id: u64) -> Option<Document> {
        let found = self.state.read().documents.get(&id).cloned();
        self.touch();
        found
    }

    pub fn get_document_by_external(&self, external_id: &str) -> Option<Document> {
        let state = self.state.read();
        let found = state
            .documents_by_external
            .get(external_id)
            .and_then(|id| state.documents.get(id))
            .cloned();
        drop(state);
        self.touch();
        found
    }

    pub fn get_text_unit(&self, id: u64) -> Option<TextUnit> {
        let found = self.state.read().text_units.get(&id).cloned();
        self.touch();
        found
    }

    pub fn get_text_unit_by_external(&self, external_id: &str) -> Option<TextUnit> {
        let state = self.state.read();
        let found = state
            .text_units_by_external
            .get(external_id)
            .and_then(|id| state.text_units.get(id))
            .cloned();
        drop(state);
        self.touch();
        found
    }

    pub fn get_entity(&self, id: u64) -> Option<Entity> {
        let found = self.state.read().entities.get(&id).cloned();
        self.touch();
        found
    }

    pub fn get_entity_by_external(&self, external_id: &str) -> Option<Entity> {
        let state = self.state.read();
        let found = state
            .entities_by_external
            .get(external_id)
            .and_then(|id| state.entities.get(id))
            .cloned();
        drop(state);
        self.touch();
        found
    }

    pub fn get_entity_by_title(&self, title: &str) -> Option<Entity> {
        let title = canonical_title(title);
        let state = self.state.read();
        let found = state
            .entities_by_title
            .get(&title)
            .and_then(|id| state.entities.get(id))
            .cloned();
        drop(state);
        self.touch();
        found
    }

    pub fn get_relationship(&self, id: u64) -> Option<Relationship> {
        let found = self.state.read().relationships.get(&id).cloned();
        self.touch();
        found
    }

    pub fn get_relationship_between(&self, source: u64, target: u64) -> Option<Relationship> {
        let state = self.state.read();
        let found = state
            .relationships_by_pair
            .get(&(source, target))
            .and_then(|id| state.relationships.get(id))
            .cloned();
        drop(state);
        self.touch();
        found
    }

    pub fn get_community(&self, id: u64) -> Option<Community> {
        let found = self.state.read().communities.get(&id).cloned();
        self.touch();
        found
    }

    pub fn get_community_by_external(&self, external_id: &str) -> Option<Community> {
        let state = self.state.read();
        let found = state
            .communities_by_external
            .get(external_id)
            .and_then(|id| state.communities.get(id))
            .cloned();
        drop(state);
        self.touch();
        found
    }

    /// Entities with ID > `after_id`, ascending, up to `limit`.
    ///
    /// Returns `(records, next_cursor)`; the cursor is the last returned
    /// ID when more remain, 0 otherwise.
    pub fn list_entities(&self, after_id: u64, limit: u32) -> (Vec<Entity>, u64) {
        let limit = limits::clamp_list_limit(limit) as usize;
        let state = self.state.read();
        let mut ids: Vec<u64> = state
            .entities
            .keys()
            .copied()
            .filter(|&id| id > after_id)
            .collect();
        ids.sort_unstable();
        let more = ids.len() > limit;
        ids.truncate(limit);
        let next_cursor = if more { ids.last().copied().unwrap_or(0) } else { 0 };
        let records = ids
            .iter()
            .filter_map(|id| state.entities.get(id))
            .cloned()
            .collect();
        drop(state);
        self.touch();
        (records, next_cursor)
    }

    /// Relationships with ID > `after_id`, ascending, up to `limit`.
    pub fn list_relationships(&self, after_id: u64, limit: u32) -> (Vec<Relationship>, u64) {
        let limit = limits::clamp_list_limit(limit) as usize;
        let state = self.state.read();
        let mut ids: Vec<u64> = state
            .relationships
            .keys()
            .copied()
            .filter(|&id| id > after_id)
            .collect();
        ids.sort_unstable();
        let more = ids.len() > limit;
        ids.truncate(limit);
        let next_cursor = if more { ids.last().copied().unwrap_or(0) } else { 0 };
        let records = ids
            .iter()
            .filter_map(|id| state.relationships.get(id))
            .cloned()
            .collect();
        drop(state);
        self.touch();
        (records, next_cursor)
    }

    /// De-duplicated neighbor entity IDs of `entity_id`, via outgoing
    /// targets and incoming sources. Dangling endpoints are skipped.
    pub fn get_neighbors(&self, entity_id: u64) -> Result<Vec<u64>> {
        let state = self.state.read();
        if !state.entities.contains_key(&entity_id) {
            return Err(Error::NotFound(format!("entity {entity_id}")));
        }
        let mut neighbors = Vec::new();
        let mut push = |id: u64| {
            if state.entities.contains_key(&id) && !neighbors.contains(&id) {
                neighbors.push(id);
            }
        };
        for rel_id in state.outgoing.get(&entity_id).into_iter().flatten() {
            if let Some(rel) = state.relationships.get(rel_id) {
                push(rel.target);
            }
        }
        for rel_id in state.incoming.get(&entity_id).into_iter().flatten() {
            if let Some(rel) = state.relationships.get(rel_id) {
                push(rel.source);
            }
        }
        drop(state);
        self.touch();
        Ok(neighbors)
    }

    /// Record counts plus total indexed vectors.
    pub fn counts(&self) -> SessionCounts {
        let state = self.state.read();
        let result = SessionCounts {
            documents: state.documents.len(),
            text_units: state.text_units.len(),
            entities: state.entities.len(),
            relationships: state.relationships.len(),
            communities: state.communities.len(),
            indexed_vectors: state.text_unit_index.read().count()
                + state.entity_index.read().count()
                + state.community_index.read().count(),
        };
        result
    }

    // ========================================================================
    // Snapshot / restore / clear
    // ========================================================================

    /// Deep copy of all records, counters and index vector maps.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read();
        let sorted_by_id = |mut ids: Vec<u64>| {
            ids.sort_unstable();
            ids
        };

        let document_ids = sorted_by_id(state.documents.keys().copied().collect());
        let text_unit_ids = sorted_by_id(state.text_units.keys().copied().collect());
        let entity_ids = sorted_by_id(state.entities.keys().copied().collect());
        let relationship_ids = sorted_by_id(state.relationships.keys().copied().collect());
        let community_ids = sorted_by_id(state.communities.keys().copied().collect());

        let result = SessionSnapshot {
            id: self.id.clone(),
            created_at_secs: self.created_at_secs,
            last_access_secs: self.last_access_secs(),
            ttl_secs: self.ttl_secs(),
            idle_ttl_secs: self.idle_ttl_secs(),
            counters: state.ids.counters(),
            documents: document_ids
                .iter()
                .filter_map(|id| state.documents.get(id))
                .cloned()
                .collect(),
            text_units: text_unit_ids
                .iter()
                .filter_map(|id| state.text_units.get(id))
                .cloned()
                .collect(),
            entities: entity_ids
                .iter()
                .filter_map(|id| state.entities.get(id))
                .cloned()
                .collect(),
            relationships: relationship_ids
                .iter()
                .filter_map(|id| state.relationships.get(id))
                .cloned()
                .collect(),
            communities: community_ids
                .iter()
                .filter_map(|id| state.communities.get(id))
                .cloned()
                .collect(),
            text_unit_vectors: state.text_unit_index.read().all_vectors(),
            entity_vectors: state.entity_index.read().all_vectors(),
            community_vectors: state.community_index.read().all_vectors(),
        };
        result
    }

    /// Build a session from a snapshot, rebuilding every secondary map,
    /// adjacency list and index.
    pub fn from_snapshot(
        snapshot: SessionSnapshot,
        dimension: usize,
        index_kind: IndexKind,
    ) -> Result<Self> {
        let store = SessionStore::new(snapshot.id.clone(), dimension, index_kind);
        store.restore_from_snapshot(snapshot)?;
        Ok(store)
    }

    /// Replace all state from a snapshot.
    pub fn restore_from_snapshot(&self, snapshot: SessionSnapshot) -> Result<()> {
        let mut state = self.state.write();
        *state = SessionState::new(self.dimension, self.index_kind);

        state.ids.restore(snapshot.counters);

        for document in snapshot.documents {
            state.ids.observe(RecordKind::Document, document.id);
            state
                .documents_by_external
                .insert(document.external_id.clone(), document.id);
            state
                .documents_by_filename
                .insert(document.filename.clone(), document.id);
            state.documents.insert(document.id, document);
        }
        for unit in snapshot.text_units {
            state.ids.observe(RecordKind::TextUnit, unit.id);
            state
                .text_units_by_external
                .insert(unit.external_id.clone(), unit.id);
            state.text_units.insert(unit.id, unit);
        }
        for entity in snapshot.entities {
            state.ids.observe(RecordKind::Entity, entity.id);
            if !entity.external_id.is_empty() {
                state
                    .entities_by_external
                    .insert(entity.external_id.clone(), entity.id);
            }
            state
                .entities_by_title
                .insert(entity.title.clone(), entity.id);
            state.entities.insert(entity.id, entity);
        }
        for relationship in snapshot.relationships {
            state.ids.observe(RecordKind::Relationship, relationship.id);
            if !relationship.external_id.is_empty() {
                state
                    .relationships_by_external
                    .insert(relationship.external_id.clone(), relationship.id);
            }
            state
                .relationships_by_pair
                .insert((relationship.source, relationship.target), relationship.id);
            state
                .outgoing
                .entry(relationship.source)
                .or_default()
                .push(relationship.id);
            state
                .incoming
                .entry(relationship.target)
                .or_default()
                .push(relationship.id);
            state.relationships.insert(relationship.id, relationship);
        }
        for community in snapshot.communities {
            state.ids.observe(RecordKind::Community, community.id);
            if !community.external_id.is_empty() {
                state
                    .communities_by_external
                    .insert(community.external_id.clone(), community.id);
            }
            state.communities.insert(community.id, community);
        }

        for (id, vector) in snapshot.text_unit_vectors {
            state.text_unit_index.write().add(id, vector)?;
        }
        for (id, vector) in snapshot.entity_vectors {
            state.entity_index.write().add(id, vector)?;
        }
        for (id, vector) in snapshot.community_vectors {
            state.community_index.write().add(id, vector)?;
        }

        drop(state);
        self.ttl_secs.store(snapshot.ttl_secs, Ordering::Relaxed);
        self.idle_ttl_secs
            .store(snapshot.idle_ttl_secs, Ordering::Relaxed);
        self.touch();
        debug!(session = %self.id, "session restored from snapshot");
        Ok(())
    }

    /// Drop all records, adjacency, indices and counters.
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = SessionState::new(self.dimension, self.index_kind);
        drop(state);
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new("s1".into(), 4, IndexKind::BruteForce)
    }

    fn unit_x() -> Option<Vec<f32>> {
        Some(vec![1.0, 0.0, 0.0, 0.0])
    }

    #[test]
    fn test_document_dedup_by_external_id() {
        let s = store();
        s.add_document("d1", "a.pdf").unwrap();
        let err = s.add_document("d1", "b.pdf").unwrap_err();
        assert!(err.is_conflict());
        assert!(s.get_document_by_external("d1").is_some());
    }

    #[test]
    fn test_entity_title_dedup_is_case_insensitive() {
        let s = store();
        s.add_entity("e1", "BANK", "org", "", None).unwrap();
        let err = s.add_entity("e2", " bank ", "org", "", None).unwrap_err();
        assert!(err.is_conflict());

        let found = s.get_entity_by_title("bank").unwrap();
        assert_eq!(found.title, "BANK");
        assert_eq!(found.external_id, "e1");
    }

    #[test]
    fn test_embedding_indexed_iff_present() {
        let s = store();
        let doc = s.add_document("d1", "a.pdf").unwrap();
        let with = s
            .add_text_unit("t1", doc, "hi", unit_x(), 1)
            .unwrap();
        let without = s.add_text_unit("t2", doc, "yo", None, 1).unwrap();

        let state = s.read_state();
        let index = state.text_unit_index.read();
        assert!(index.contains(with));
        assert!(!index.contains(without));
    }

    #[test]
    fn test_index_failure_rolls_back_primary() {
        let s = store();
        let doc = s.add_document("d1", "a.pdf").unwrap();
        let err = s
            .add_text_unit("t1", doc, "hi", Some(vec![1.0, 0.0]), 1)
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
        assert!(s.get_text_unit_by_external("t1").is_none());
        assert_eq!(s.counts().text_units, 0);
    }

    #[test]
    fn test_link_is_symmetric_and_idempotent() {
        let s = store();
        let doc = s.add_document("d1", "a.pdf").unwrap();
        let unit = s.add_text_unit("t1", doc, "hi", None, 1).unwrap();
        let entity = s.add_entity("e1", "alpha", "t", "", None).unwrap();

        s.link_text_unit_to_entity(unit, entity).unwrap();
        s.link_text_unit_to_entity(unit, entity).unwrap();

        let t = s.get_text_unit(unit).unwrap();
        let e = s.get_entity(entity).unwrap();
        assert!(t.entity_ids.contains(&entity));
        assert!(e.text_unit_ids.contains(&unit));
        assert_eq!(t.entity_ids.len(), 1);

        s.delete_text_unit(unit).unwrap();
        let e = s.get_entity(entity).unwrap();
        assert!(e.text_unit_ids.is_empty());
    }

    #[test]
    fn test_relationship_pair_unique_and_weight_coerced() {
        let s = store();
        let a = s.add_entity("", "a", "t", "", None).unwrap();
        let b = s.add_entity("", "b", "t", "", None).unwrap();

        let rel = s.add_relationship("", a, b, "knows", "", 0.0).unwrap();
        assert_eq!(s.get_relationship(rel).unwrap().weight, 1.0);

        let err = s.add_relationship("", a, b, "knows", "", 2.0).unwrap_err();
        assert!(err.is_conflict());

        // Reverse direction is a different pair.
        s.add_relationship("", b, a, "knows", "", 2.0).unwrap();
    }

    #[test]
    fn test_relationship_requires_existing_endpoints() {
        let s = store();
        let a = s.add_entity("", "a", "t", "", None).unwrap();
        let err = s.add_relationship("", a, 999, "knows", "", 1.0).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_entity_leaves_dangling_relationship() {
        let s = store();
        let a = s.add_entity("", "a", "t", "", None).unwrap();
        let b = s.add_entity("", "b", "t", "", None).unwrap();
        let c = s.add_entity("", "c", "t", "", None).unwrap();
        s.add_relationship("", a, b, "x", "", 1.0).unwrap();
        s.add_relationship("", c, b, "x", "", 1.0).unwrap();

        s.delete_entity(a).unwrap();

        // The relationship record survives but neighbor listing skips it.
        assert_eq!(s.counts().relationships, 2);
        let neighbors = s.get_neighbors(b).unwrap();
        assert_eq!(neighbors, vec![c]);

        // Title can be reused after delete.
        s.add_entity("", "a", "t", "", None).unwrap();
    }

    #[test]
    fn test_list_entities_pagination() {
        let s = store();
        for i in 0..25 {
            s.add_entity("", &format!("entity-{i}"), "t", "", None)
                .unwrap();
        }
        let (page, cursor) = s.list_entities(0, 10);
        assert_eq!(page.len(), 10);
        assert_eq!(cursor, page.last().unwrap().id);

        let (page2, cursor2) = s.list_entities(cursor, 10);
        assert_eq!(page2.len(), 10);
        assert!(page2.first().unwrap().id > cursor);

        let (page3, cursor3) = s.list_entities(cursor2, 10);
        assert_eq!(page3.len(), 5);
        assert_eq!(cursor3, 0);
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_everything() {
        let s = store();
        let doc = s.add_document("d1", "a.pdf").unwrap();
        let unit = s.add_text_unit("t1", doc, "hi", unit_x(), 1).unwrap();
        let e1 = s.add_entity("e1", "alpha", "t", "d", unit_x()).unwrap();
        let e2 = s.add_entity("e2", "beta", "t", "d", None).unwrap();
        s.add_relationship("r1", e1, e2, "knows", "", 0.5).unwrap();
        s.link_text_unit_to_entity(unit, e1).unwrap();
        s.add_community("c1", "cluster", "sum", "full", 0, vec![e1, e2], vec![], None)
            .unwrap();

        let snapshot = s.snapshot();
        let restored =
            SessionStore::from_snapshot(snapshot, 4, IndexKind::BruteForce).unwrap();

        assert_eq!(restored.counts(), s.counts());
        assert_eq!(
            restored.get_entity_by_title("alpha").unwrap().id,
            e1
        );
        assert_eq!(restored.get_neighbors(e1).unwrap(), vec![e2]);
        let t = restored.get_text_unit(unit).unwrap();
        assert!(t.entity_ids.contains(&e1));

        // Counters continue past the restored maximum.
        let next = restored.add_entity("", "gamma", "t", "", None).unwrap();
        assert!(next > e2);
    }

    #[test]
    fn test_clear_resets_counters() {
        let s = store();
        s.add_entity("", "a", "t", "", None).unwrap();
        s.clear();
        assert_eq!(s.counts(), SessionCounts::default());
        let id = s.add_entity("", "b", "t", "", None).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let s = store();
        assert!(!s.is_expired(now_secs() + 100_000));
        s.set_ttl(10, 0);
        assert!(s.is_expired(s.created_at_secs() + 11));
        s.set_ttl(0, 5);
        assert!(!s.is_expired(s.last_access_secs() + 4));
        assert!(s.is_expired(s.last_access_secs() + 6));
    }
}
