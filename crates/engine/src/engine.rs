//! Engine: the session registry and everything process-wide.
//!
//! Sessions are created lazily by mutations and fail reads with NotFound.
//! A background sweeper thread removes sessions whose absolute or idle TTL
//! has lapsed. All mutations funnel through `execute`, which appends the
//! logged op to the WAL (when one is attached) under the session's
//! operation lock before applying it; `replay_record` drives the identical
//! apply path during recovery.

use crate::ops::LoggedOp;
use crate::query::QueryPlanner;
use crate::session::{now_secs, SessionCounts, SessionSnapshot, SessionStore};
use dashmap::DashMap;
use gibram_core::{Error, Result};
use gibram_durability::snapshot::{SnapshotReader, SnapshotWriter};
use gibram_durability::wal::{Wal, WalRecord, WalRecordType};
use gibram_index::IndexKind;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Embedding dimension shared by every session.
    pub dimension: usize,
    /// Which index backend sessions build.
    pub index_kind: IndexKind,
    /// TTL sweeper period.
    pub sweep_interval: Duration,
}

impl EngineConfig {
    pub fn new(dimension: usize) -> Self {
        EngineConfig {
            dimension,
            index_kind: IndexKind::default(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Per-session metadata for LIST/INFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at_secs: u64,
    pub last_access_secs: u64,
    pub ttl_secs: u64,
    pub idle_ttl_secs: u64,
    pub counts: SessionCounts,
}

/// Aggregate counts across every session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineInfo {
    pub sessions: usize,
    pub dimension: usize,
    pub counts: SessionCounts,
}

/// What a logged operation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpOutcome {
    /// A record was created with this ID.
    Created(u64),
    /// The op succeeded without creating a record.
    Unit,
}

impl OpOutcome {
    pub fn id(&self) -> u64 {
        match self {
            OpOutcome::Created(id) => *id,
            OpOutcome::Unit => 0,
        }
    }
}

struct Sweeper {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: std::thread::JoinHandle<()>,
}

/// The engine.
pub struct Engine {
    config: EngineConfig,
    sessions: DashMap<String, Arc<SessionStore>>,
    wal: Option<Arc<Wal>>,
    planner: QueryPlanner,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Engine {
    /// An engine without durability (tests, ephemeral deployments).
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            config,
            sessions: DashMap::new(),
            wal: None,
            planner: QueryPlanner::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// An engine whose mutations are logged to `wal` before applying.
    pub fn with_wal(config: EngineConfig, wal: Arc<Wal>) -> Self {
        Engine {
            config,
            sessions: DashMap::new(),
            wal: Some(wal),
            planner: QueryPlanner::new(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn wal(&self) -> Option<&Arc<Wal>> {
        self.wal.as_ref()
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    /// Look up an existing session.
    pub fn session(&self, id: &str) -> Result<Arc<SessionStore>> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::session_not_found(id))
    }

    /// Look up a session, creating it with zero TTLs if missing.
    pub fn session_or_create(&self, id: &str) -> Arc<SessionStore> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(session = id, "session created");
                Arc::new(SessionStore::new(
                    id.to_string(),
                    self.config.dimension,
                    self.config.index_kind,
                ))
            })
            .value()
            .clone()
    }

    /// IDs of all live sessions.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Remove a session and tear down its state.
    pub fn remove_session(&self, id: &str) -> Result<()> {
        match self.sessions.remove(id) {
            Some((_, store)) => {
                // clear() waits for in-flight holders of the session lock.
                store.clear();
                info!(session = id, "session removed");
                Ok(())
            }
            None => Err(Error::session_not_found(id)),
        }
    }

    // ========================================================================
    // Logged mutations
    // ========================================================================

    /// Apply a mutation, WAL-first.
    pub fn execute(&self, op: LoggedOp) -> Result<OpOutcome> {
        if op.session().is_empty() {
            return Err(Error::Invalid("session id must not be empty".to_string()));
        }
        let session = self.session_or_create(op.session());
        let _op_guard = session.op_lock.lock();

        if let Some(wal) = &self.wal {
            let data = bincode::serialize(&op)
                .map_err(|e| Error::Invalid(format!("unencodable operation: {e}")))?;
            wal.append(op.record_type(), op.session().as_bytes(), &data)?;
        }
        self.apply(&session, op)
    }

    /// Re-apply a WAL record during recovery.
    ///
    /// Conflict and NotFound failures mean the op's effect is already in
    /// the restored snapshot (the snapshot LSN record itself) or was a
    /// deterministic failure on the live path; both are skipped.
    pub fn replay_record(&self, record: &WalRecord) -> Result<()> {
        if record.record_type == WalRecordType::Checkpoint {
            return Ok(());
        }
        let op: LoggedOp = bincode::deserialize(&record.data).map_err(|e| {
            Error::Corruption(format!("undecodable WAL payload at LSN {}: {e}", record.lsn))
        })?;
        let session = self.session_or_create(op.session());
        let _op_guard = session.op_lock.lock();
        match self.apply(&session, op) {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(lsn = record.lsn, error = %e, "replay skipped already-applied op");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn apply(&self, session: &Arc<SessionStore>, op: LoggedOp) -> Result<OpOutcome> {
        match op {
            LoggedOp::AddDocument {
                external_id,
                filename,
                ..
            } => session
                .add_document(&external_id, &filename)
                .map(OpOutcome::Created),
            LoggedOp::AddTextUnit {
                external_id,
                document_id,
                content,
                embedding,
                token_count,
                ..
            } => session
                .add_text_unit(&external_id, document_id, &content, embedding, token_count)
                .map(OpOutcome::Created),
            LoggedOp::AddEntity {
                external_id,
                title,
                entity_type,
                description,
                embedding,
                ..
            } => session
                .add_entity(&external_id, &title, &entity_type, &description, embedding)
                .map(OpOutcome::Created),
            LoggedOp::UpdateEntityDescription {
                id,
                description,
                embedding,
                ..
            } => session
                .update_entity_description(id, &description, embedding)
                .map(|()| OpOutcome::Unit),
            LoggedOp::AddRelationship {
                external_id,
                source,
                target,
                rel_type,
                description,
                weight,
                ..
            } => session
                .add_relationship(&external_id, source, target, &rel_type, &description, weight)
                .map(OpOutcome::Created),
            LoggedOp::AddCommunity {
                external_id,
                title,
                summary,
                content,
                level,
                entity_ids,
                relationship_ids,
                embedding,
                ..
            } => session
                .add_community(
                    &external_id,
                    &title,
                    &summary,
                    &content,
                    level,
                    entity_ids,
                    relationship_ids,
                    embedding,
                )
                .map(OpOutcome::Created),
            LoggedOp::LinkTextUnitToEntity {
                text_unit_id,
                entity_id,
                ..
            } => session
                .link_text_unit_to_entity(text_unit_id, entity_id)
                .map(|()| OpOutcome::Unit),
            LoggedOp::DeleteDocument { id, .. } => {
                session.delete_document(id).map(|()| OpOutcome::Unit)
            }
            LoggedOp::DeleteTextUnit { id, .. } => {
                session.delete_text_unit(id).map(|()| OpOutcome::Unit)
            }
            LoggedOp::DeleteEntity { id, .. } => {
                session.delete_entity(id).map(|()| OpOutcome::Unit)
            }
            LoggedOp::DeleteRelationship { id, .. } => {
                session.delete_relationship(id).map(|()| OpOutcome::Unit)
            }
            LoggedOp::DeleteCommunity { id, .. } => {
                session.delete_community(id).map(|()| OpOutcome::Unit)
            }
            LoggedOp::DeleteSession { session: id } => {
                self.remove_session(&id).map(|()| OpOutcome::Unit)
            }
            LoggedOp::SetSessionTtl {
                ttl_secs,
                idle_ttl_secs,
                ..
            } => {
                session.set_ttl(ttl_secs, idle_ttl_secs);
                Ok(OpOutcome::Unit)
            }
        }
    }

    // ========================================================================
    // Info
    // ========================================================================

    pub fn info(&self) -> EngineInfo {
        let mut info = EngineInfo {
            sessions: self.sessions.len(),
            dimension: self.config.dimension,
            counts: SessionCounts::default(),
        };
        for entry in self.sessions.iter() {
            let counts = entry.value().counts();
            info.counts.documents += counts.documents;
            info.counts.text_units += counts.text_units;
            info.counts.entities += counts.entities;
            info.counts.relationships += counts.relationships;
            info.counts.communities += counts.communities;
            info.counts.indexed_vectors += counts.indexed_vectors;
        }
        info
    }

    pub fn info_for_session(&self, id: &str) -> Result<SessionInfo> {
        let session = self.session(id)?;
        Ok(Self::session_info(&session))
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| Self::session_info(entry.value()))
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn session_info(session: &SessionStore) -> SessionInfo {
        SessionInfo {
            id: session.id().to_string(),
            created_at_secs: session.created_at_secs(),
            last_access_secs: session.last_access_secs(),
            ttl_secs: session.ttl_secs(),
            idle_ttl_secs: session.idle_ttl_secs(),
            counts: session.counts(),
        }
    }

    // ========================================================================
    // TTL sweeper
    // ========================================================================

    /// Remove every expired session. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = now_secs();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for id in expired {
            if let Some((_, store)) = self.sessions.remove(&id) {
                store.clear();
                removed += 1;
                info!(session = %id, "expired session swept");
            }
        }
        removed
    }

    /// Start the background sweeper thread. Idempotent.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = stop.clone();
        let engine: Weak<Engine> = Arc::downgrade(self);
        let interval = self.config.sweep_interval;

        let handle = std::thread::Builder::new()
            .name("session-sweeper".to_string())
            .spawn(move || loop {
                {
                    let (lock, condvar) = &*thread_stop;
                    let mut stopped = lock.lock();
                    if !*stopped {
                        condvar.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                match engine.upgrade() {
                    Some(engine) => {
                        engine.sweep_expired();
                    }
                    None => break,
                }
            })
            .expect("failed to spawn session sweeper");

        *slot = Some(Sweeper { stop, handle });
    }

    /// Stop and join the sweeper thread.
    pub fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            {
                let (lock, condvar) = &*sweeper.stop;
                *lock.lock() = true;
                condvar.notify_all();
            }
            // The sweeper itself may drop the last engine handle; a thread
            // cannot join itself.
            if sweeper.handle.thread().id() == std::thread::current().id() {
                return;
            }
            if sweeper.handle.join().is_err() {
                warn!("session sweeper panicked during shutdown");
            }
        }
    }

    // ========================================================================
    // Snapshot / restore
    // ========================================================================

    /// Emit one section per session into an open snapshot writer.
    pub fn write_snapshot_sections(&self, writer: &mut SnapshotWriter) -> Result<()> {
        for id in self.session_ids() {
            let Ok(session) = self.session(&id) else {
                continue;
            };
            let snapshot = session.snapshot();
            let data = bincode::serialize(&snapshot)
                .map_err(|e| Error::Invalid(format!("unencodable session snapshot: {e}")))?;
            writer.write_section(&format!("session:{id}"), &data)?;
        }
        Ok(())
    }

    /// Replace all engine state from a snapshot file.
    pub fn restore_from_snapshot_file(&self, path: &std::path::Path) -> Result<()> {
        let mut reader = SnapshotReader::open(path)?;
        self.sessions.clear();
        while let Some((name, data)) = reader.next_section()? {
            let Some(session_id) = name.strip_prefix("session:") else {
                warn!(section = %name, "skipping unknown snapshot section");
                continue;
            };
            let snapshot: SessionSnapshot = bincode::deserialize(&data).map_err(|e| {
                Error::Corruption(format!("undecodable snapshot section {name:?}: {e}"))
            })?;
            let store = SessionStore::from_snapshot(
                snapshot,
                self.config.dimension,
                self.config.index_kind,
            )?;
            self.sessions
                .insert(session_id.to_string(), Arc::new(store));
        }
        info!(sessions = self.sessions.len(), path = %path.display(), "engine restored");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig {
            dimension: 4,
            index_kind: IndexKind::BruteForce,
            sweep_interval: Duration::from_millis(20),
        }
    }

    fn add_entity_op(session: &str, title: &str) -> LoggedOp {
        LoggedOp::AddEntity {
            session: session.into(),
            external_id: String::new(),
            title: title.into(),
            entity_type: "t".into(),
            description: String::new(),
            embedding: None,
        }
    }

    #[test]
    fn test_lazy_creation_on_mutation_only() {
        let engine = Engine::new(test_config());
        assert!(engine.session("missing").is_err());

        engine.execute(add_entity_op("s1", "alpha")).unwrap();
        assert!(engine.session("s1").is_ok());
        assert_eq!(engine.info().sessions, 1);
    }

    #[test]
    fn test_empty_session_id_rejected() {
        let engine = Engine::new(test_config());
        let err = engine.execute(add_entity_op("", "alpha")).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn test_info_aggregates_across_sessions() {
        let engine = Engine::new(test_config());
        engine.execute(add_entity_op("a", "one")).unwrap();
        engine.execute(add_entity_op("a", "two")).unwrap();
        engine.execute(add_entity_op("b", "one")).unwrap();

        let info = engine.info();
        assert_eq!(info.sessions, 2);
        assert_eq!(info.counts.entities, 3);
        assert_eq!(info.dimension, 4);

        let a = engine.info_for_session("a").unwrap();
        assert_eq!(a.counts.entities, 2);
    }

    #[test]
    fn test_delete_session_op() {
        let engine = Engine::new(test_config());
        engine.execute(add_entity_op("s1", "alpha")).unwrap();
        engine
            .execute(LoggedOp::DeleteSession {
                session: "s1".into(),
            })
            .unwrap();
        assert!(engine.session("s1").is_err());
    }

    #[test]
    fn test_sweeper_removes_idle_sessions() {
        let engine = Arc::new(Engine::new(test_config()));
        engine.execute(add_entity_op("stale", "alpha")).unwrap();
        engine
            .execute(LoggedOp::SetSessionTtl {
                session: "stale".into(),
                ttl_secs: 0,
                idle_ttl_secs: 1,
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        engine.start_sweeper();
        std::thread::sleep(Duration::from_millis(200));
        assert!(engine.session("stale").is_err());
        engine.shutdown();
    }

    #[test]
    fn test_sweep_expired_direct() {
        let engine = Engine::new(test_config());
        engine.execute(add_entity_op("s", "alpha")).unwrap();
        engine
            .execute(LoggedOp::SetSessionTtl {
                session: "s".into(),
                ttl_secs: 0,
                idle_ttl_secs: 1,
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(engine.sweep_expired(), 1);
        assert_eq!(engine.info().sessions, 0);
    }
}
