//! Backup orchestration and recovery wiring.
//!
//! `BackupManager` sits between the wire server and the durability layer:
//! it owns the in-progress flag the backup commands observe, names the
//! snapshot files, and drives the two-phase-commit coordinator with the
//! engine's section writer. Background saves run on their own thread.

use crate::engine::Engine;
use chrono::Utc;
use gibram_core::{Error, Result};
use gibram_durability::backup::BackupCoordinator;
use gibram_durability::recovery::{snapshot_file_name, RecoveryPlanner, ReplayStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// What the backup subsystem is doing, for BACKUP_STATUS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStatus {
    pub in_progress: bool,
    /// "save", "bgsave" or "restore" while in progress.
    pub kind: Option<String>,
    pub started_at_secs: u64,
    pub last_save_secs: u64,
    pub last_path: Option<String>,
}

/// Run recovery from `data_dir` into `engine`.
///
/// Restores the newest snapshot (if any) and replays the WAL tail through
/// the engine's logged-op apply path.
pub fn run_recovery(engine: &Engine, data_dir: &Path) -> Result<ReplayStats> {
    let planner = RecoveryPlanner::new(data_dir);
    let plan = planner.plan()?;
    planner.execute(
        &plan,
        |snapshot_path| engine.restore_from_snapshot_file(snapshot_path),
        |record| engine.replay_record(record),
    )
}

/// Coordinates blocking and background backups over one engine.
pub struct BackupManager {
    engine: Arc<Engine>,
    coordinator: Arc<BackupCoordinator>,
    snapshot_dir: PathBuf,
    data_dir: PathBuf,
    prefix: String,
    status: Mutex<BackupStatus>,
}

impl BackupManager {
    pub fn new(
        engine: Arc<Engine>,
        coordinator: Arc<BackupCoordinator>,
        data_dir: &Path,
        prefix: &str,
    ) -> Self {
        BackupManager {
            engine,
            coordinator,
            snapshot_dir: data_dir.join("snapshots"),
            data_dir: data_dir.to_path_buf(),
            prefix: prefix.to_string(),
            status: Mutex::new(BackupStatus::default()),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> BackupStatus {
        self.status.lock().clone()
    }

    /// Unix seconds of the last successful save (0 if never).
    pub fn last_save_secs(&self) -> u64 {
        self.status.lock().last_save_secs
    }

    fn begin(&self, kind: &str) -> Result<()> {
        let mut status = self.status.lock();
        if status.in_progress {
            return Err(Error::State(format!(
                "backup already in progress ({})",
                status.kind.as_deref().unwrap_or("unknown")
            )));
        }
        status.in_progress = true;
        status.kind = Some(kind.to_string());
        status.started_at_secs = now_secs();
        Ok(())
    }

    fn end(&self, saved_path: Option<&Path>) {
        let mut status = self.status.lock();
        status.in_progress = false;
        status.kind = None;
        if let Some(path) = saved_path {
            status.last_save_secs = now_secs();
            status.last_path = Some(path.display().to_string());
        }
    }

    fn save_inner(&self) -> Result<PathBuf> {
        let path = self
            .snapshot_dir
            .join(snapshot_file_name(&self.prefix, Utc::now()));
        let engine = self.engine.clone();
        self.coordinator
            .execute_backup(&path, |writer| engine.write_snapshot_sections(writer))?;
        Ok(path)
    }

    /// Blocking save. Fails Stateful if any backup is already running.
    pub fn save(&self) -> Result<PathBuf> {
        self.begin("save")?;
        let result = self.save_inner();
        match &result {
            Ok(path) => {
                self.end(Some(path));
                info!(path = %path.display(), "save complete");
            }
            Err(e) => {
                self.end(None);
                error!(error = %e, "save failed");
            }
        }
        result
    }

    /// Background save: flips the in-progress flag and returns immediately.
    pub fn bgsave(self: &Arc<Self>) -> Result<()> {
        self.begin("bgsave")?;
        let manager = self.clone();
        std::thread::Builder::new()
            .name("bgsave".to_string())
            .spawn(move || {
                let result = manager.save_inner();
                match result {
                    Ok(path) => {
                        info!(path = %path.display(), "background save complete");
                        manager.end(Some(&path));
                    }
                    Err(e) => {
                        error!(error = %e, "background save failed");
                        manager.end(None);
                    }
                }
            })
            .map_err(|e| Error::State(format!("failed to spawn bgsave thread: {e}")))?;
        Ok(())
    }

    /// Background restore from the data directory's newest snapshot + WAL
    /// tail. Replaces engine state wholesale when it lands.
    pub fn bgrestore(self: &Arc<Self>) -> Result<()> {
        self.begin("restore")?;
        let manager = self.clone();
        std::thread::Builder::new()
            .name("bgrestore".to_string())
            .spawn(move || {
                match run_recovery(&manager.engine, &manager.data_dir) {
                    Ok(stats) => {
                        info!(records = stats.records_replayed, "background restore complete");
                    }
                    Err(e) => {
                        error!(error = %e, "background restore failed");
                    }
                }
                manager.end(None);
            })
            .map_err(|e| Error::State(format!("failed to spawn bgrestore thread: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::ops::LoggedOp;
    use gibram_durability::wal::{Wal, WalConfig};
    use gibram_index::IndexKind;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup(data_dir: &Path) -> (Arc<Engine>, Arc<BackupManager>) {
        let wal = Arc::new(Wal::open(&data_dir.join("wal"), WalConfig::default()).unwrap());
        let engine = Arc::new(Engine::with_wal(
            EngineConfig {
                dimension: 4,
                index_kind: IndexKind::BruteForce,
                sweep_interval: Duration::from_secs(60),
            },
            wal.clone(),
        ));
        let coordinator = Arc::new(BackupCoordinator::new(wal));
        let manager = Arc::new(BackupManager::new(
            engine.clone(),
            coordinator,
            data_dir,
            "engine",
        ));
        (engine, manager)
    }

    fn add_entity(engine: &Engine, title: &str) {
        engine
            .execute(LoggedOp::AddEntity {
                session: "s".into(),
                external_id: String::new(),
                title: title.into(),
                entity_type: "t".into(),
                description: String::new(),
                embedding: None,
            })
            .unwrap();
    }

    #[test]
    fn test_save_then_recover() {
        let dir = tempdir().unwrap();
        let (engine, manager) = setup(dir.path());
        for i in 0..5 {
            add_entity(&engine, &format!("entity-{i}"));
        }

        let path = manager.save().unwrap();
        assert!(path.exists());
        assert!(manager.last_save_secs() > 0);

        // Fresh engine, same data dir.
        let (engine2, _) = setup(dir.path());
        let stats = run_recovery(&engine2, dir.path()).unwrap();
        assert!(stats.restored_snapshot.is_some());
        assert_eq!(engine2.info().counts.entities, 5);
    }

    #[test]
    fn test_second_bgsave_while_running_fails() {
        let dir = tempdir().unwrap();
        let (_engine, manager) = setup(dir.path());

        manager.begin("bgsave").unwrap();
        let err = manager.bgsave().unwrap_err();
        assert!(matches!(err, Error::State(_)));
        manager.end(None);
        assert!(!manager.status().in_progress);
    }

    #[test]
    fn test_status_reflects_last_save() {
        let dir = tempdir().unwrap();
        let (engine, manager) = setup(dir.path());
        add_entity(&engine, "a");

        assert_eq!(manager.status().last_save_secs, 0);
        let path = manager.save().unwrap();
        let status = manager.status();
        assert!(!status.in_progress);
        assert_eq!(status.last_path.unwrap(), path.display().to_string());
    }
}
