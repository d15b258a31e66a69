//! Two-phase-commit backup coordination.
//!
//! A snapshot must be visible on disk iff the LSN recorded in its header
//! is durable in the WAL. The coordinator enforces that with a small state
//! machine:
//!
//! ```text
//! Idle ── prepare ──▶ Prepared ── commit ──▶ Committed ── reset ──▶ Idle
//!                        │
//!                        └───── abort ─────▶ Aborted ──── reset ──▶ Idle
//! ```
//!
//! `prepare` flushes the WAL and captures the flushed LSN as the
//! consistency point; `commit` writes the snapshot atomically at that LSN
//! and flushes again so the post-snapshot watermark is durable. Any commit
//! failure lands in Aborted with the snapshot file deleted best-effort.

use crate::snapshot::{create_snapshot, SnapshotWriter};
use crate::wal::Wal;
use gibram_core::{Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Coordinator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupState {
    #[default]
    Idle,
    Prepared,
    Committed,
    Aborted,
}

#[derive(Default)]
struct CoordinatorInner {
    state: BackupState,
    prepared_lsn: u64,
    snapshot_path: Option<PathBuf>,
}

/// Two-phase-commit coordinator over WAL + snapshot.
pub struct BackupCoordinator {
    wal: Arc<Wal>,
    inner: Mutex<CoordinatorInner>,
}

impl BackupCoordinator {
    pub fn new(wal: Arc<Wal>) -> Self {
        BackupCoordinator {
            wal,
            inner: Mutex::new(CoordinatorInner::default()),
        }
    }

    pub fn state(&self) -> BackupState {
        self.inner.lock().state
    }

    /// Flush the WAL and capture the consistency point.
    ///
    /// Only legal from Idle; returns the prepared LSN.
    pub fn prepare(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.state != BackupState::Idle {
            return Err(Error::State(format!(
                "backup prepare from {:?}, expected Idle",
                inner.state
            )));
        }
        self.wal.sync()?;
        let lsn = self.wal.flushed_lsn();
        inner.state = BackupState::Prepared;
        inner.prepared_lsn = lsn;
        inner.snapshot_path = None;
        info!(lsn, "backup prepared");
        Ok(lsn)
    }

    /// Write the snapshot at the prepared LSN.
    ///
    /// Only legal from Prepared. On success the WAL is flushed again and
    /// the state becomes Committed; on failure the state becomes Aborted
    /// and the snapshot file is deleted best-effort.
    pub fn commit<F>(&self, path: &Path, write_fn: F) -> Result<()>
    where
        F: FnOnce(&mut SnapshotWriter) -> Result<()>,
    {
        let mut inner = self.inner.lock();
        if inner.state != BackupState::Prepared {
            return Err(Error::State(format!(
                "backup commit from {:?}, expected Prepared",
                inner.state
            )));
        }
        let prepared_lsn = inner.prepared_lsn;

        let result = create_snapshot(path, prepared_lsn, write_fn).and_then(|()| self.wal.sync());
        match result {
            Ok(()) => {
                inner.state = BackupState::Committed;
                inner.snapshot_path = Some(path.to_path_buf());
                info!(path = %path.display(), lsn = prepared_lsn, "backup committed");
                Ok(())
            }
            Err(e) => {
                inner.state = BackupState::Aborted;
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                warn!(path = %path.display(), error = %e, "backup commit failed");
                Err(e)
            }
        }
    }

    /// Abandon a prepared backup.
    ///
    /// Any snapshot temp file is already unlinked by the writer; this only
    /// transitions the state machine.
    pub fn abort(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != BackupState::Prepared {
            return Err(Error::State(format!(
                "backup abort from {:?}, expected Prepared",
                inner.state
            )));
        }
        inner.snapshot_path = None;
        inner.state = BackupState::Aborted;
        Ok(())
    }

    /// Return to Idle after Committed or Aborted.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BackupState::Committed | BackupState::Aborted => {
                *inner = CoordinatorInner::default();
                Ok(())
            }
            state => Err(Error::State(format!(
                "backup reset from {state:?}, expected Committed or Aborted"
            ))),
        }
    }

    /// Run prepare + commit + reset, aborting and resetting on failure.
    ///
    /// Returns the prepared LSN on success.
    pub fn execute_backup<F>(&self, path: &Path, write_fn: F) -> Result<u64>
    where
        F: FnOnce(&mut SnapshotWriter) -> Result<()>,
    {
        let lsn = self.prepare()?;
        match self.commit(path, write_fn) {
            Ok(()) => {
                self.reset()?;
                Ok(lsn)
            }
            Err(e) => {
                // Commit already moved to Aborted; just clear the machine.
                let _ = self.reset();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{WalConfig, WalRecordType};
    use tempfile::tempdir;

    fn setup(dir: &Path) -> (Arc<Wal>, BackupCoordinator) {
        let wal = Arc::new(Wal::open(&dir.join("wal"), WalConfig::default()).unwrap());
        let coordinator = BackupCoordinator::new(wal.clone());
        (wal, coordinator)
    }

    #[test]
    fn test_successful_backup_cycle() {
        let dir = tempdir().unwrap();
        let (wal, coordinator) = setup(dir.path());
        wal.append(WalRecordType::Insert, b"k", b"v").unwrap();

        let path = dir.path().join("snapshots").join("s.gibram");
        let lsn = coordinator
            .execute_backup(&path, |writer| writer.write_section("data", b"payload"))
            .unwrap();

        assert_eq!(lsn, 1);
        assert!(path.exists());
        assert_eq!(coordinator.state(), BackupState::Idle);

        let header = crate::snapshot::read_header(&path).unwrap();
        assert_eq!(header.lsn, lsn);
    }

    #[test]
    fn test_commit_failure_leaves_no_snapshot() {
        let dir = tempdir().unwrap();
        let (wal, coordinator) = setup(dir.path());
        wal.append(WalRecordType::Insert, b"k", b"v").unwrap();

        let path = dir.path().join("snapshots").join("s.gibram");
        let err = coordinator
            .execute_backup(&path, |_| Err(Error::State("injected failure".to_string())))
            .unwrap_err();
        assert!(err.to_string().contains("injected"));
        assert!(!path.exists());
        assert_eq!(coordinator.state(), BackupState::Idle);
    }

    #[test]
    fn test_state_machine_rejects_wrong_transitions() {
        let dir = tempdir().unwrap();
        let (_wal, coordinator) = setup(dir.path());
        let path = dir.path().join("s.gibram");

        // Commit without prepare.
        assert!(coordinator
            .commit(&path, |w| w.write_section("x", b""))
            .is_err());
        // Abort without prepare.
        assert!(coordinator.abort().is_err());
        // Reset from Idle.
        assert!(coordinator.reset().is_err());

        // Prepare twice.
        coordinator.prepare().unwrap();
        assert!(coordinator.prepare().is_err());

        coordinator.abort().unwrap();
        assert_eq!(coordinator.state(), BackupState::Aborted);
        coordinator.reset().unwrap();
        assert_eq!(coordinator.state(), BackupState::Idle);
    }

    #[test]
    fn test_prepared_lsn_is_flushed_lsn() {
        let dir = tempdir().unwrap();
        let (wal, coordinator) = setup(dir.path());
        for _ in 0..10 {
            wal.append(WalRecordType::Insert, b"k", b"v").unwrap();
        }
        let lsn = coordinator.prepare().unwrap();
        assert_eq!(lsn, 10);
        assert_eq!(wal.flushed_lsn(), 10);
        coordinator.abort().unwrap();
    }
}
