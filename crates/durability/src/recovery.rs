//! Recovery planning and execution.
//!
//! A data directory holds `wal/` and `snapshots/`. Recovery picks the
//! newest snapshot (names embed a sortable `YYYYMMDD_HHMMSS` timestamp, so
//! lexicographic order is chronological), restores it, then replays every
//! WAL record at or after the snapshot's LSN in order.
//!
//! The planner also owns retention (`cleanup`) and offline verification
//! (`verify`).

use crate::snapshot::{read_header, SnapshotReader};
use crate::wal::{self, WalRecord};
use chrono::{DateTime, Utc};
use gibram_core::Result;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Extension of snapshot files.
pub const SNAPSHOT_EXTENSION: &str = "gibram";

/// File name for a snapshot taken at `at`: `<prefix>_<YYYYMMDD_HHMMSS>.gibram`.
pub fn snapshot_file_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{prefix}_{}.{SNAPSHOT_EXTENSION}", at.format("%Y%m%d_%H%M%S"))
}

/// What a recovery run will do.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    /// Newest snapshot, if any.
    pub snapshot: Option<PathBuf>,
    /// First LSN to replay (the snapshot's LSN, or 0 without one).
    pub wal_start_lsn: u64,
    /// WAL segments on disk, in order.
    pub wal_segments: Vec<PathBuf>,
}

/// Statistics from a recovery run.
#[derive(Debug, Default, Clone)]
pub struct ReplayStats {
    pub restored_snapshot: Option<PathBuf>,
    pub records_replayed: usize,
    /// Highest LSN seen during replay (0 if nothing replayed).
    pub last_lsn: u64,
}

/// Statistics from a cleanup run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub snapshots_removed: usize,
    pub wal_files_removed: usize,
}

/// Results of offline verification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub snapshots_checked: usize,
    pub wal_segments_checked: usize,
    pub wal_records_checked: usize,
}

/// Plans and executes recovery from a data directory.
pub struct RecoveryPlanner {
    wal_dir: PathBuf,
    snapshot_dir: PathBuf,
}

impl RecoveryPlanner {
    pub fn new(data_dir: &Path) -> Self {
        RecoveryPlanner {
            wal_dir: data_dir.join("wal"),
            snapshot_dir: data_dir.join("snapshots"),
        }
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Snapshot files sorted ascending by name (oldest first).
    fn list_snapshots(&self) -> Result<Vec<PathBuf>> {
        let mut snapshots = Vec::new();
        if !self.snapshot_dir.exists() {
            return Ok(snapshots);
        }
        for entry in std::fs::read_dir(&self.snapshot_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SNAPSHOT_EXTENSION) {
                snapshots.push(path);
            }
        }
        snapshots.sort();
        Ok(snapshots)
    }

    /// Choose the newest snapshot and the WAL tail.
    pub fn plan(&self) -> Result<RecoveryPlan> {
        let snapshot = self.list_snapshots()?.pop();
        let wal_start_lsn = match &snapshot {
            Some(path) => read_header(path)?.lsn,
            None => 0,
        };
        let wal_segments = wal::list_segments(&self.wal_dir)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        Ok(RecoveryPlan {
            snapshot,
            wal_start_lsn,
            wal_segments,
        })
    }

    /// Restore the snapshot (if any), then replay the WAL tail in order.
    pub fn execute<R, P>(
        &self,
        plan: &RecoveryPlan,
        restore_fn: R,
        mut replay_fn: P,
    ) -> Result<ReplayStats>
    where
        R: FnOnce(&Path) -> Result<()>,
        P: FnMut(&WalRecord) -> Result<()>,
    {
        let mut stats = ReplayStats::default();

        if let Some(snapshot) = &plan.snapshot {
            info!(path = %snapshot.display(), lsn = plan.wal_start_lsn, "restoring snapshot");
            restore_fn(snapshot)?;
            stats.restored_snapshot = Some(snapshot.clone());
        }

        for segment in &plan.wal_segments {
            for record in wal::read_segment(segment)? {
                if record.lsn < plan.wal_start_lsn {
                    continue;
                }
                replay_fn(&record)?;
                stats.records_replayed += 1;
                stats.last_lsn = stats.last_lsn.max(record.lsn);
            }
        }

        info!(
            records = stats.records_replayed,
            last_lsn = stats.last_lsn,
            "recovery complete"
        );
        Ok(stats)
    }

    /// Keep the newest `keep_snapshots` snapshots; remove WAL files whose
    /// mtime is older than `keep_wal_days` days.
    pub fn cleanup(&self, keep_snapshots: usize, keep_wal_days: u64) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();

        let mut snapshots = self.list_snapshots()?;
        // Oldest first; keep the tail.
        let excess = snapshots.len().saturating_sub(keep_snapshots);
        for path in snapshots.drain(..excess) {
            std::fs::remove_file(&path)?;
            stats.snapshots_removed += 1;
            info!(path = %path.display(), "snapshot pruned");
        }

        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(keep_wal_days * 24 * 60 * 60));
        if let Some(cutoff) = cutoff {
            for (_, path) in wal::list_segments(&self.wal_dir)? {
                let mtime = std::fs::metadata(&path)?.modified()?;
                if mtime < cutoff {
                    std::fs::remove_file(&path)?;
                    stats.wal_files_removed += 1;
                    info!(path = %path.display(), "WAL segment pruned");
                }
            }
        }

        Ok(stats)
    }

    /// Open every snapshot header and scan every WAL segment end to end.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();

        for path in self.list_snapshots()? {
            let mut reader = SnapshotReader::open(&path)?;
            while reader.next_section()?.is_some() {}
            report.snapshots_checked += 1;
        }

        for (_, path) in wal::list_segments(&self.wal_dir)? {
            let records = wal::read_segment(&path)?;
            report.wal_records_checked += records.len();
            report.wal_segments_checked += 1;
        }

        if report.snapshots_checked == 0 && report.wal_segments_checked == 0 {
            warn!("nothing to verify");
        }
        Ok(report)
    }
}
