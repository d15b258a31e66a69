//! Durability subsystem for gibram.
//!
//! Four cooperating pieces:
//!
//! - **wal**: append-only segmented log with per-record xxHash64 checksums
//! - **snapshot**: `GRAM`-framed, gzip-compressed section files written
//!   atomically via temp-file + rename
//! - **backup**: a two-phase-commit coordinator that makes a snapshot
//!   visible iff its LSN is durable in the WAL
//! - **recovery**: picks the newest snapshot plus the WAL tail and drives
//!   restore + replay

pub mod backup;
pub mod recovery;
pub mod snapshot;
pub mod wal;

pub use backup::{BackupCoordinator, BackupState};
pub use recovery::{
    snapshot_file_name, CleanupStats, RecoveryPlan, RecoveryPlanner, ReplayStats, VerifyReport,
};
pub use snapshot::{
    create_snapshot, SnapshotHeader, SnapshotReader, SnapshotWriter, SNAPSHOT_MAGIC,
    SNAPSHOT_VERSION,
};
pub use wal::{SyncMode, Wal, WalConfig, WalRecord, WalRecordType};
