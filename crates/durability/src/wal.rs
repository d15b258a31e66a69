//! Write-ahead log.
//!
//! Segments are named `wal_NNNNNNNN.log` with a zero-padded 8-digit
//! sequence number; the active segment rotates once it passes the
//! configured soft cap (checked after each append).
//!
//! # Record layout (big-endian)
//!
//! ```text
//! ┌─────────┬────────────────────┬─────────┬─────────────┬─────┬──────────────┬──────┬──────────────┐
//! │ LSN u64 │ timestamp-nanos u64│ type u8 │ key len u32 │ key │ data len u32 │ data │ checksum u64 │
//! └─────────┴────────────────────┴─────────┴─────────────┴─────┴──────────────┴──────┴──────────────┘
//! ```
//!
//! The checksum is xxHash64 over (LSN, timestamp, type byte, key, data).
//! Readers tolerate a partial trailing record (a crash mid-append) by
//! stopping cleanly at it; a checksum mismatch on a complete record is
//! corruption and stops replay with an error.

use byteorder::{BigEndian, ByteOrder};
use gibram_core::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use xxhash_rust::xxh64::Xxh64;

/// Default soft cap on the active segment: 64 MiB.
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Hard cap on a single key or payload, applied when reading.
const MAX_FIELD_LEN: u32 = 256 * 1024 * 1024;

/// Fixed bytes before the variable-length fields: lsn + ts + type + key len.
const RECORD_FIXED_PREFIX: usize = 8 + 8 + 1 + 4;

/// WAL record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalRecordType {
    Insert = 1,
    Update = 2,
    Delete = 3,
    Checkpoint = 4,
}

impl WalRecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(WalRecordType::Insert),
            2 => Some(WalRecordType::Update),
            3 => Some(WalRecordType::Delete),
            4 => Some(WalRecordType::Checkpoint),
            _ => None,
        }
    }
}

/// A single WAL record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub lsn: u64,
    pub timestamp_nanos: u64,
    pub record_type: WalRecordType,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

impl WalRecord {
    fn checksum(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        hasher.update(&self.lsn.to_be_bytes());
        hasher.update(&self.timestamp_nanos.to_be_bytes());
        hasher.update(&[self.record_type as u8]);
        hasher.update(&self.key);
        hasher.update(&self.data);
        hasher.digest()
    }

    /// Serialize for appending.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(RECORD_FIXED_PREFIX + self.key.len() + 4 + self.data.len() + 8);
        buf.extend_from_slice(&self.lsn.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_nanos.to_be_bytes());
        buf.push(self.record_type as u8);
        buf.extend_from_slice(&(self.key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&self.checksum().to_be_bytes());
        buf
    }

    /// Parse one record from `buf`.
    ///
    /// Returns `Ok(Some((record, consumed)))` on success and `Ok(None)` if
    /// `buf` holds only a partial trailing record.
    pub fn parse(buf: &[u8]) -> Result<Option<(WalRecord, usize)>> {
        if buf.len() < RECORD_FIXED_PREFIX {
            return Ok(None);
        }
        let lsn = BigEndian::read_u64(&buf[0..8]);
        let timestamp_nanos = BigEndian::read_u64(&buf[8..16]);
        let type_byte = buf[16];
        let record_type = WalRecordType::from_u8(type_byte).ok_or_else(|| {
            Error::Corruption(format!("unknown WAL record type {type_byte} at LSN {lsn}"))
        })?;
        let key_len = BigEndian::read_u32(&buf[17..21]);
        if key_len > MAX_FIELD_LEN {
            return Err(Error::Corruption(format!(
                "WAL record at LSN {lsn} declares key length {key_len}"
            )));
        }

        let mut offset = RECORD_FIXED_PREFIX;
        if buf.len() < offset + key_len as usize + 4 {
            return Ok(None);
        }
        let key = buf[offset..offset + key_len as usize].to_vec();
        offset += key_len as usize;

        let data_len = BigEndian::read_u32(&buf[offset..offset + 4]);
        if data_len > MAX_FIELD_LEN {
            return Err(Error::Corruption(format!(
                "WAL record at LSN {lsn} declares data length {data_len}"
            )));
        }
        offset += 4;
        if buf.len() < offset + data_len as usize + 8 {
            return Ok(None);
        }
        let data = buf[offset..offset + data_len as usize].to_vec();
        offset += data_len as usize;

        let stored_checksum = BigEndian::read_u64(&buf[offset..offset + 8]);
        offset += 8;

        let record = WalRecord {
            lsn,
            timestamp_nanos,
            record_type,
            key,
            data,
        };
        let computed = record.checksum();
        if computed != stored_checksum {
            return Err(Error::Corruption(format!(
                "WAL checksum mismatch at LSN {lsn}: stored {stored_checksum:016x}, computed {computed:016x}"
            )));
        }

        Ok(Some((record, offset)))
    }
}

/// When appends hit the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// fsync after every append.
    EveryWrite,
    /// Caller drives `sync()`.
    #[default]
    Periodic,
    /// Leave flushing to the OS.
    Never,
}

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Soft cap on the active segment; rotation is checked after each append.
    pub segment_size: u64,
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::Periodic,
        }
    }
}

impl WalConfig {
    /// Small segments for fast rotation in tests.
    pub fn for_testing() -> Self {
        WalConfig {
            segment_size: 16 * 1024,
            sync_mode: SyncMode::Periodic,
        }
    }
}

struct WalInner {
    dir: PathBuf,
    file: File,
    segment_index: u64,
    segment_size: u64,
    next_lsn: u64,
    flushed_lsn: u64,
    config: WalConfig,
}

/// Append-only segmented write-ahead log.
///
/// A single mutex serializes every operation; LSNs are globally monotone
/// under it.
pub struct Wal {
    inner: Mutex<WalInner>,
}

/// Path of segment `index` under `dir`.
pub fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("wal_{index:08}.log"))
}

/// Segment index parsed from a file name like `wal_00000042.log`.
fn parse_segment_index(name: &str) -> Option<u64> {
    let stem = name.strip_prefix("wal_")?.strip_suffix(".log")?;
    if stem.len() != 8 {
        return None;
    }
    stem.parse().ok()
}

/// List `(index, path)` for every segment under `dir`, ascending.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(index) = parse_segment_index(&name) {
            segments.push((index, entry.path()));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

/// Read every complete record in a segment file.
///
/// A partial trailing record is tolerated (logged and ignored); a checksum
/// mismatch or malformed record propagates as corruption.
pub fn read_segment(path: &Path) -> Result<Vec<WalRecord>> {
    let buf = std::fs::read(path)?;
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match WalRecord::parse(&buf[offset..])? {
            Some((record, consumed)) => {
                records.push(record);
                offset += consumed;
            }
            None => {
                warn!(
                    path = %path.display(),
                    trailing_bytes = buf.len() - offset,
                    "partial trailing WAL record, stopping"
                );
                break;
            }
        }
    }
    Ok(records)
}

impl Wal {
    /// Open (or create) the WAL under `dir`.
    ///
    /// Resumes the highest existing segment and recovers the next LSN from
    /// the newest record on disk.
    pub fn open(dir: &Path, config: WalConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let segments = list_segments(dir)?;

        let (segment_index, path) = match segments.last() {
            Some((index, path)) => (*index, path.clone()),
            None => (0, segment_path(dir, 0)),
        };

        // Recover the LSN watermark from the newest records on disk.
        let mut max_lsn = 0;
        for (_, segment) in segments.iter().rev() {
            let records = read_segment(segment)?;
            if let Some(last) = records.last() {
                max_lsn = last.lsn;
                break;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let segment_size = file.metadata()?.len();

        debug!(
            dir = %dir.display(),
            segment = segment_index,
            next_lsn = max_lsn + 1,
            "WAL opened"
        );

        Ok(Wal {
            inner: Mutex::new(WalInner {
                dir: dir.to_path_buf(),
                file,
                segment_index,
                segment_size,
                next_lsn: max_lsn + 1,
                flushed_lsn: max_lsn,
                config,
            }),
        })
    }

    /// Append a record, returning its LSN.
    pub fn append(
        &self,
        record_type: WalRecordType,
        key: &[u8],
        data: &[u8],
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        let timestamp_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let record = WalRecord {
            lsn,
            timestamp_nanos,
            record_type,
            key: key.to_vec(),
            data: data.to_vec(),
        };
        let bytes = record.to_bytes();
        inner.file.write_all(&bytes)?;
        inner.segment_size += bytes.len() as u64;
        inner.next_lsn += 1;

        if inner.config.sync_mode == SyncMode::EveryWrite {
            inner.file.sync_all()?;
            inner.flushed_lsn = lsn;
        }

        if inner.segment_size > inner.config.segment_size {
            Self::rotate_locked(&mut inner)?;
        }
        Ok(lsn)
    }

    /// fsync the active segment and advance the flushed watermark.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        inner.flushed_lsn = inner.next_lsn - 1;
        Ok(())
    }

    /// Close the active segment and open the next one.
    pub fn rotate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::rotate_locked(&mut inner)
    }

    fn rotate_locked(inner: &mut WalInner) -> Result<()> {
        inner.file.sync_all()?;
        inner.flushed_lsn = inner.next_lsn - 1;
        inner.segment_index += 1;
        let path = segment_path(&inner.dir, inner.segment_index);
        inner.file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        inner.segment_size = 0;
        debug!(segment = inner.segment_index, "WAL rotated");
        Ok(())
    }

    /// Delete closed segments whose every record is below `target_lsn`.
    ///
    /// The active segment is never touched. Returns the number of deleted
    /// segments.
    pub fn truncate_before(&self, target_lsn: u64) -> Result<usize> {
        let inner = self.inner.lock();
        let current = inner.segment_index;
        let dir = inner.dir.clone();
        drop(inner);

        let mut removed = 0;
        for (index, path) in list_segments(&dir)? {
            if index == current {
                continue;
            }
            let records = read_segment(&path)?;
            let max_lsn = records.last().map(|r| r.lsn).unwrap_or(0);
            if max_lsn < target_lsn {
                std::fs::remove_file(&path)?;
                removed += 1;
                debug!(segment = index, max_lsn, target_lsn, "WAL segment truncated");
            }
        }
        Ok(removed)
    }

    /// All records with LSN ≥ `from_lsn`, across segments in order.
    pub fn read_entries(&self, from_lsn: u64) -> Result<Vec<WalRecord>> {
        let dir = self.inner.lock().dir.clone();
        let mut entries = Vec::new();
        for (_, path) in list_segments(&dir)? {
            for record in read_segment(&path)? {
                if record.lsn >= from_lsn {
                    entries.push(record);
                }
            }
        }
        Ok(entries)
    }

    /// LSN of the most recently appended record (0 before any append).
    pub fn current_lsn(&self) -> u64 {
        self.inner.lock().next_lsn - 1
    }

    /// LSN through which appends are known durable.
    pub fn flushed_lsn(&self) -> u64 {
        self.inner.lock().flushed_lsn
    }

    /// Number of segment files on disk.
    pub fn segment_count(&self) -> Result<usize> {
        let dir = self.inner.lock().dir.clone();
        Ok(list_segments(&dir)?.len())
    }

    /// Total bytes across all segment files.
    pub fn total_size(&self) -> Result<u64> {
        let dir = self.inner.lock().dir.clone();
        let mut total = 0;
        for (_, path) in list_segments(&dir)? {
            total += std::fs::metadata(&path)?.len();
        }
        Ok(total)
    }

    /// The WAL directory.
    pub fn dir(&self) -> PathBuf {
        self.inner.lock().dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_wal(dir: &Path) -> Wal {
        Wal::open(dir, WalConfig::default()).unwrap()
    }

    #[test]
    fn test_append_assigns_monotone_lsns() {
        let dir = tempdir().unwrap();
        let wal = open_wal(dir.path());

        for expected in 1..=5u64 {
            let lsn = wal
                .append(WalRecordType::Insert, b"k", b"v")
                .unwrap();
            assert_eq!(lsn, expected);
        }
        assert_eq!(wal.current_lsn(), 5);
    }

    #[test]
    fn test_read_entries_in_order_with_checksums() {
        let dir = tempdir().unwrap();
        let wal = open_wal(dir.path());
        for i in 1..=1000u64 {
            let payload = format!("{{\"i\":{i}}}");
            wal.append(WalRecordType::Insert, b"seq", payload.as_bytes())
                .unwrap();
        }
        wal.sync().unwrap();
        drop(wal);

        let wal = open_wal(dir.path());
        let entries = wal.read_entries(0).unwrap();
        assert_eq!(entries.len(), 1000);
        for (i, record) in entries.iter().enumerate() {
            assert_eq!(record.lsn, i as u64 + 1);
            assert_eq!(record.data, format!("{{\"i\":{}}}", i + 1).into_bytes());
        }
    }

    #[test]
    fn test_reopen_resumes_lsn() {
        let dir = tempdir().unwrap();
        {
            let wal = open_wal(dir.path());
            wal.append(WalRecordType::Insert, b"a", b"1").unwrap();
            wal.append(WalRecordType::Update, b"a", b"2").unwrap();
            wal.sync().unwrap();
        }
        let wal = open_wal(dir.path());
        let lsn = wal.append(WalRecordType::Delete, b"a", b"").unwrap();
        assert_eq!(lsn, 3);
    }

    #[test]
    fn test_rotation_and_truncate_before() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), WalConfig::for_testing()).unwrap();
        for _ in 0..200 {
            wal.append(WalRecordType::Insert, b"key", &[0u8; 256]).unwrap();
        }
        assert!(wal.segment_count().unwrap() > 1);

        let boundary = wal.current_lsn();
        let removed = wal.truncate_before(boundary).unwrap();
        assert!(removed > 0);

        // Everything at or past the boundary survives.
        let entries = wal.read_entries(boundary).unwrap();
        assert!(!entries.is_empty());
        assert!(entries.iter().all(|r| r.lsn >= boundary));
    }

    #[test]
    fn test_partial_trailing_record_is_tolerated() {
        let dir = tempdir().unwrap();
        let wal = open_wal(dir.path());
        wal.append(WalRecordType::Insert, b"k", b"v1").unwrap();
        wal.append(WalRecordType::Insert, b"k", b"v2").unwrap();
        wal.sync().unwrap();
        drop(wal);

        // Chop bytes off the tail to simulate a crash mid-append.
        let path = segment_path(dir.path(), 0);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let records = read_segment(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, b"v1");
    }

    #[test]
    fn test_corrupted_record_stops_replay_with_error() {
        let dir = tempdir().unwrap();
        let wal = open_wal(dir.path());
        wal.append(WalRecordType::Insert, b"k", b"payload").unwrap();
        wal.sync().unwrap();
        drop(wal);

        let path = segment_path(dir.path(), 0);
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a byte inside the payload.
        let mid = bytes.len() - 12;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = read_segment(&path).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_sync_advances_flushed_lsn() {
        let dir = tempdir().unwrap();
        let wal = open_wal(dir.path());
        wal.append(WalRecordType::Insert, b"k", b"v").unwrap();
        assert_eq!(wal.flushed_lsn(), 0);
        wal.sync().unwrap();
        assert_eq!(wal.flushed_lsn(), 1);
    }

    #[test]
    fn test_every_write_mode_flushes_immediately() {
        let dir = tempdir().unwrap();
        let config = WalConfig {
            sync_mode: SyncMode::EveryWrite,
            ..WalConfig::default()
        };
        let wal = Wal::open(dir.path(), config).unwrap();
        wal.append(WalRecordType::Insert, b"k", b"v").unwrap();
        assert_eq!(wal.flushed_lsn(), 1);
    }
}
