//! Snapshot file format.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header, 64 bytes, uncompressed                               │
//! │   magic "GRAM" │ version u32 │ timestamp i64 │ LSN u64       │
//! │   checksum u32 │ flags u32   │ reserved [32]                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │ gzip stream of sections:                                     │
//! │   name len u32 │ name │ data len u64 │ data   (repeated)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers big-endian. The header checksum is CRC32 over the header
//! bytes with the checksum field zeroed.
//!
//! Writes go to `<path>.tmp` and are renamed into place only after the
//! gzip stream is finished and fsynced; a failed write unlinks the temp
//! file.

use byteorder::{BigEndian, ByteOrder};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use gibram_core::{Error, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Magic bytes identifying a snapshot file.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"GRAM";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Size of the uncompressed header.
pub const SNAPSHOT_HEADER_SIZE: usize = 64;

/// Hard cap on a section name, applied when reading.
const MAX_SECTION_NAME: u32 = 4096;

/// Hard cap on section payload length, applied when reading.
const MAX_SECTION_DATA: u64 = 4 * 1024 * 1024 * 1024;

/// Snapshot file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u32,
    /// Unix seconds at write time.
    pub timestamp: i64,
    /// WAL LSN this snapshot is consistent with.
    pub lsn: u64,
    pub flags: u32,
}

impl SnapshotHeader {
    pub fn new(lsn: u64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        SnapshotHeader {
            version: SNAPSHOT_VERSION,
            timestamp,
            lsn,
            flags: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; SNAPSHOT_HEADER_SIZE] {
        let mut bytes = [0u8; SNAPSHOT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&SNAPSHOT_MAGIC);
        BigEndian::write_u32(&mut bytes[4..8], self.version);
        BigEndian::write_i64(&mut bytes[8..16], self.timestamp);
        BigEndian::write_u64(&mut bytes[16..24], self.lsn);
        // checksum slot stays zero while hashing
        BigEndian::write_u32(&mut bytes[28..32], self.flags);
        let checksum = crc32fast::hash(&bytes);
        BigEndian::write_u32(&mut bytes[24..28], checksum);
        bytes
    }

    pub fn from_bytes(bytes: &[u8; SNAPSHOT_HEADER_SIZE]) -> Result<Self> {
        if bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(Error::Invalid("snapshot magic mismatch".to_string()));
        }
        let stored_checksum = BigEndian::read_u32(&bytes[24..28]);
        let mut zeroed = *bytes;
        zeroed[24..28].fill(0);
        let computed = crc32fast::hash(&zeroed);
        if computed != stored_checksum {
            return Err(Error::Corruption(format!(
                "snapshot header checksum mismatch: stored {stored_checksum:08x}, computed {computed:08x}"
            )));
        }
        Ok(SnapshotHeader {
            version: BigEndian::read_u32(&bytes[4..8]),
            timestamp: BigEndian::read_i64(&bytes[8..16]),
            lsn: BigEndian::read_u64(&bytes[16..24]),
            flags: BigEndian::read_u32(&bytes[28..32]),
        })
    }
}

/// Streaming snapshot writer.
///
/// Sections are written through a gzip encoder onto `<path>.tmp`;
/// `finish()` completes the stream, fsyncs and renames atomically.
/// Dropping an unfinished writer unlinks the temp file.
pub struct SnapshotWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    encoder: Option<GzEncoder<File>>,
    finished: bool,
}

impl SnapshotWriter {
    /// Start a snapshot at `path`, consistent with `lsn`.
    pub fn create(path: &Path, lsn: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("tmp");
        if temp_path.exists() {
            warn!(path = %temp_path.display(), "removing stale snapshot temp file");
            let _ = std::fs::remove_file(&temp_path);
        }

        let mut file = File::create(&temp_path)?;
        let header = SnapshotHeader::new(lsn);
        file.write_all(&header.to_bytes())?;

        Ok(SnapshotWriter {
            temp_path,
            final_path: path.to_path_buf(),
            encoder: Some(GzEncoder::new(file, Compression::default())),
            finished: false,
        })
    }

    /// Append one named section.
    pub fn write_section(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| Error::State("snapshot writer already finished".to_string()))?;
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, name.len() as u32);
        encoder.write_all(&len)?;
        encoder.write_all(name.as_bytes())?;
        let mut data_len = [0u8; 8];
        BigEndian::write_u64(&mut data_len, data.len() as u64);
        encoder.write_all(&data_len)?;
        encoder.write_all(data)?;
        Ok(())
    }

    /// Finish the gzip stream, fsync and atomically rename into place.
    pub fn finish(mut self) -> Result<()> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| Error::State("snapshot writer already finished".to_string()))?;
        let file = encoder.finish()?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.temp_path, &self.final_path)?;
        self.finished = true;
        debug!(path = %self.final_path.display(), "snapshot written");
        Ok(())
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Write a snapshot at `path` by handing a writer to `write_fn`.
///
/// On any failure the temp file is removed and the final path is untouched.
pub fn create_snapshot<F>(path: &Path, lsn: u64, write_fn: F) -> Result<()>
where
    F: FnOnce(&mut SnapshotWriter) -> Result<()>,
{
    let mut writer = SnapshotWriter::create(path, lsn)?;
    write_fn(&mut writer)?;
    writer.finish()
}

/// Streaming snapshot reader.
#[derive(Debug)]
pub struct SnapshotReader {
    header: SnapshotHeader,
    decoder: GzDecoder<File>,
}

impl SnapshotReader {
    /// Open a snapshot, validating the header immediately.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header_bytes = [0u8; SNAPSHOT_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SnapshotHeader::from_bytes(&header_bytes)?;
        Ok(SnapshotReader {
            header,
            decoder: GzDecoder::new(file),
        })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    /// Next `(name, data)` section, or `None` at end of stream.
    pub fn next_section(&mut self) -> Result<Option<(String, Vec<u8>)>> {
        let mut len_bytes = [0u8; 4];
        match read_exact_or_eof(&mut self.decoder, &mut len_bytes)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Full => {}
        }
        let name_len = BigEndian::read_u32(&len_bytes);
        if name_len > MAX_SECTION_NAME {
            return Err(Error::Corruption(format!(
                "snapshot section name length {name_len} out of bounds"
            )));
        }

        let mut name_bytes = vec![0u8; name_len as usize];
        self.decoder.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| Error::Corruption("snapshot section name is not UTF-8".to_string()))?;

        let mut data_len_bytes = [0u8; 8];
        self.decoder.read_exact(&mut data_len_bytes)?;
        let data_len = BigEndian::read_u64(&data_len_bytes);
        if data_len > MAX_SECTION_DATA {
            return Err(Error::Corruption(format!(
                "snapshot section {name:?} length {data_len} out of bounds"
            )));
        }

        let mut data = vec![0u8; data_len as usize];
        self.decoder.read_exact(&mut data)?;
        Ok(Some((name, data)))
    }
}

/// Read just the header of a snapshot file.
pub fn read_header(path: &Path) -> Result<SnapshotHeader> {
    let mut file = File::open(path)?;
    let mut header_bytes = [0u8; SNAPSHOT_HEADER_SIZE];
    file.read_exact(&mut header_bytes)?;
    SnapshotHeader::from_bytes(&header_bytes)
}

enum ReadOutcome {
    Full,
    Eof,
}

/// Fill `buf`, distinguishing clean end-of-stream (zero bytes read) from a
/// mid-record truncation.
fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Err(Error::Corruption(
                "snapshot truncated inside a section header".to_string(),
            ));
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_roundtrip() {
        let header = SnapshotHeader::new(1234);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"GRAM");
        let parsed = SnapshotHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = SnapshotHeader::new(1).to_bytes();
        bytes[0] = b'X';
        assert!(SnapshotHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_header_rejects_bad_checksum() {
        let mut bytes = SnapshotHeader::new(1).to_bytes();
        bytes[20] ^= 0xFF;
        let err = SnapshotHeader::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_sections_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.gibram");

        create_snapshot(&path, 42, |writer| {
            writer.write_section("alpha", b"first payload")?;
            writer.write_section("beta", &[0u8; 1024])?;
            writer.write_section("empty", b"")
        })
        .unwrap();

        let mut reader = SnapshotReader::open(&path).unwrap();
        assert_eq!(reader.header().lsn, 42);

        let (name, data) = reader.next_section().unwrap().unwrap();
        assert_eq!(name, "alpha");
        assert_eq!(data, b"first payload");

        let (name, data) = reader.next_section().unwrap().unwrap();
        assert_eq!(name, "beta");
        assert_eq!(data.len(), 1024);

        let (name, data) = reader.next_section().unwrap().unwrap();
        assert_eq!(name, "empty");
        assert!(data.is_empty());

        assert!(reader.next_section().unwrap().is_none());
    }

    #[test]
    fn test_failed_write_leaves_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.gibram");

        let result = create_snapshot(&path, 1, |writer| {
            writer.write_section("partial", b"data")?;
            Err(Error::State("injected failure".to_string()))
        });
        assert!(result.is_err());
        assert!(!path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_open_rejects_non_snapshot_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.gibram");
        std::fs::write(&path, vec![7u8; 128]).unwrap();
        let err = SnapshotReader::open(&path).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }
}
