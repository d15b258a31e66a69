//! Corruption and crash-tail behavior of the WAL, exercised through the
//! public API on real files.

use gibram_durability::wal::{self, SyncMode, Wal, WalConfig, WalRecord, WalRecordType};
use proptest::prelude::*;
use tempfile::tempdir;

#[test]
fn replay_stops_at_first_corrupted_record() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(dir.path(), WalConfig::default()).unwrap();
    for i in 0..20u64 {
        wal.append(WalRecordType::Insert, b"key", format!("value-{i}").as_bytes())
            .unwrap();
    }
    wal.sync().unwrap();
    drop(wal);

    // Corrupt a key byte inside the first record
    // (layout: lsn 8 | ts 8 | type 1 | key len 4 | key ...).
    let path = wal::segment_path(dir.path(), 0);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[21] ^= 0xA5;
    std::fs::write(&path, &bytes).unwrap();

    let err = wal::read_segment(&path).unwrap_err();
    let message = err.to_string();
    assert!(
        message.contains("checksum") || message.contains("corruption") || message.contains("type"),
        "unexpected error: {message}"
    );
}

#[test]
fn torn_tail_is_dropped_but_prefix_survives() {
    let dir = tempdir().unwrap();
    let wal = Wal::open(
        dir.path(),
        WalConfig {
            sync_mode: SyncMode::EveryWrite,
            ..WalConfig::default()
        },
    )
    .unwrap();
    for i in 0..10u64 {
        wal.append(WalRecordType::Update, b"k", &i.to_be_bytes())
            .unwrap();
    }
    drop(wal);

    let path = wal::segment_path(dir.path(), 0);
    let bytes = std::fs::read(&path).unwrap();
    // Cut into the final record's checksum.
    std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

    let records = wal::read_segment(&path).unwrap();
    assert_eq!(records.len(), 9);

    // A reopened WAL resumes after the last intact record.
    let wal = Wal::open(dir.path(), WalConfig::default()).unwrap();
    assert_eq!(wal.current_lsn(), 9);
}

proptest! {
    #[test]
    fn record_roundtrip(
        lsn in 1u64..u64::MAX / 2,
        timestamp in 0u64..u64::MAX / 2,
        type_byte in 1u8..=4,
        key in proptest::collection::vec(any::<u8>(), 0..64),
        data in proptest::collection::vec(any::<u8>(), 0..512),
    ) {
        let record = WalRecord {
            lsn,
            timestamp_nanos: timestamp,
            record_type: WalRecordType::from_u8(type_byte).unwrap(),
            key,
            data,
        };
        let bytes = record.to_bytes();
        let (parsed, consumed) = WalRecord::parse(&bytes).unwrap().unwrap();
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(parsed, record);
    }

    #[test]
    fn truncated_record_is_partial_not_error(
        data in proptest::collection::vec(any::<u8>(), 1..256),
        cut in 1usize..20,
    ) {
        let record = WalRecord {
            lsn: 7,
            timestamp_nanos: 1,
            record_type: WalRecordType::Insert,
            key: b"key".to_vec(),
            data,
        };
        let bytes = record.to_bytes();
        let cut = cut.min(bytes.len() - 1);
        let truncated = &bytes[..bytes.len() - cut];
        prop_assert!(matches!(WalRecord::parse(truncated), Ok(None)));
    }
}
