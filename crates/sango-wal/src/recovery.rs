//! Startup scan of the WAL directory.
//!
//! Files are replayed in numeric order. A decode failure in any file except
//! the newest means an older, supposedly-stable file is damaged and startup
//! must fail. A failure in the newest file is the expected shape of a crash
//! mid-write: the file is truncated back to its last whole record and
//! recovery proceeds.

use crate::record::{RecordError, WalRecord};
use crate::{Result, WalError};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of scanning the log directory.
#[derive(Debug)]
pub struct RecoveredLog {
    /// Every whole record, in file-then-offset order.
    pub records: Vec<WalRecord>,
    /// One past the highest LSN seen (1 for an empty log).
    pub next_lsn: u64,
    /// Numeric id the writer should use for its next file.
    pub next_file: u64,
    /// Existing files and the highest LSN each holds, for garbage collection.
    pub files: Vec<WalFileInfo>,
    /// True if a torn tail was truncated away.
    pub truncated_tail: bool,
}

#[derive(Debug, Clone)]
pub struct WalFileInfo {
    pub number: u64,
    pub path: PathBuf,
    pub max_lsn: u64,
}

pub(crate) fn recover(dir: &Path) -> Result<RecoveredLog> {
    let mut numbers: Vec<u64> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".wal")) else {
            continue;
        };
        if let Ok(number) = stem.parse::<u64>() {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();

    let mut records = Vec::new();
    let mut files = Vec::new();
    let mut next_lsn = 1u64;
    let mut truncated_tail = false;

    for (idx, &number) in numbers.iter().enumerate() {
        let path = dir.join(format!("{number}.wal"));
        let data = std::fs::read(&path)?;
        let is_last = idx == numbers.len() - 1;
        let mut offset = 0usize;
        let mut file_max_lsn = 0u64;

        while offset < data.len() {
            match WalRecord::decode(&data[offset..]) {
                Ok((record, consumed)) => {
                    file_max_lsn = file_max_lsn.max(record.lsn);
                    next_lsn = next_lsn.max(record.lsn + 1);
                    records.push(record);
                    offset += consumed;
                }
                Err(err) if is_last => {
                    // Torn tail from a crash mid-append: cut it off and keep
                    // what survived. Anything past the damage is gone.
                    warn!(
                        file = %path.display(),
                        offset,
                        error = %err,
                        "truncating torn WAL tail"
                    );
                    let file = std::fs::OpenOptions::new().write(true).open(&path)?;
                    file.set_len(offset as u64)?;
                    file.sync_all()?;
                    truncated_tail = true;
                    break;
                }
                Err(err) => {
                    return Err(WalError::Corruption {
                        file: path,
                        offset: offset as u64,
                        reason: match err {
                            RecordError::CrcMismatch { .. } => "crc mismatch".into(),
                            other => other.to_string(),
                        },
                    });
                }
            }
        }

        files.push(WalFileInfo {
            number,
            path,
            max_lsn: file_max_lsn,
        });
    }

    let next_file = numbers.last().map(|n| n + 1).unwrap_or(0);
    info!(
        records = records.len(),
        files = files.len(),
        next_lsn,
        truncated_tail,
        "WAL recovery scan complete"
    );

    Ok(RecoveredLog {
        records,
        next_lsn,
        next_file,
        files,
        truncated_tail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WalPayload;
    use std::io::Write;

    fn record(lsn: u64) -> WalRecord {
        WalRecord {
            lsn,
            table: "t".into(),
            partition_tag: String::new(),
            payload: WalPayload::Delete { ids: vec![lsn as i64] },
        }
    }

    fn write_file(dir: &Path, number: u64, records: &[WalRecord], extra: &[u8]) {
        let mut file = std::fs::File::create(dir.join(format!("{number}.wal"))).unwrap();
        for r in records {
            file.write_all(&r.encode()).unwrap();
        }
        file.write_all(extra).unwrap();
    }

    #[test]
    fn test_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log = recover(dir.path()).unwrap();
        assert!(log.records.is_empty());
        assert_eq!(log.next_lsn, 1);
        assert_eq!(log.next_file, 0);
    }

    #[test]
    fn test_multi_file_order() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), 0, &[record(1), record(2)], &[]);
        write_file(dir.path(), 1, &[record(3)], &[]);

        let log = recover(dir.path()).unwrap();
        let lsns: Vec<u64> = log.records.iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, vec![1, 2, 3]);
        assert_eq!(log.next_lsn, 4);
        assert_eq!(log.next_file, 2);
        assert_eq!(log.files[0].max_lsn, 2);
        assert_eq!(log.files[1].max_lsn, 3);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let torn = record(3).encode();
        write_file(dir.path(), 0, &[record(1), record(2)], &torn[..torn.len() - 3]);

        let log = recover(dir.path()).unwrap();
        assert_eq!(log.records.len(), 2);
        assert!(log.truncated_tail);

        // The file on disk now ends at the last whole record.
        let relisted = recover(dir.path()).unwrap();
        assert_eq!(relisted.records.len(), 2);
        assert!(!relisted.truncated_tail);
    }

    #[test]
    fn test_corruption_in_older_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let frame = record(1).encode();
        let mut damaged = frame.to_vec();
        damaged[10] ^= 0xFF;
        write_file(dir.path(), 0, &[], &damaged);
        write_file(dir.path(), 1, &[record(2)], &[]);

        assert!(matches!(
            recover(dir.path()),
            Err(WalError::Corruption { .. })
        ));
    }

    #[test]
    fn test_crc_damage_on_newest_file_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let frame = record(2).encode();
        let mut damaged = frame.to_vec();
        damaged[12] ^= 0xFF;
        write_file(dir.path(), 0, &[record(1)], &damaged);

        let log = recover(dir.path()).unwrap();
        assert_eq!(log.records.len(), 1);
        assert!(log.truncated_tail);
    }
}
