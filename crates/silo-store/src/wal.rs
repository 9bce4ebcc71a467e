//! Write-ahead log for sector metadata mutations.
//!
//! Every metadata mutation is journaled before the in-memory maps and the
//! folder metadata file are touched. The journal is a JSON-lines file,
//! fsynced per record; replay at startup is idempotent, and a truncated
//! final line (torn write during a crash) is discarded.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use silo_core::SectorId;

use crate::error::StoreError;

/// One journaled metadata mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum WalRecord {
    /// A new storage folder was registered.
    AddFolder {
        index: u16,
        path: PathBuf,
        capacity: u32,
    },
    /// A sector was placed, or its refcount changed.
    Set {
        id: SectorId,
        folder: u16,
        slot: u32,
        count: u16,
    },
    /// A sector's last virtual reference was dropped.
    Remove { id: SectorId, folder: u16, slot: u32 },
}

pub(crate) struct Wal {
    file: File,
    path: PathBuf,
}

impl Wal {
    /// Open (or create) the journal at `path`.
    pub(crate) fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(|source| StoreError::Journal { source })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Read every intact record currently in the journal.
    pub(crate) fn replay(path: &Path) -> Result<Vec<WalRecord>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).map_err(|source| StoreError::Journal { source })?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| StoreError::Journal { source })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    // A torn final line is expected after a crash; anything
                    // else is still not worth refusing to start over.
                    tracing::warn!(error = %err, "discarding unparseable journal line");
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Append a record and flush it to disk.
    pub(crate) fn append(&mut self, record: &WalRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)
            .map_err(|err| StoreError::Settings(err.to_string()))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.sync_data())
            .map_err(|source| StoreError::Journal { source })
    }

    /// Discard all journaled records after a checkpoint.
    ///
    /// Callers must have flushed every folder metadata file first.
    pub(crate) fn truncate(&mut self) -> Result<(), StoreError> {
        self.file
            .set_len(0)
            .and_then(|()| self.file.sync_data())
            .map_err(|source| StoreError::Journal { source })
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(b: u8) -> WalRecord {
        WalRecord::Set {
            id: SectorId::from_bytes([b; 12]),
            folder: 0,
            slot: u32::from(b),
            count: 1,
        }
    }

    #[test]
    fn records_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&record(1)).unwrap();
        wal.append(&record(2)).unwrap();
        wal.append(&WalRecord::Remove {
            id: SectorId::from_bytes([1; 12]),
            folder: 0,
            slot: 1,
        })
        .unwrap();

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], record(1));
    }

    #[test]
    fn torn_final_line_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&record(1)).unwrap();

        // Simulate a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(wal.path()).unwrap();
        file.write_all(b"{\"Set\":{\"id\":[1,2").unwrap();
        drop(file);

        let records = Wal::replay(&path).unwrap();
        assert_eq!(records, vec![record(1)]);
    }

    #[test]
    fn truncate_empties_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&record(1)).unwrap();
        wal.truncate().unwrap();
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_journal_replays_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Wal::replay(&dir.path().join("absent.log")).unwrap().is_empty());
    }
}
