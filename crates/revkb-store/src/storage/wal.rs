//! Write-ahead log for the in-memory backend.
//!
//! Every committed backend transaction and every sequence advance is appended
//! as one length-prefixed bincode frame. Opening a database replays the log
//! front to back; a torn final frame (crash mid-append) is ignored.

use super::{
    BranchRecord, BranchSwitchRow, RevisionRecord, SequenceKind, StorageError, StorageResult,
    StoredRow,
};
use crate::types::{Identity, Revision};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One buffered write inside a backend transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    InsertRows(Vec<StoredRow>),
    OutdateRows {
        identities: Vec<Identity>,
        last_valid: Revision,
    },
    InsertRevision(RevisionRecord),
    InsertBranch(BranchRecord),
    InsertBranchSwitch(BranchSwitchRow),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    Sequence { kind: SequenceKind, value: u64 },
    Commit { ops: Vec<WriteOp> },
}

pub struct WriteAheadLog {
    file: Mutex<File>,
    path: PathBuf,
    sync: bool,
}

impl WriteAheadLog {
    pub fn open(path: &Path, sync: bool) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            sync,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry; returns the number of bytes written.
    pub fn append(&self, entry: &WalEntry) -> StorageResult<u64> {
        let data = bincode::serialize(entry).map_err(|e| StorageError::Codec(e.to_string()))?;
        let len = u32::try_from(data.len())
            .map_err(|_| StorageError::Codec("wal frame exceeds 4 GiB".to_string()))?;

        let mut file = self.file.lock();
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&data)?;
        if self.sync {
            file.sync_data()?;
        }

        Ok(u64::from(len) + 4)
    }

    /// Feed every complete entry to `handler`, oldest first.
    pub fn replay<F>(&self, mut handler: F) -> StorageResult<usize>
    where
        F: FnMut(WalEntry) -> StorageResult<()>,
    {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;

        let mut count = 0_usize;
        loop {
            let mut len_bytes = [0u8; 4];
            match file.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            match file.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    warn!(path = %self.path.display(), frame = count, "ignoring torn wal tail");
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            let entry: WalEntry =
                bincode::deserialize(&data).map_err(|e| StorageError::Codec(e.to_string()))?;
            handler(entry)?;
            count += 1;
        }

        debug!(path = %self.path.display(), frames = count, "wal replayed");
        Ok(count)
    }
}
