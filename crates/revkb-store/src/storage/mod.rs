//! Backing-store interfaces.
//!
//! The core never talks to a concrete database. It borrows connections from a
//! [`ConnectionPool`] and issues typed operations through [`Connection`]:
//!
//! - point and bulk fetches of versioned rows,
//! - change scans by revision range (the refetch input),
//! - write batches (outdate / insert) inside one backend transaction,
//! - a sequence allocator that is deliberately *not* transactional.
//!
//! Rows are versioned: a row is valid over `[rev_min, rev_max]` and a live row
//! has `rev_max == Revision::CURRENT`. Deleting outdates the live row, updating
//! outdates it and inserts a successor.

pub mod memory;
pub mod wal;

pub use memory::{Fault, FaultKind, FaultPoint, MemoryDatabase, MemoryPool, PoolStats};
pub use wal::{WalEntry, WriteAheadLog, WriteOp};

use crate::types::{Attributes, BranchId, Identity, ObjectId, Revision, TypeName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StorageError {
    /// A failure that is expected to go away on a fresh connection.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// The connection is unusable and must be discarded, not pooled.
    #[error("connection {0} is broken")]
    Broken(u64),

    /// A unique-key or outdate precondition was violated.
    #[error("storage constraint violated: {0}")]
    Constraint(String),

    /// The request itself was malformed (e.g. a read at `CURRENT`).
    #[error("invalid storage request: {0}")]
    InvalidRequest(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage codec error: {0}")]
    Codec(String),
}

impl StorageError {
    /// Whether the backend state might not match what the caller believes,
    /// i.e. the connection has to be thrown away after this error.
    #[must_use]
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            StorageError::Transient(_) | StorageError::Broken(_) | StorageError::Io(_)
        )
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ============================================================================
// Rows and records
// ============================================================================

/// One version of one object as stored in the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    /// Data branch holding the row.
    pub branch: BranchId,
    pub type_name: TypeName,
    pub id: ObjectId,
    pub rev_min: Revision,
    /// Inclusive; `Revision::CURRENT` while the row is live.
    pub rev_max: Revision,
    pub attributes: Attributes,
}

impl StoredRow {
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.branch, self.type_name.clone(), self.id)
    }

    #[must_use]
    pub fn covers(&self, revision: Revision) -> bool {
        self.rev_min <= revision && revision <= self.rev_max
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.rev_max.is_current()
    }
}

/// Metadata written once per published revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub revision: Revision,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// The immutable record of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub id: BranchId,
    pub base_branch: Option<BranchId>,
    pub base_revision: Revision,
    /// Revision in which the branch was created.
    pub created_at: Revision,
    /// Per type: the branch that holds the type's rows when read through
    /// this branch. Equal to `id` for branched types.
    pub data_branches: BTreeMap<TypeName, BranchId>,
}

/// Marker row written per type when a branch is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSwitchRow {
    pub branch: BranchId,
    pub type_name: TypeName,
    pub data_branch: BranchId,
    pub revision: Revision,
}

/// Everything that happened in one revision, as seen by a change scan.
#[derive(Debug, Clone, Default)]
pub struct RevisionChanges {
    pub revision: Revision,
    pub record: Option<RevisionRecord>,
    /// Rows whose `rev_min` equals the revision.
    pub created: Vec<StoredRow>,
    /// Rows whose `rev_max + 1` equals the revision (their old values).
    pub outdated: Vec<StoredRow>,
    pub branch: Option<BranchRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SequenceKind {
    Revision,
    Branch,
    Object,
}

impl SequenceKind {
    /// Value the sequence holds before its first allocation.
    #[must_use]
    pub fn initial(self) -> u64 {
        match self {
            SequenceKind::Revision => Revision::INITIAL.0,
            SequenceKind::Branch => BranchId::TRUNK.0,
            SequenceKind::Object => 0,
        }
    }
}

// ============================================================================
// Connections
// ============================================================================

/// A borrowed backend connection.
///
/// Reads observe committed state only. Writes are buffered between
/// [`Connection::begin`] and [`Connection::commit`]; an open write transaction
/// holds the backend's writer lock so that writers from every process sharing
/// the backend are serialized.
pub trait Connection: Send {
    fn id(&self) -> u64;

    fn fetch(&mut self, identity: &Identity, revision: Revision)
        -> StorageResult<Option<StoredRow>>;

    fn fetch_many(
        &mut self,
        identities: &[Identity],
        revision: Revision,
    ) -> StorageResult<Vec<StoredRow>>;

    /// Rows of `identity` overlapping `[from, to]`, ordered by `rev_min`.
    fn fetch_history(
        &mut self,
        identity: &Identity,
        from: Revision,
        to: Revision,
    ) -> StorageResult<Vec<StoredRow>>;

    /// All rows of a type on a data branch valid at `revision`.
    fn scan_type(
        &mut self,
        branch: BranchId,
        type_name: &TypeName,
        revision: Revision,
    ) -> StorageResult<Vec<StoredRow>>;

    /// Rows of `source_type` valid at `revision` whose `attribute` refers to
    /// `target`.
    fn find_referrers(
        &mut self,
        branch: BranchId,
        source_type: &TypeName,
        attribute: &str,
        target: ObjectId,
        revision: Revision,
    ) -> StorageResult<Vec<StoredRow>>;

    /// Changes of every revision in `(after, up_to]`, in revision order.
    /// Revisions without a record (aborted commits) are skipped.
    fn scan_changes(&mut self, after: Revision, up_to: Revision)
        -> StorageResult<Vec<RevisionChanges>>;

    /// Highest revision that has a committed record.
    fn last_revision(&mut self) -> StorageResult<Revision>;

    fn revision_records(&mut self) -> StorageResult<Vec<RevisionRecord>>;

    fn load_branches(&mut self) -> StorageResult<Vec<BranchRecord>>;

    /// Advance a sequence. Never rolled back.
    fn next_sequence(&mut self, kind: SequenceKind) -> StorageResult<u64>;

    fn begin(&mut self) -> StorageResult<()>;

    fn in_transaction(&self) -> bool;

    fn insert_rows(&mut self, rows: Vec<StoredRow>) -> StorageResult<()>;

    /// Close the live rows of `identities` at `last_valid`.
    fn outdate_rows(&mut self, identities: Vec<Identity>, last_valid: Revision)
        -> StorageResult<()>;

    fn insert_revision(&mut self, record: RevisionRecord) -> StorageResult<()>;

    fn insert_branch(&mut self, record: BranchRecord) -> StorageResult<()>;

    fn insert_branch_switch(&mut self, row: BranchSwitchRow) -> StorageResult<()>;

    fn commit(&mut self) -> StorageResult<()>;

    fn rollback(&mut self) -> StorageResult<()>;
}

/// Connection pool with a separate write connection and a retry policy.
pub trait ConnectionPool: Send + Sync {
    fn borrow_read_connection(&self) -> StorageResult<Box<dyn Connection>>;

    fn release_read_connection(&self, conn: Box<dyn Connection>);

    fn borrow_write_connection(&self) -> StorageResult<Box<dyn Connection>>;

    fn release_write_connection(&self, conn: Box<dyn Connection>);

    /// Drop a connection whose state can no longer be trusted.
    fn invalidate_connection(&self, conn: Box<dyn Connection>);

    fn retry_count(&self) -> u32;

    fn retry_backoff(&self) -> Duration;

    fn can_retry(&self, err: &StorageError) -> bool;
}

/// Run a read operation on a pooled connection, retrying transient failures
/// on a fresh connection up to the pool's retry budget.
pub fn with_read_connection<T, F>(pool: &dyn ConnectionPool, op: &str, mut f: F) -> StorageResult<T>
where
    F: FnMut(&mut dyn Connection) -> StorageResult<T>,
{
    let mut attempt = 0_u32;
    loop {
        let mut conn = pool.borrow_read_connection()?;
        match f(conn.as_mut()) {
            Ok(value) => {
                pool.release_read_connection(conn);
                return Ok(value);
            }
            Err(err) => {
                let retry = attempt < pool.retry_count() && pool.can_retry(&err);
                if err.poisons_connection() {
                    pool.invalidate_connection(conn);
                } else {
                    pool.release_read_connection(conn);
                }
                if !retry {
                    return Err(err);
                }
                attempt += 1;
                warn!(op, attempt, error = %err, "retrying storage read on a fresh connection");
                let backoff = pool.retry_backoff();
                if !backoff.is_zero() {
                    std::thread::sleep(backoff * attempt);
                }
            }
        }
    }
}

/// Roll back the write transaction on `conn` and return it to the pool. A
/// connection whose rollback fails is discarded instead.
pub fn rollback_write_connection(pool: &dyn ConnectionPool, mut conn: Box<dyn Connection>) {
    match conn.rollback() {
        Ok(()) => pool.release_write_connection(conn),
        Err(err) => {
            warn!(connection = conn.id(), error = %err, "rollback failed; discarding connection");
            pool.invalidate_connection(conn);
        }
    }
}
