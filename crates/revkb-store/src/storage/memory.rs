//! Reference relational backend kept in memory, optionally backed by a WAL.
//!
//! One [`MemoryDatabase`] plays the role of the shared SQL server: several
//! `KnowledgeBase` instances (each with its own [`MemoryPool`]) may point at
//! the same database and behave like cooperating processes.

use super::wal::{WalEntry, WriteAheadLog, WriteOp};
use super::{
    BranchRecord, BranchSwitchRow, Connection, ConnectionPool, RevisionChanges, RevisionRecord,
    SequenceKind, StorageError, StorageResult, StoredRow,
};
use crate::config::PoolConfig;
use crate::types::{AttrValue, BranchId, Identity, ObjectId, Revision, TypeName};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Writer lock wait of connections opened outside a pool.
const DEFAULT_WRITER_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Fault injection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Read,
    Sequence,
    Write,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Retryable; also breaks the connection it happened on.
    Transient,
    /// Non-retryable constraint failure.
    Constraint,
}

/// Fail the next `times` operations at `point`.
#[derive(Debug, Clone)]
pub struct Fault {
    pub point: FaultPoint,
    pub kind: FaultKind,
    pub times: u32,
}

// ============================================================================
// Tables
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    /// Versions per identity, ordered by `rev_min`.
    rows: BTreeMap<Identity, Vec<StoredRow>>,
    sequences: BTreeMap<SequenceKind, u64>,
    revisions: BTreeMap<Revision, RevisionRecord>,
    branches: BTreeMap<BranchId, BranchRecord>,
    branch_switches: Vec<BranchSwitchRow>,
}

impl Tables {
    fn is_live(&self, identity: &Identity) -> bool {
        self.rows
            .get(identity)
            .and_then(|versions| versions.last())
            .is_some_and(StoredRow::is_live)
    }

    fn type_range<'a>(
        &'a self,
        branch: BranchId,
        type_name: &TypeName,
    ) -> impl Iterator<Item = &'a Vec<StoredRow>> + 'a {
        let lo = Identity::new(branch, type_name.clone(), ObjectId(0));
        let hi = Identity::new(branch, type_name.clone(), ObjectId(u64::MAX));
        self.rows
            .range((Bound::Included(lo), Bound::Included(hi)))
            .map(|(_, versions)| versions)
    }

    fn check(&self, ops: &[WriteOp]) -> StorageResult<()> {
        let mut live: HashMap<Identity, bool> = HashMap::new();
        for op in ops {
            match op {
                WriteOp::InsertRows(rows) => {
                    for row in rows {
                        let identity = row.identity();
                        let is_live = live
                            .get(&identity)
                            .copied()
                            .unwrap_or_else(|| self.is_live(&identity));
                        if is_live {
                            return Err(StorageError::Constraint(format!(
                                "duplicate live row for {identity}"
                            )));
                        }
                        if row.rev_min > row.rev_max || row.rev_min.is_current() {
                            return Err(StorageError::Constraint(format!(
                                "invalid validity range for {identity}"
                            )));
                        }
                        live.insert(identity, row.is_live());
                    }
                }
                WriteOp::OutdateRows { identities, .. } => {
                    for identity in identities {
                        let is_live = live
                            .get(identity)
                            .copied()
                            .unwrap_or_else(|| self.is_live(identity));
                        if !is_live {
                            return Err(StorageError::Constraint(format!(
                                "no live row to outdate for {identity}"
                            )));
                        }
                        live.insert(identity.clone(), false);
                    }
                }
                WriteOp::InsertRevision(record) => {
                    if self.revisions.contains_key(&record.revision) {
                        return Err(StorageError::Constraint(format!(
                            "revision {} already recorded",
                            record.revision
                        )));
                    }
                }
                WriteOp::InsertBranch(record) => {
                    if self.branches.contains_key(&record.id) {
                        return Err(StorageError::Constraint(format!(
                            "branch {} already exists",
                            record.id
                        )));
                    }
                }
                WriteOp::InsertBranchSwitch(_) => {}
            }
        }
        Ok(())
    }

    fn apply(&mut self, ops: Vec<WriteOp>) {
        for op in ops {
            match op {
                WriteOp::InsertRows(rows) => {
                    for row in rows {
                        self.rows.entry(row.identity()).or_default().push(row);
                    }
                }
                WriteOp::OutdateRows {
                    identities,
                    last_valid,
                } => {
                    for identity in identities {
                        if let Some(row) = self
                            .rows
                            .get_mut(&identity)
                            .and_then(|versions| versions.last_mut())
                            .filter(|row| row.is_live())
                        {
                            row.rev_max = last_valid;
                        }
                    }
                }
                WriteOp::InsertRevision(record) => {
                    self.revisions.insert(record.revision, record);
                }
                WriteOp::InsertBranch(record) => {
                    self.branches.insert(record.id, record);
                }
                WriteOp::InsertBranchSwitch(row) => self.branch_switches.push(row),
            }
        }
    }

    fn bump_sequence(&mut self, kind: SequenceKind) -> u64 {
        let value = self.sequences.entry(kind).or_insert_with(|| kind.initial());
        *value += 1;
        *value
    }
}

fn require_concrete(revision: Revision) -> StorageResult<()> {
    if revision.is_current() {
        return Err(StorageError::InvalidRequest(
            "the CURRENT sentinel must be resolved before storage access".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Database
// ============================================================================

pub struct MemoryDatabase {
    tables: RwLock<Tables>,
    /// Connection id holding the writer lock.
    writer: Mutex<Option<u64>>,
    writer_released: Condvar,
    wal: Option<WriteAheadLog>,
    faults: Mutex<Vec<Fault>>,
    next_connection: AtomicU64,
}

impl MemoryDatabase {
    /// A purely in-memory database.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_wal(None))
    }

    /// Open (or create) a WAL-backed database and replay its log.
    pub fn open(wal_path: &Path, sync: bool) -> StorageResult<Arc<Self>> {
        let wal = WriteAheadLog::open(wal_path, sync)?;
        let db = Self::with_wal(Some(wal));
        if let Some(wal) = &db.wal {
            let mut tables = db.tables.write();
            wal.replay(|entry| {
                match entry {
                    WalEntry::Sequence { kind, value } => {
                        let slot = tables.sequences.entry(kind).or_insert_with(|| kind.initial());
                        *slot = (*slot).max(value);
                    }
                    WalEntry::Commit { ops } => tables.apply(ops),
                }
                Ok(())
            })?;
            info!(
                path = %wal_path.display(),
                revisions = tables.revisions.len(),
                identities = tables.rows.len(),
                "memory database recovered from wal"
            );
        }
        Ok(Arc::new(db))
    }

    fn with_wal(wal: Option<WriteAheadLog>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            writer: Mutex::new(None),
            writer_released: Condvar::new(),
            wal,
            faults: Mutex::new(Vec::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Number of stored row versions across all identities.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.read().rows.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn branch_switches(&self) -> Vec<BranchSwitchRow> {
        self.tables.read().branch_switches.clone()
    }

    /// Open a raw connection (pools call this).
    #[must_use]
    pub fn connect(self: &Arc<Self>) -> MemoryConnection {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        trace!(connection = id, "memory connection opened");
        MemoryConnection {
            id,
            db: Arc::clone(self),
            pending: None,
            broken: false,
            writer_timeout: DEFAULT_WRITER_TIMEOUT,
        }
    }

    fn take_fault(&self, point: FaultPoint) -> Option<FaultKind> {
        let mut faults = self.faults.lock();
        let pos = faults.iter().position(|f| f.point == point && f.times > 0)?;
        let kind = faults[pos].kind;
        faults[pos].times -= 1;
        if faults[pos].times == 0 {
            faults.remove(pos);
        }
        Some(kind)
    }

    fn acquire_writer(&self, connection: u64, timeout: Duration) -> StorageResult<()> {
        let deadline = Instant::now() + timeout;
        let mut writer = self.writer.lock();
        while writer.is_some() {
            if self.writer_released.wait_until(&mut writer, deadline).timed_out() {
                if let Some(holder) = *writer {
                    warn!(connection, holder, waited_ms = timeout.as_millis() as u64, "writer lock timeout");
                    return Err(StorageError::Transient(format!(
                        "writer lock held by connection {holder}"
                    )));
                }
            }
        }
        *writer = Some(connection);
        Ok(())
    }

    fn release_writer(&self, connection: u64) {
        let mut writer = self.writer.lock();
        if *writer == Some(connection) {
            *writer = None;
            self.writer_released.notify_all();
        }
    }

    fn next_sequence(&self, kind: SequenceKind) -> StorageResult<u64> {
        let mut tables = self.tables.write();
        let value = tables.bump_sequence(kind);
        if let Some(wal) = &self.wal {
            wal.append(&WalEntry::Sequence { kind, value })?;
        }
        Ok(value)
    }

    fn commit_ops(&self, ops: Vec<WriteOp>) -> StorageResult<()> {
        let mut tables = self.tables.write();
        tables.check(&ops)?;
        if let Some(wal) = &self.wal {
            wal.append(&WalEntry::Commit { ops: ops.clone() })?;
        }
        tables.apply(ops);
        Ok(())
    }
}

// ============================================================================
// Connection
// ============================================================================

pub struct MemoryConnection {
    id: u64,
    db: Arc<MemoryDatabase>,
    pending: Option<Vec<WriteOp>>,
    broken: bool,
    writer_timeout: Duration,
}

impl MemoryConnection {
    /// Bound the wait for the writer lock in [`Connection::begin`].
    #[must_use]
    pub fn with_writer_timeout(mut self, timeout: Duration) -> Self {
        self.writer_timeout = timeout;
        self
    }

    fn guard(&mut self, point: FaultPoint) -> StorageResult<()> {
        if self.broken {
            return Err(StorageError::Broken(self.id));
        }
        match self.db.take_fault(point) {
            None => Ok(()),
            Some(FaultKind::Transient) => {
                self.broken = true;
                Err(StorageError::Transient(format!(
                    "injected {point:?} failure on connection {}",
                    self.id
                )))
            }
            Some(FaultKind::Constraint) => Err(StorageError::Constraint(format!(
                "injected {point:?} constraint failure"
            ))),
        }
    }

    fn push(&mut self, op: WriteOp) -> StorageResult<()> {
        self.guard(FaultPoint::Write)?;
        match self.pending.as_mut() {
            Some(ops) => {
                ops.push(op);
                Ok(())
            }
            None => Err(StorageError::InvalidRequest(
                "write outside of a transaction".to_string(),
            )),
        }
    }

    fn end_transaction(&mut self) {
        if self.pending.take().is_some() {
            self.db.release_writer(self.id);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.end_transaction();
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn fetch(&mut self, identity: &Identity, revision: Revision) -> StorageResult<Option<StoredRow>> {
        self.guard(FaultPoint::Read)?;
        require_concrete(revision)?;
        let tables = self.db.tables.read();
        Ok(tables
            .rows
            .get(identity)
            .and_then(|versions| versions.iter().rev().find(|row| row.covers(revision)))
            .cloned())
    }

    fn fetch_many(
        &mut self,
        identities: &[Identity],
        revision: Revision,
    ) -> StorageResult<Vec<StoredRow>> {
        self.guard(FaultPoint::Read)?;
        require_concrete(revision)?;
        let tables = self.db.tables.read();
        Ok(identities
            .iter()
            .filter_map(|identity| {
                tables
                    .rows
                    .get(identity)
                    .and_then(|versions| versions.iter().rev().find(|row| row.covers(revision)))
                    .cloned()
            })
            .collect())
    }

    fn fetch_history(
        &mut self,
        identity: &Identity,
        from: Revision,
        to: Revision,
    ) -> StorageResult<Vec<StoredRow>> {
        self.guard(FaultPoint::Read)?;
        require_concrete(from)?;
        let tables = self.db.tables.read();
        Ok(tables
            .rows
            .get(identity)
            .map(|versions| {
                versions
                    .iter()
                    .filter(|row| row.rev_min <= to && row.rev_max >= from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn scan_type(
        &mut self,
        branch: BranchId,
        type_name: &TypeName,
        revision: Revision,
    ) -> StorageResult<Vec<StoredRow>> {
        self.guard(FaultPoint::Read)?;
        require_concrete(revision)?;
        let tables = self.db.tables.read();
        Ok(tables
            .type_range(branch, type_name)
            .filter_map(|versions| versions.iter().rev().find(|row| row.covers(revision)))
            .cloned()
            .collect())
    }

    fn find_referrers(
        &mut self,
        branch: BranchId,
        source_type: &TypeName,
        attribute: &str,
        target: ObjectId,
        revision: Revision,
    ) -> StorageResult<Vec<StoredRow>> {
        let rows = self.scan_type(branch, source_type, revision)?;
        Ok(rows
            .into_iter()
            .filter(|row| row.attributes.get(attribute) == Some(&AttrValue::Ref(target)))
            .collect())
    }

    fn scan_changes(
        &mut self,
        after: Revision,
        up_to: Revision,
    ) -> StorageResult<Vec<RevisionChanges>> {
        self.guard(FaultPoint::Read)?;
        require_concrete(up_to)?;
        if up_to <= after {
            return Ok(Vec::new());
        }
        let tables = self.db.tables.read();
        let in_range = |r: Revision| after < r && r <= up_to;

        let mut changes: BTreeMap<Revision, RevisionChanges> = tables
            .revisions
            .range((Bound::Excluded(after), Bound::Included(up_to)))
            .map(|(rev, record)| {
                (
                    *rev,
                    RevisionChanges {
                        revision: *rev,
                        record: Some(record.clone()),
                        ..RevisionChanges::default()
                    },
                )
            })
            .collect();

        for row in tables.rows.values().flatten() {
            if in_range(row.rev_min) {
                if let Some(entry) = changes.get_mut(&row.rev_min) {
                    entry.created.push(row.clone());
                }
            }
            if !row.is_live() && in_range(row.rev_max.next()) {
                if let Some(entry) = changes.get_mut(&row.rev_max.next()) {
                    entry.outdated.push(row.clone());
                }
            }
        }
        for branch in tables.branches.values() {
            if let Some(entry) = changes.get_mut(&branch.created_at) {
                entry.branch = Some(branch.clone());
            }
        }

        Ok(changes.into_values().collect())
    }

    fn last_revision(&mut self) -> StorageResult<Revision> {
        self.guard(FaultPoint::Read)?;
        let tables = self.db.tables.read();
        Ok(tables
            .revisions
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Revision::INITIAL))
    }

    fn revision_records(&mut self) -> StorageResult<Vec<RevisionRecord>> {
        self.guard(FaultPoint::Read)?;
        Ok(self.db.tables.read().revisions.values().cloned().collect())
    }

    fn load_branches(&mut self) -> StorageResult<Vec<BranchRecord>> {
        self.guard(FaultPoint::Read)?;
        Ok(self.db.tables.read().branches.values().cloned().collect())
    }

    fn next_sequence(&mut self, kind: SequenceKind) -> StorageResult<u64> {
        self.guard(FaultPoint::Sequence)?;
        let value = self.db.next_sequence(kind)?;
        debug!(connection = self.id, ?kind, value, "sequence advanced");
        Ok(value)
    }

    fn begin(&mut self) -> StorageResult<()> {
        if self.broken {
            return Err(StorageError::Broken(self.id));
        }
        if self.pending.is_some() {
            return Err(StorageError::InvalidRequest(
                "transaction already open".to_string(),
            ));
        }
        self.db.acquire_writer(self.id, self.writer_timeout)?;
        self.pending = Some(Vec::new());
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }

    fn insert_rows(&mut self, rows: Vec<StoredRow>) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.push(WriteOp::InsertRows(rows))
    }

    fn outdate_rows(&mut self, identities: Vec<Identity>, last_valid: Revision) -> StorageResult<()> {
        if identities.is_empty() {
            return Ok(());
        }
        self.push(WriteOp::OutdateRows {
            identities,
            last_valid,
        })
    }

    fn insert_revision(&mut self, record: RevisionRecord) -> StorageResult<()> {
        self.push(WriteOp::InsertRevision(record))
    }

    fn insert_branch(&mut self, record: BranchRecord) -> StorageResult<()> {
        self.push(WriteOp::InsertBranch(record))
    }

    fn insert_branch_switch(&mut self, row: BranchSwitchRow) -> StorageResult<()> {
        self.push(WriteOp::InsertBranchSwitch(row))
    }

    fn commit(&mut self) -> StorageResult<()> {
        let result = match self.guard(FaultPoint::Commit) {
            Ok(()) => match self.pending.take() {
                Some(ops) => {
                    let n = ops.len();
                    let result = self.db.commit_ops(ops);
                    self.db.release_writer(self.id);
                    trace!(connection = self.id, ops = n, ok = result.is_ok(), "commit");
                    result
                }
                None => Err(StorageError::InvalidRequest(
                    "commit without a transaction".to_string(),
                )),
            },
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.end_transaction();
        }
        result
    }

    fn rollback(&mut self) -> StorageResult<()> {
        let result = self.guard(FaultPoint::Rollback);
        self.end_transaction();
        result
    }
}

// ============================================================================
// Pool
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub invalidated: u64,
    pub idle: usize,
}

pub struct MemoryPool {
    db: Arc<MemoryDatabase>,
    config: PoolConfig,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    write: Mutex<Option<Box<dyn Connection>>>,
    created: AtomicU64,
    invalidated: AtomicU64,
}

impl MemoryPool {
    pub fn new(db: Arc<MemoryDatabase>, config: PoolConfig) -> Self {
        Self {
            db,
            config,
            idle: Mutex::new(Vec::new()),
            write: Mutex::new(None),
            created: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
        }
    }

    fn open(&self) -> Box<dyn Connection> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Box::new(self.db.connect().with_writer_timeout(self.config.writer_timeout()))
    }
}

impl ConnectionPool for MemoryPool {
    fn borrow_read_connection(&self) -> StorageResult<Box<dyn Connection>> {
        let pooled = self.idle.lock().pop();
        Ok(pooled.unwrap_or_else(|| self.open()))
    }

    fn release_read_connection(&self, conn: Box<dyn Connection>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.config.max_idle_connections {
            idle.push(conn);
        }
    }

    fn borrow_write_connection(&self) -> StorageResult<Box<dyn Connection>> {
        let pooled = self.write.lock().take();
        Ok(pooled.unwrap_or_else(|| self.open()))
    }

    fn release_write_connection(&self, mut conn: Box<dyn Connection>) {
        if conn.in_transaction() {
            // A connection must never re-enter the pool holding the writer lock.
            if let Err(err) = conn.rollback() {
                warn!(connection = conn.id(), error = %err, "rollback on release failed; discarding connection");
                self.invalidate_connection(conn);
                return;
            }
        }
        *self.write.lock() = Some(conn);
    }

    fn invalidate_connection(&self, conn: Box<dyn Connection>) {
        self.invalidated.fetch_add(1, Ordering::Relaxed);
        debug!(connection = conn.id(), "connection invalidated");
        drop(conn);
    }

    fn retry_count(&self) -> u32 {
        self.config.retry_count
    }

    fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.config.retry_backoff_ms)
    }

    fn can_retry(&self, err: &StorageError) -> bool {
        matches!(err, StorageError::Transient(_) | StorageError::Broken(_))
    }
}
