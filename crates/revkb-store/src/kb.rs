//! The knowledge base: one process-local view over a shared backend.
//!
//! A [`KnowledgeBase`] owns the object cache, the update chain, the branch
//! registry and the refetch lock. Sessions are cheap handles on top of it;
//! every read resolves through [`KnowledgeBase::resolve_current`] or
//! [`KnowledgeBase::resolve_historical`] so that repeated lookups of the same
//! key hand out the same [`KnowledgeItem`] instance while it is reachable.

use crate::branch::{trunk_record, Branch, BranchRegistry};
use crate::cache::{CacheStats, ObjectCache};
use crate::config::KbConfig;
use crate::error::{KbError, Result};
use crate::event::{ChangeListener, CommitVeto, ListenerPriority};
use crate::flex::FlexAttributeStore;
use crate::item::KnowledgeItem;
use crate::refetch::RefetchLock;
use crate::schema::Schema;
use crate::session::Session;
use crate::storage::{
    rollback_write_connection, with_read_connection, Connection, ConnectionPool, MemoryDatabase,
    MemoryPool, RevisionRecord, StorageResult, StoredRow,
};
use crate::types::{Attributes, BranchId, Identity, Revision};
use crate::update_chain::UpdateChain;
use crate::values::{Lookup, Values};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub struct KnowledgeBase {
    pub(crate) config: KbConfig,
    pub(crate) schema: Arc<Schema>,
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) flex: Option<Arc<dyn FlexAttributeStore>>,
    pub(crate) branches: BranchRegistry,
    trunk: Arc<Branch>,
    pub(crate) cache: ObjectCache,
    pub(crate) chain: UpdateChain,
    pub(crate) refetch_lock: RefetchLock,
    listeners: RwLock<Vec<(ListenerPriority, Arc<dyn ChangeListener>)>>,
    pub(crate) vetoes: RwLock<Vec<Arc<dyn CommitVeto>>>,
    next_session: AtomicU64,
}

/// Builder for a [`KnowledgeBase`] over an arbitrary connection pool.
pub struct KnowledgeBaseBuilder {
    schema: Schema,
    pool: Arc<dyn ConnectionPool>,
    config: KbConfig,
    flex: Option<Arc<dyn FlexAttributeStore>>,
}

impl KnowledgeBaseBuilder {
    #[must_use]
    pub fn config(mut self, config: KbConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn flex_store(mut self, store: Arc<dyn FlexAttributeStore>) -> Self {
        self.flex = Some(store);
        self
    }

    /// Initialize the backend if needed and load its branches.
    pub fn open(self) -> Result<Arc<KnowledgeBase>> {
        let Self {
            schema,
            pool,
            config,
            flex,
        } = self;
        bootstrap(pool.as_ref(), &schema, &config)?;

        let (branches, last) = with_read_connection(pool.as_ref(), "load_branches", |c| {
            Ok((c.load_branches()?, c.last_revision()?))
        })?;
        let registry = BranchRegistry::new();
        for record in branches {
            registry.register(record);
        }
        let trunk = registry.get(BranchId::TRUNK)?;
        info!(
            revision = %last,
            branches = registry.all().len(),
            types = schema.type_names().count(),
            "knowledge base opened"
        );

        Ok(Arc::new(KnowledgeBase {
            config,
            schema: Arc::new(schema),
            pool,
            flex,
            branches: registry,
            trunk,
            cache: ObjectCache::new(),
            chain: UpdateChain::new(last),
            refetch_lock: RefetchLock::new(),
            listeners: RwLock::new(Vec::new()),
            vetoes: RwLock::new(Vec::new()),
            next_session: AtomicU64::new(1),
        }))
    }
}

/// Write the bootstrap revision and the trunk record on first use.
fn bootstrap(pool: &dyn ConnectionPool, schema: &Schema, config: &KbConfig) -> Result<()> {
    let mut conn = pool.borrow_write_connection()?;
    let result = (|| -> StorageResult<bool> {
        conn.begin()?;
        let initialized = conn
            .load_branches()?
            .iter()
            .any(|b| b.id == BranchId::TRUNK);
        if initialized {
            conn.rollback()?;
            return Ok(false);
        }
        conn.insert_revision(RevisionRecord {
            revision: Revision::INITIAL,
            author: config.default_author.clone(),
            message: "initialize".to_string(),
            timestamp: Utc::now(),
        })?;
        conn.insert_branch(trunk_record(schema.type_names()))?;
        conn.commit()?;
        Ok(true)
    })();
    match result {
        Ok(created) => {
            pool.release_write_connection(conn);
            if created {
                info!("initialized empty backend with trunk branch");
            }
            Ok(())
        }
        Err(err) => {
            if err.poisons_connection() {
                pool.invalidate_connection(conn);
            } else {
                rollback_write_connection(pool, conn);
            }
            Err(err.into())
        }
    }
}

impl KnowledgeBase {
    pub fn builder(schema: Schema, pool: Arc<dyn ConnectionPool>) -> KnowledgeBaseBuilder {
        KnowledgeBaseBuilder {
            schema,
            pool,
            config: KbConfig::default(),
            flex: None,
        }
    }

    /// A knowledge base over a fresh in-memory database.
    pub fn in_memory(schema: Schema) -> Result<Arc<Self>> {
        Self::open_shared(&MemoryDatabase::new(), schema, KbConfig::default())
    }

    /// A knowledge base over `db`, which other instances may share.
    pub fn open_shared(db: &Arc<MemoryDatabase>, schema: Schema, config: KbConfig) -> Result<Arc<Self>> {
        let pool = Arc::new(MemoryPool::new(Arc::clone(db), config.pool.clone()));
        Self::builder(schema, pool).config(config).open()
    }

    #[must_use]
    pub fn config(&self) -> &KbConfig {
        &self.config
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// A session on trunk.
    #[must_use]
    pub fn session(self: &Arc<Self>) -> Session {
        Session::new(self.next_session_id(), Arc::clone(self), Arc::clone(&self.trunk))
    }

    pub fn session_on(self: &Arc<Self>, branch: BranchId) -> Result<Session> {
        let branch = self.branches.get(branch)?;
        Ok(Session::new(self.next_session_id(), Arc::clone(self), branch))
    }

    fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Listeners of one priority run in registration order.
    pub fn add_listener(&self, priority: ListenerPriority, listener: Arc<dyn ChangeListener>) {
        self.listeners.write().push((priority, listener));
    }

    pub fn add_commit_veto(&self, veto: Arc<dyn CommitVeto>) {
        self.vetoes.write().push(veto);
    }

    pub(crate) fn listeners_snapshot(&self) -> Vec<Arc<dyn ChangeListener>> {
        let listeners = self.listeners.read();
        [ListenerPriority::High, ListenerPriority::Normal]
            .into_iter()
            .flat_map(|tier| {
                listeners
                    .iter()
                    .filter(move |(p, _)| *p == tier)
                    .map(|(_, l)| Arc::clone(l))
            })
            .collect()
    }

    /// Highest revision this process has incorporated.
    #[must_use]
    pub fn last_local_revision(&self) -> Revision {
        self.chain.last_local_revision()
    }

    /// Highest revision committed to the backend by anyone.
    pub fn latest_revision(&self) -> Result<Revision> {
        self.read("last_revision", |c| c.last_revision())
    }

    /// Commit records, oldest first.
    pub fn revisions(&self) -> Result<Vec<RevisionRecord>> {
        self.read("revision_records", |c| c.revision_records())
    }

    /// Every stored version of `identity`, oldest first.
    pub fn history(&self, identity: &Identity) -> Result<Vec<StoredRow>> {
        self.read("fetch_history", |c| {
            c.fetch_history(identity, Revision::INITIAL, Revision::CURRENT)
        })
    }

    pub fn branch(&self, id: BranchId) -> Result<Arc<Branch>> {
        self.branches.get(id)
    }

    #[must_use]
    pub fn branches(&self) -> Vec<Arc<Branch>> {
        self.branches.all()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ------------------------------------------------------------------
    // Storage access
    // ------------------------------------------------------------------

    pub(crate) fn read<T>(
        &self,
        op: &str,
        f: impl FnMut(&mut dyn Connection) -> StorageResult<T>,
    ) -> Result<T> {
        Ok(with_read_connection(self.pool.as_ref(), op, f)?)
    }

    /// Payload of a stored row, with flexible attributes merged back in.
    pub(crate) fn row_values(&self, row: &StoredRow) -> Result<Values> {
        let mut payload = row.attributes.clone();
        if let Some(flex) = &self.flex {
            if self.schema.descriptor(&row.type_name)?.flexible {
                payload.extend(flex.load(&row.identity(), row.rev_min)?);
            }
        }
        Ok(Values::new(payload, row.rev_min, row.rev_max))
    }

    /// Load the generation of `identity` that covers `revision`: the row
    /// visible at `revision` and every newer contiguous row.
    fn load_generation(
        &self,
        identity: &Identity,
        revision: Revision,
    ) -> Result<Option<(Vec<Values>, Revision)>> {
        let up_to = self.chain.last_local_revision().max(revision);
        let rows = self.read("fetch_history", |c| {
            c.fetch_history(identity, Revision::INITIAL, up_to)
        })?;
        let Some(pos) = rows.iter().position(|row| row.covers(revision)) else {
            return Ok(None);
        };
        let contiguous = |a: &StoredRow, b: &StoredRow| !a.is_live() && a.rev_max.next() == b.rev_min;

        let mut start = pos;
        while start > 0 && contiguous(&rows[start - 1], &rows[start]) {
            start -= 1;
        }
        let mut end = pos;
        while end + 1 < rows.len() && contiguous(&rows[end], &rows[end + 1]) {
            end += 1;
        }
        let values = rows[pos..=end]
            .iter()
            .map(|row| self.row_values(row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some((values, rows[start].rev_min)))
    }

    /// The current (mutable) instance of `identity` as seen at `revision`.
    ///
    /// `identity.branch` must already be the type's data branch.
    pub(crate) fn resolve_current(
        &self,
        identity: &Identity,
        revision: Revision,
    ) -> Result<Option<Arc<KnowledgeItem>>> {
        let key = identity.at(Revision::CURRENT);
        self.cache.find_or_create(&key, revision, || -> Result<_> {
            let Some((values, origin)) = self.load_generation(identity, revision)? else {
                return Ok(None);
            };
            let descriptor = Arc::clone(self.schema.descriptor(&identity.type_name)?);
            let mut values = values.into_iter();
            let Some(first) = values.next() else {
                return Ok(None);
            };
            let item = KnowledgeItem::persistent(
                identity,
                descriptor,
                first,
                origin,
                self.cache.reclaim_handle(),
            );
            for newer in values {
                item.update_values(newer);
            }
            debug!(key = %item.key(), %origin, "materialized");
            Ok(Some((item, origin)))
        })
    }

    /// The immutable instance of `identity` as of `revision`.
    pub(crate) fn resolve_historical(
        &self,
        identity: &Identity,
        revision: Revision,
    ) -> Result<Option<Arc<KnowledgeItem>>> {
        let key = identity.at(revision);
        self.cache.find_or_create(&key, revision, || -> Result<_> {
            let Some(row) = self.read("fetch", |c| c.fetch(identity, revision))? else {
                return Ok(None);
            };
            let descriptor = Arc::clone(self.schema.descriptor(&identity.type_name)?);
            let item = KnowledgeItem::historical(
                identity,
                revision,
                descriptor,
                self.row_values(&row)?,
                self.cache.reclaim_handle(),
            );
            Ok(Some((item, revision)))
        })
    }

    /// Route a row from a scan through the cache. A hit refreshes the
    /// existing instance instead of allocating a new one.
    pub(crate) fn materialize_row(
        &self,
        row: &StoredRow,
        as_of: Revision,
    ) -> Result<Option<Arc<KnowledgeItem>>> {
        let identity = row.identity();
        let key = identity.at(Revision::CURRENT);
        match self.cache.lookup(&key, as_of, false) {
            Some(item) => {
                item.update_values(self.row_values(row)?);
                Ok(Some(item))
            }
            None => self.resolve_current(&identity, as_of),
        }
    }

    /// Attribute payload of `item` at `revision`, loading older versions on
    /// demand.
    pub(crate) fn values_at(&self, item: &KnowledgeItem, revision: Revision) -> Result<Arc<Attributes>> {
        let lookup = match item.lookup(revision) {
            Lookup::Unloaded { oldest_loaded } => {
                let identity = item.identity();
                let rows = self.read("fetch_history", |c| {
                    c.fetch_history(&identity, revision, oldest_loaded.prev())
                })?;
                for row in &rows {
                    item.update_values(self.row_values(row)?);
                }
                debug!(key = %item.key(), %revision, loaded = rows.len(), "older versions loaded");
                item.lookup(revision)
            }
            other => other,
        };
        match lookup {
            Lookup::Found(values) => Ok(Arc::clone(values.payload())),
            Lookup::Deleted { last_live } => Err(KbError::DeletedObjectAccess {
                key: item.identity().at(revision),
                last_live: Some(item.identity().at(last_live)),
            }),
            Lookup::Unborn | Lookup::Unloaded { .. } => Err(KbError::DeletedObjectAccess {
                key: item.identity().at(revision),
                last_live: None,
            }),
        }
    }
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("last_local", &self.chain.last_local_revision())
            .field("branches", &self.branches.all().len())
            .field("cache", &self.cache.stats())
            .finish_non_exhaustive()
    }
}
