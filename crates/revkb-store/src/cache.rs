//! Process-wide object cache.
//!
//! Maps an [`ObjectKey`] to a weakly held [`KnowledgeItem`]. Each slot
//! describes which item instance represents the key over which revision
//! span:
//!
//! ```text
//! Entry(item, [min, CURRENT])          one known generation
//! Chain([gen3 [9, CURRENT], gen2 [4, 8], gen1 [1, 3]])   newest first
//! ```
//!
//! A new generation is created when an object is deleted and later
//! recreated under the same identity. Within one slot the spans are disjoint,
//! so at most one instance ever represents a given key at a given revision.
//!
//! Entries of dropped items are reclaimed lazily: a dropping item pushes its
//! key onto the reclaim queue and [`ObjectCache::sweep`] removes dead entries
//! before every mutation and before every lookup miss.

use crate::item::{KnowledgeItem, ReclaimQueue};
use crate::types::{ObjectKey, Revision};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

#[derive(Debug, Clone)]
struct CacheEntry {
    item: Weak<KnowledgeItem>,
    min: Revision,
    max: Revision,
}

impl CacheEntry {
    fn covers(&self, revision: Revision) -> bool {
        self.min <= revision && revision <= self.max
    }

    fn is_dead(&self) -> bool {
        self.item.strong_count() == 0
    }
}

#[derive(Debug)]
enum CacheSlot {
    Entry(CacheEntry),
    /// Newest first.
    Chain(Vec<CacheEntry>),
}

impl CacheSlot {
    fn entries(&self) -> &[CacheEntry] {
        match self {
            CacheSlot::Entry(e) => std::slice::from_ref(e),
            CacheSlot::Chain(c) => c,
        }
    }

    fn into_entries(self) -> Vec<CacheEntry> {
        match self {
            CacheSlot::Entry(e) => vec![e],
            CacheSlot::Chain(c) => c,
        }
    }

    fn from_entries(mut entries: Vec<CacheEntry>) -> Option<CacheSlot> {
        match entries.len() {
            0 => None,
            1 => entries.pop().map(CacheSlot::Entry),
            _ => Some(CacheSlot::Chain(entries)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub slots: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ObjectCache {
    slots: Mutex<AHashMap<ObjectKey, CacheSlot>>,
    reclaim: Arc<ReclaimQueue>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(AHashMap::new()),
            reclaim: Arc::new(ReclaimQueue::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Handle passed to items so their drop can be observed.
    pub(crate) fn reclaim_handle(&self) -> Weak<ReclaimQueue> {
        Arc::downgrade(&self.reclaim)
    }

    /// The instance representing `key` at `as_of`.
    ///
    /// Unless `include_deleted` is set, an instance whose generation is not
    /// alive at `as_of` counts as a miss.
    #[must_use]
    pub fn lookup(
        &self,
        key: &ObjectKey,
        as_of: Revision,
        include_deleted: bool,
    ) -> Option<Arc<KnowledgeItem>> {
        let found = {
            let slots = self.slots.lock();
            slots.get(key).and_then(|slot| {
                slot.entries()
                    .iter()
                    .find(|e| e.covers(as_of))
                    .and_then(|e| e.item.upgrade())
            })
        };
        match found {
            Some(item) if include_deleted || item.is_alive_at(as_of) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(item)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.sweep();
                None
            }
        }
    }

    /// The newest live generation of `key`, whatever revision it covers.
    #[must_use]
    pub fn newest(&self, key: &ObjectKey) -> Option<Arc<KnowledgeItem>> {
        let slots = self.slots.lock();
        slots
            .get(key)
            .and_then(|slot| slot.entries().first())
            .and_then(|e| e.item.upgrade())
    }

    /// Register `item` as the instance for its key from `from_revision` on.
    ///
    /// If a live instance already covers exactly that span, it is returned
    /// instead and `item` is discarded, which keeps lookups idempotent when
    /// two threads materialize the same object concurrently.
    pub fn insert(&self, item: Arc<KnowledgeItem>, from_revision: Revision) -> Arc<KnowledgeItem> {
        self.sweep();
        let key = item.key().clone();
        let mut slots = self.slots.lock();
        let mut entries = slots.remove(&key).map(CacheSlot::into_entries).unwrap_or_default();

        if let Some(existing) = entries.iter_mut().find(|e| e.min == from_revision) {
            if let Some(live) = existing.item.upgrade() {
                if let Some(slot) = CacheSlot::from_entries(entries) {
                    slots.insert(key, slot);
                }
                return live;
            }
            existing.item = Arc::downgrade(&item);
        } else {
            let pos = entries.partition_point(|e| e.min > from_revision);
            let max = match pos {
                0 => Revision::CURRENT,
                _ => entries[pos - 1].min.prev(),
            };
            if let Some(older) = entries.get_mut(pos) {
                if older.max >= from_revision {
                    older.max = from_revision.prev();
                }
            }
            entries.insert(
                pos,
                CacheEntry {
                    item: Arc::downgrade(&item),
                    min: from_revision,
                    max,
                },
            );
        }

        trace!(%key, from = %from_revision, generations = entries.len(), "cache insert");
        if let Some(slot) = CacheSlot::from_entries(entries) {
            slots.insert(key, slot);
        }
        item
    }

    /// Look up `key` at `as_of` or materialize it with `create`.
    ///
    /// `create` runs without the cache lock held and returns the new item
    /// together with the revision its generation starts at.
    pub fn find_or_create<E>(
        &self,
        key: &ObjectKey,
        as_of: Revision,
        create: impl FnOnce() -> std::result::Result<Option<(Arc<KnowledgeItem>, Revision)>, E>,
    ) -> std::result::Result<Option<Arc<KnowledgeItem>>, E> {
        if let Some(item) = self.lookup(key, as_of, false) {
            return Ok(Some(item));
        }
        Ok(create()?.map(|(item, from)| self.insert(item, from)))
    }

    /// Remove entries whose items were dropped.
    pub fn sweep(&self) -> usize {
        let keys = self.reclaim.drain();
        if keys.is_empty() {
            return 0;
        }
        let mut removed = 0;
        let mut slots = self.slots.lock();
        for key in keys {
            let Some(slot) = slots.remove(&key) else {
                continue;
            };
            let mut entries = slot.into_entries();
            let before = entries.len();
            entries.retain(|e| !e.is_dead());
            removed += before - entries.len();
            if let Some(first) = entries.first_mut() {
                first.max = Revision::CURRENT;
            }
            if let Some(slot) = CacheSlot::from_entries(entries) {
                slots.insert(key, slot);
            }
        }
        if removed > 0 {
            trace!(removed, remaining = slots.len(), "cache swept");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            slots: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
