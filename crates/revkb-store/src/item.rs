//! Materialized objects.
//!
//! A [`KnowledgeItem`] is the in-memory handle for one object version key.
//! Current items (history `CURRENT`) own the [`ValuesChain`] of one
//! generation and are shared by every session of the process; historical
//! items hold the single version visible at their history revision.
//!
//! Items are reference counted by their users. The object cache only keeps
//! weak handles, and an item that drops pushes its key onto the cache's
//! reclaim queue so the slot can be swept.

use crate::schema::TypeDescriptor;
use crate::types::{Identity, ObjectId, ObjectKey, Revision, TypeName};
use crate::values::{Lookup, UpdateOutcome, Values, ValuesChain};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Created by a session, not committed yet.
    New,
    Persistent,
    /// A new item whose transaction was rolled back.
    Invalid,
}

impl ItemState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ItemState::New,
            1 => ItemState::Persistent,
            _ => ItemState::Invalid,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ItemState::New => 0,
            ItemState::Persistent => 1,
            ItemState::Invalid => 2,
        }
    }
}

/// Keys of items that were dropped since the last sweep.
#[derive(Debug, Default)]
pub(crate) struct ReclaimQueue {
    keys: Mutex<Vec<ObjectKey>>,
}

impl ReclaimQueue {
    pub(crate) fn push(&self, key: ObjectKey) {
        self.keys.lock().push(key);
    }

    pub(crate) fn drain(&self) -> Vec<ObjectKey> {
        std::mem::take(&mut *self.keys.lock())
    }
}

pub struct KnowledgeItem {
    key: ObjectKey,
    descriptor: Arc<TypeDescriptor>,
    state: AtomicU8,
    values: Mutex<ValuesChain>,
    reclaim: Weak<ReclaimQueue>,
}

impl KnowledgeItem {
    /// A session-local item; it gets values when its creation commits.
    pub(crate) fn new_local(
        identity: &Identity,
        descriptor: Arc<TypeDescriptor>,
        reclaim: Weak<ReclaimQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: identity.at(Revision::CURRENT),
            descriptor,
            state: AtomicU8::new(ItemState::New.as_u8()),
            values: Mutex::new(ValuesChain::default()),
            reclaim,
        })
    }

    /// A current item loaded from storage.
    pub(crate) fn persistent(
        identity: &Identity,
        descriptor: Arc<TypeDescriptor>,
        values: Values,
        origin: Revision,
        reclaim: Weak<ReclaimQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: identity.at(Revision::CURRENT),
            descriptor,
            state: AtomicU8::new(ItemState::Persistent.as_u8()),
            values: Mutex::new(ValuesChain::new(values, origin)),
            reclaim,
        })
    }

    /// The immutable view of `identity` at `history`.
    pub(crate) fn historical(
        identity: &Identity,
        history: Revision,
        descriptor: Arc<TypeDescriptor>,
        values: Values,
        reclaim: Weak<ReclaimQueue>,
    ) -> Arc<Self> {
        let origin = values.min();
        Arc::new(Self {
            key: identity.at(history),
            descriptor,
            state: AtomicU8::new(ItemState::Persistent.as_u8()),
            values: Mutex::new(ValuesChain::new(values, origin)),
            reclaim,
        })
    }

    #[must_use]
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    #[must_use]
    pub fn identity(&self) -> Identity {
        self.key.identity()
    }

    #[must_use]
    pub fn type_name(&self) -> &TypeName {
        &self.key.type_name
    }

    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.key.id
    }

    #[must_use]
    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    #[must_use]
    pub fn is_historical(&self) -> bool {
        !self.key.is_current()
    }

    #[must_use]
    pub fn state(&self) -> ItemState {
        ItemState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        self.state() == ItemState::New
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state() != ItemState::Invalid
    }

    /// Revision the item's generation started at, once known.
    #[must_use]
    pub fn origin(&self) -> Option<Revision> {
        self.values.lock().origin()
    }

    #[must_use]
    pub fn lookup(&self, revision: Revision) -> Lookup {
        self.values.lock().lookup(revision)
    }

    #[must_use]
    pub fn is_alive_at(&self, revision: Revision) -> bool {
        self.values.lock().is_alive(revision)
    }

    #[must_use]
    pub fn head(&self) -> Option<Values> {
        self.values.lock().head().cloned()
    }

    /// Loaded versions, newest first.
    #[must_use]
    pub fn loaded_values(&self) -> Vec<Values> {
        self.values.lock().iter().cloned().collect()
    }

    pub(crate) fn update_values(&self, values: Values) -> UpdateOutcome {
        self.values.lock().update_values(values)
    }

    pub(crate) fn cap(&self, last_valid: Revision) -> bool {
        self.values.lock().cap(last_valid)
    }

    pub(crate) fn prune_before(&self, revision: Revision) -> usize {
        self.values.lock().prune_before(revision)
    }

    /// Attach the committed values of a new item.
    pub(crate) fn make_persistent(&self, values: Values) {
        let origin = values.min();
        *self.values.lock() = ValuesChain::new(values, origin);
        self.state
            .store(ItemState::Persistent.as_u8(), Ordering::Release);
    }

    pub(crate) fn invalidate(&self) {
        let _ = self.state.compare_exchange(
            ItemState::New.as_u8(),
            ItemState::Invalid.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl fmt::Debug for KnowledgeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeItem")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for KnowledgeItem {
    fn drop(&mut self) {
        if let Some(queue) = self.reclaim.upgrade() {
            queue.push(self.key.clone());
        }
    }
}
