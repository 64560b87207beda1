//! Per-session write buffer.
//!
//! A [`TransactionContext`] records everything a session changed since its
//! last commit or rollback:
//!
//! - `new`: items created locally, with their full attribute payload,
//! - `changed`: persistent items with a local copy of their attributes and
//!   the set of attributes the session actually wrote,
//! - `removed`: persistent items deleted locally, with the values they had
//!   when the session deleted them.
//!
//! Reads through the owning session consult these buffers first
//! (read-your-writes). When the session advances past revisions published by
//! others, [`TransactionContext::merge`] compares each event with the local
//! buffers and records conflicts; commit refuses to proceed while any are
//! pending.
//!
//! Nested transactions are a stack of flags over the same buffers: an inner
//! commit only pops its level, an inner rollback marks the enclosing level as
//! failed so the outermost commit can only roll back.

use crate::error::{ConflictKind, KbError, MergeConflict, MergeConflicts, Result};
use crate::event::ChangeEvent;
use crate::item::KnowledgeItem;
use crate::types::{AttrValue, Attributes, Identity, Revision};
use ahash::AHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub(crate) struct NewEntry {
    pub(crate) item: Arc<KnowledgeItem>,
    pub(crate) values: Attributes,
}

#[derive(Debug)]
pub(crate) struct ChangedEntry {
    pub(crate) item: Arc<KnowledgeItem>,
    /// Committed values the local copy was taken from.
    pub(crate) base: Arc<Attributes>,
    pub(crate) values: Attributes,
    pub(crate) dirty: BTreeSet<String>,
}

#[derive(Debug)]
pub(crate) struct RemovedEntry {
    pub(crate) item: Arc<KnowledgeItem>,
    pub(crate) base: Arc<Attributes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Open,
    /// Inside the commit coordinator.
    Committing,
    /// Committed or rolled back; a session starts a fresh context next time.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NestingExit {
    /// An inner level ended; the buffers stay open.
    Inner,
    Outermost { rollback_only: bool },
}

#[derive(Debug)]
struct Nesting {
    failed: bool,
    outer: Option<Box<Nesting>>,
}

#[derive(Debug)]
pub struct TransactionContext {
    session: u64,
    new: BTreeMap<Identity, NewEntry>,
    changed: BTreeMap<Identity, ChangedEntry>,
    removed: BTreeMap<Identity, RemovedEntry>,
    /// Target identity -> local items whose buffers reference it.
    references: AHashMap<Identity, BTreeSet<Identity>>,
    nesting: Option<Box<Nesting>>,
    state: ContextState,
    locked: bool,
    conflicts: Vec<MergeConflict>,
    message: Option<String>,
    author: Option<String>,
}

impl TransactionContext {
    #[must_use]
    pub fn new(session: u64) -> Self {
        Self {
            session,
            new: BTreeMap::new(),
            changed: BTreeMap::new(),
            removed: BTreeMap::new(),
            references: AHashMap::new(),
            nesting: None,
            state: ContextState::Open,
            locked: false,
            conflicts: Vec::new(),
            message: None,
            author: None,
        }
    }

    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }

    #[must_use]
    pub fn state(&self) -> ContextState {
        self.state
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Explicit nesting levels currently open.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut level = self.nesting.as_deref();
        while let Some(n) = level {
            depth += 1;
            level = n.outer.as_deref();
        }
        depth
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn check_modifiable(&self) -> Result<()> {
        if self.locked {
            return Err(KbError::illegal_state(
                "transaction context is locked while listeners run",
            ));
        }
        match self.state {
            ContextState::Open => Ok(()),
            ContextState::Committing => Err(KbError::illegal_state("commit in progress")),
            ContextState::Closed => Err(KbError::illegal_state("transaction already finished")),
        }
    }

    pub(crate) fn lock(&mut self) {
        self.locked = true;
    }

    pub(crate) fn unlock(&mut self) {
        self.locked = false;
    }

    // ------------------------------------------------------------------
    // Nesting
    // ------------------------------------------------------------------

    pub(crate) fn begin_nested(&mut self) -> Result<usize> {
        self.check_modifiable()?;
        let outer = self.nesting.take();
        self.nesting = Some(Box::new(Nesting {
            failed: false,
            outer,
        }));
        Ok(self.depth())
    }

    /// Close the innermost level. An unsuccessful inner level poisons the
    /// level around it.
    pub(crate) fn end_nested(&mut self, success: bool) -> Result<NestingExit> {
        self.check_modifiable()?;
        let Some(top) = self.nesting.take() else {
            return Ok(NestingExit::Outermost {
                rollback_only: false,
            });
        };
        let failed = top.failed || !success;
        match top.outer {
            Some(mut outer) => {
                outer.failed |= failed;
                self.nesting = Some(outer);
                Ok(NestingExit::Inner)
            }
            None => Ok(NestingExit::Outermost {
                rollback_only: top.failed,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    pub(crate) fn put_new(&mut self, item: Arc<KnowledgeItem>, values: Attributes) -> Result<()> {
        self.check_modifiable()?;
        let identity = item.identity();
        if self.new.contains_key(&identity) {
            item.invalidate();
            return Err(KbError::illegal_state(format!(
                "{identity} was already created in this transaction"
            )));
        }
        self.new.insert(identity, NewEntry { item, values });
        Ok(())
    }

    /// All-or-nothing registration of several new items.
    pub(crate) fn put_new_batch(&mut self, items: Vec<(Arc<KnowledgeItem>, Attributes)>) -> Result<()> {
        self.check_modifiable()?;
        let mut registered = Vec::with_capacity(items.len());
        let mut failure = None;
        let mut rest = items.into_iter();
        for (item, values) in rest.by_ref() {
            let identity = item.identity();
            if self.new.contains_key(&identity) {
                item.invalidate();
                failure = Some(identity);
                break;
            }
            self.new.insert(identity.clone(), NewEntry { item, values });
            registered.push(identity);
        }
        let Some(clash) = failure else {
            return Ok(());
        };
        for identity in registered {
            if let Some(entry) = self.new.remove(&identity) {
                entry.item.invalidate();
            }
        }
        for (item, _) in rest {
            item.invalidate();
        }
        Err(KbError::illegal_state(format!(
            "{clash} was already created in this transaction"
        )))
    }

    /// Start tracking a persistent item. Returns false if it already was.
    pub(crate) fn mark_changed(&mut self, item: &Arc<KnowledgeItem>, base: Arc<Attributes>) -> bool {
        let identity = item.identity();
        if self.changed.contains_key(&identity) || self.new.contains_key(&identity) {
            return false;
        }
        let values = (*base).clone();
        self.changed.insert(
            identity,
            ChangedEntry {
                item: Arc::clone(item),
                base,
                values,
                dirty: BTreeSet::new(),
            },
        );
        true
    }

    /// Write one attribute into the local buffer. Returns the previous
    /// local value.
    pub(crate) fn set_local(
        &mut self,
        identity: &Identity,
        attribute: &str,
        value: AttrValue,
    ) -> Result<Option<AttrValue>> {
        self.check_modifiable()?;
        if let Some(entry) = self.new.get_mut(identity) {
            return Ok(entry.values.insert(attribute.to_string(), value));
        }
        if let Some(entry) = self.changed.get_mut(identity) {
            entry.dirty.insert(attribute.to_string());
            return Ok(entry.values.insert(attribute.to_string(), value));
        }
        Err(KbError::illegal_state(format!(
            "{identity} is not registered for writing"
        )))
    }

    /// Delete an item locally. Returns true for persistent items, false for
    /// items created in this transaction (those are simply forgotten).
    pub(crate) fn remove(&mut self, item: &Arc<KnowledgeItem>, base: Arc<Attributes>) -> Result<bool> {
        self.check_modifiable()?;
        let identity = item.identity();
        self.drop_referrer(&identity);
        if let Some(entry) = self.new.remove(&identity) {
            entry.item.invalidate();
            return Ok(false);
        }
        // The local copy stays readable; only the committed values describe
        // the deletion.
        let base = self
            .changed
            .get(&identity)
            .map_or(base, |entry| Arc::clone(&entry.base));
        self.removed.insert(
            identity,
            RemovedEntry {
                item: Arc::clone(item),
                base,
            },
        );
        Ok(true)
    }

    pub(crate) fn note_reference(&mut self, target: Identity, referrer: Identity) {
        self.references.entry(target).or_default().insert(referrer);
    }

    pub(crate) fn drop_reference(&mut self, target: &Identity, referrer: &Identity) {
        if let Some(set) = self.references.get_mut(target) {
            set.remove(referrer);
            if set.is_empty() {
                self.references.remove(target);
            }
        }
    }

    fn drop_referrer(&mut self, referrer: &Identity) {
        self.references.retain(|_, set| {
            set.remove(referrer);
            !set.is_empty()
        });
    }

    /// Local items whose buffers currently reference `target`.
    #[must_use]
    pub fn referrers_of(&self, target: &Identity) -> Vec<Identity> {
        self.references
            .get(target)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_new(&self, identity: &Identity) -> Option<&Arc<KnowledgeItem>> {
        self.new.get(identity).map(|e| &e.item)
    }

    #[must_use]
    pub fn is_new(&self, identity: &Identity) -> bool {
        self.new.contains_key(identity)
    }

    #[must_use]
    pub fn is_changed(&self, identity: &Identity) -> bool {
        self.changed.contains_key(identity) && !self.removed.contains_key(identity)
    }

    #[must_use]
    pub fn is_removed(&self, identity: &Identity) -> bool {
        self.removed.contains_key(identity)
    }

    /// The session's own view of a new or changed item. A changed item
    /// deleted afterwards keeps its local copy.
    #[must_use]
    pub fn local_values(&self, identity: &Identity) -> Option<&Attributes> {
        self.new
            .get(identity)
            .map(|e| &e.values)
            .or_else(|| self.changed.get(identity).map(|e| &e.values))
    }

    pub(crate) fn new_entries(&self) -> impl Iterator<Item = (&Identity, &NewEntry)> {
        self.new.iter()
    }

    /// Changed items that were not deleted afterwards.
    pub(crate) fn changed_entries(&self) -> impl Iterator<Item = (&Identity, &ChangedEntry)> {
        self.changed
            .iter()
            .filter(|(identity, _)| !self.removed.contains_key(*identity))
    }

    pub(crate) fn removed_entries(&self) -> impl Iterator<Item = (&Identity, &RemovedEntry)> {
        self.removed.iter()
    }

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    /// Fold a revision published by someone else into the local view.
    /// Returns the number of conflicts it caused.
    pub fn merge(&mut self, event: &ChangeEvent) -> usize {
        let before = self.conflicts.len();
        let revision = event.revision;

        for change in &event.created {
            let identity = change.identity();
            if self.new.contains_key(&identity) {
                self.conflict(ConflictKind::ConcurrentCreation, identity, revision, Vec::new(), None);
            }
        }

        for change in &event.updated {
            let identity = change.identity();
            let changed_attrs = change.changed_attributes();
            if self.removed.contains_key(&identity) {
                self.conflict(
                    ConflictKind::DeletedThenChanged,
                    identity,
                    revision,
                    changed_attrs.into_iter().collect(),
                    None,
                );
                continue;
            }
            let Some(entry) = self.changed.get_mut(&identity) else {
                continue;
            };
            let overlap: Vec<String> = entry.dirty.intersection(&changed_attrs).cloned().collect();
            if !overlap.is_empty() {
                self.conflict(ConflictKind::ConcurrentChange, identity, revision, overlap, None);
                continue;
            }
            if let Some(after) = &change.after {
                for name in &changed_attrs {
                    match after.get(name) {
                        Some(v) => entry.values.insert(name.clone(), v.clone()),
                        None => entry.values.remove(name),
                    };
                }
                entry.base = Arc::clone(after);
            }
        }

        for change in &event.deleted {
            let identity = change.identity();
            if self.removed.remove(&identity).is_some() {
                self.changed.remove(&identity);
                debug!(session = self.session, %identity, "local deletion already published");
                continue;
            }
            if let Some(entry) = self.changed.get(&identity) {
                let dirty = entry.dirty.iter().cloned().collect();
                self.conflict(ConflictKind::ChangedThenDeleted, identity.clone(), revision, dirty, None);
            }
            for referrer in self.referrers_of(&identity) {
                self.conflict(
                    ConflictKind::DanglingReference,
                    identity.clone(),
                    revision,
                    Vec::new(),
                    Some(referrer),
                );
            }
        }

        self.conflicts.len() - before
    }

    fn conflict(
        &mut self,
        kind: ConflictKind,
        identity: Identity,
        revision: Revision,
        attributes: Vec<String>,
        referrer: Option<Identity>,
    ) {
        debug!(session = self.session, ?kind, %identity, %revision, "merge conflict");
        self.conflicts.push(MergeConflict {
            kind,
            identity,
            revision,
            attributes,
            referrer,
        });
    }

    #[must_use]
    pub fn conflicts(&self) -> &[MergeConflict] {
        &self.conflicts
    }

    pub fn check_conflicts(&self) -> Result<()> {
        if self.conflicts.is_empty() {
            Ok(())
        } else {
            Err(KbError::MergeConflict(MergeConflicts(self.conflicts.clone())))
        }
    }

    // ------------------------------------------------------------------
    // Commit metadata and lifecycle
    // ------------------------------------------------------------------

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn set_author(&mut self, author: impl Into<String>) {
        self.author = Some(author.into());
    }

    #[must_use]
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub(crate) fn begin_commit(&mut self) -> Result<()> {
        self.check_modifiable()?;
        self.state = ContextState::Committing;
        Ok(())
    }

    /// The commit did not happen; the buffers remain usable.
    pub(crate) fn resume(&mut self) {
        if self.state == ContextState::Committing {
            self.state = ContextState::Open;
        }
    }

    /// The commit was published.
    pub(crate) fn finish(&mut self) {
        self.state = ContextState::Closed;
    }

    /// Throw every local change away. New items become invalid.
    pub(crate) fn discard(&mut self) {
        for entry in self.new.values() {
            entry.item.invalidate();
        }
        self.new.clear();
        self.changed.clear();
        self.removed.clear();
        self.references.clear();
        self.conflicts.clear();
        self.nesting = None;
        self.locked = false;
        self.state = ContextState::Closed;
    }
}
