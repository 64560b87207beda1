//! Refetch: catching this process up with revisions committed elsewhere.
//!
//! One process-wide [`RefetchLock`] serializes commits, refetches and branch
//! creation. While holding it, [`KnowledgeBase::refetch_locked`] scans the
//! backend for revisions after the last one processed, applies them to cached
//! items and appends one update-chain link per revision. Publication to
//! listeners happens after the lock is released, strictly in revision order.

use crate::error::{KbError, Result};
use crate::event::{ChangeEvent, EventOrigin, ObjectChange};
use crate::kb::KnowledgeBase;
use crate::session::Session;
use crate::storage::{BranchRecord, RevisionChanges, RevisionRecord, StoredRow};
use crate::types::{Attributes, Identity, Revision};
use crate::update_chain::{Cleanup, UpdateChain, UpdateLink};
use crate::values::{UpdateOutcome, Values};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Holder {
    Commit { session: u64 },
    Refetch,
    Branch,
}

pub(crate) struct RefetchLock {
    held: Mutex<Option<Holder>>,
    released: Condvar,
}

pub(crate) struct RefetchGuard<'a> {
    lock: &'a RefetchLock,
}

impl RefetchLock {
    pub(crate) fn new() -> Self {
        Self {
            held: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// Wait up to `timeout` for the lock. On timeout nothing has changed and
    /// the caller may simply retry.
    pub(crate) fn acquire(&self, holder: Holder, timeout: Duration) -> Result<RefetchGuard<'_>> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut held = self.held.lock();
        while let Some(current) = *held {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.is_some() {
                warn!(?holder, ?current, waited_ms = started.elapsed().as_millis() as u64, "refetch lock timeout");
                return Err(KbError::RefetchTimeout {
                    waited: started.elapsed(),
                });
            }
        }
        *held = Some(holder);
        Ok(RefetchGuard { lock: self })
    }

    #[cfg(test)]
    pub(crate) fn holder(&self) -> Option<Holder> {
        *self.held.lock()
    }
}

impl Drop for RefetchGuard<'_> {
    fn drop(&mut self) {
        *self.lock.held.lock() = None;
        self.lock.released.notify_one();
    }
}

/// One remote revision, fully read and ready to apply.
struct RemoteRevision {
    revision: Revision,
    record: RevisionRecord,
    branch: Option<BranchRecord>,
    written: Vec<RemoteWrite>,
    deleted: Vec<(Identity, Arc<Attributes>)>,
}

/// A row version written by a remote revision; `before` is set when it
/// replaced an older version.
struct RemoteWrite {
    identity: Identity,
    values: Values,
    before: Option<Arc<Attributes>>,
}

/// Marks a revision as announced even if a listener panics.
struct Announce<'a> {
    chain: &'a UpdateChain,
    revision: Revision,
}

impl Drop for Announce<'_> {
    fn drop(&mut self) {
        self.chain.announce(self.revision);
    }
}

impl KnowledgeBase {
    /// Catch the process up with the latest committed revision.
    ///
    /// Returns the number of revisions published.
    pub fn refetch(&self) -> Result<usize> {
        let links = {
            let _guard = self
                .refetch_lock
                .acquire(Holder::Refetch, self.config.refetch_timeout())?;
            let up_to = self.read("last_revision", |c| c.last_revision())?;
            self.refetch_locked(up_to)?
        };
        self.publish(&links, None);
        Ok(links.len())
    }

    /// Apply every revision in `(last_local, up_to]`. Caller holds the
    /// refetch lock and must [`publish`](Self::publish) the returned links
    /// after releasing it.
    ///
    /// All revisions are read before any is applied, so a failed read leaves
    /// the cache and the update chain untouched.
    pub(crate) fn refetch_locked(&self, up_to: Revision) -> Result<Vec<Arc<UpdateLink>>> {
        let after = self.chain.last_local_revision();
        if up_to <= after {
            return Ok(Vec::new());
        }
        let changes = self.read("scan_changes", |c| c.scan_changes(after, up_to))?;
        let mut decoded = Vec::with_capacity(changes.len());
        for revision_changes in changes {
            let revision = revision_changes.revision;
            match self.decode_remote(revision_changes)? {
                Some(remote) => decoded.push(remote),
                None => warn!(%revision, "change scan returned a revision without record"),
            }
        }

        let links: Vec<_> = decoded
            .into_iter()
            .map(|remote| {
                let (event, cleanups) = self.apply_remote(remote);
                self.chain.append(Arc::new(event), cleanups)
            })
            .collect();
        self.chain.catch_up(up_to);
        if !links.is_empty() {
            info!(from = %after, to = %up_to, revisions = links.len(), "refetched");
        }
        Ok(links)
    }

    /// Read the payloads of one remote revision, flexible attributes
    /// included. Touches no cached state.
    fn decode_remote(&self, changes: RevisionChanges) -> Result<Option<RemoteRevision>> {
        let RevisionChanges {
            revision,
            record,
            created,
            outdated,
            branch,
        } = changes;
        let Some(record) = record else {
            return Ok(None);
        };
        let mut outdated: BTreeMap<Identity, StoredRow> =
            outdated.into_iter().map(|row| (row.identity(), row)).collect();

        let mut written = Vec::with_capacity(created.len());
        for row in created {
            let identity = row.identity();
            let values = self.row_values(&row)?;
            let before = match outdated.remove(&identity) {
                Some(old) => Some(Arc::clone(self.row_values(&old)?.payload())),
                None => None,
            };
            written.push(RemoteWrite {
                identity,
                values,
                before,
            });
        }
        let mut deleted = Vec::with_capacity(outdated.len());
        for (identity, old) in outdated {
            deleted.push((identity, Arc::clone(self.row_values(&old)?.payload())));
        }

        Ok(Some(RemoteRevision {
            revision,
            record,
            branch,
            written,
            deleted,
        }))
    }

    fn apply_remote(&self, remote: RemoteRevision) -> (ChangeEvent, Vec<Cleanup>) {
        let RemoteRevision {
            revision,
            record,
            branch,
            written,
            deleted,
        } = remote;
        if let Some(branch) = &branch {
            self.branches.register(branch.clone());
            debug!(branch = %branch.id, %revision, "remote branch registered");
        }

        let mut event = ChangeEvent {
            revision,
            record,
            origin: EventOrigin::Remote,
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            branch_created: branch,
        };
        let mut cleanups = Vec::new();

        for RemoteWrite {
            identity,
            values,
            before,
        } in written
        {
            let after = Arc::clone(values.payload());
            let key = identity.at(revision);
            match before {
                Some(before) => {
                    if let Some(item) = self.live_item(&identity, revision) {
                        if let UpdateOutcome::Prepended { superseded: Some(_) } =
                            item.update_values(values)
                        {
                            cleanups.push(Cleanup {
                                item: Arc::downgrade(&item),
                                before: revision,
                            });
                        }
                    }
                    event.updated.push(ObjectChange {
                        key,
                        before: Some(before),
                        after: Some(after),
                    });
                }
                None => event.created.push(ObjectChange {
                    key,
                    before: None,
                    after: Some(after),
                }),
            }
        }

        for (identity, before) in deleted {
            if let Some(item) = self.live_item(&identity, revision) {
                item.cap(revision.prev());
            }
            event.deleted.push(ObjectChange {
                key: identity.at(revision),
                before: Some(before),
                after: None,
            });
        }

        if !self.config.cleanup_history {
            cleanups.clear();
        }
        (event, cleanups)
    }

    /// The cached generation of `identity` that is alive right before
    /// `revision`, if any.
    fn live_item(
        &self,
        identity: &Identity,
        revision: Revision,
    ) -> Option<Arc<crate::item::KnowledgeItem>> {
        self.cache
            .newest(&identity.at(Revision::CURRENT))
            .filter(|item| item.is_alive_at(revision.prev()))
    }

    /// Run listeners for each link, in revision order across all threads.
    /// Waits for the listeners of every earlier revision to finish first.
    /// Only the last link may be the committing session's own revision.
    pub(crate) fn publish(&self, links: &[Arc<UpdateLink>], mut session: Option<&mut Session>) {
        if links.is_empty() {
            return;
        }
        let listeners = self.listeners_snapshot();
        let warn_every = self.config.refetch_timeout();
        // Unwinding out of a listener must not strand publishers of later
        // revisions behind the rest of this batch.
        let _batch = links.last().map(|link| Announce {
            chain: &self.chain,
            revision: link.revision(),
        });
        for (i, link) in links.iter().enumerate() {
            let Some(event) = link.event() else {
                continue;
            };
            if let Some(prev) = link.prev_revision() {
                self.chain.wait_announced(prev, warn_every);
            }
            let _announce = Announce {
                chain: &self.chain,
                revision: link.revision(),
            };
            let own = i + 1 == links.len();
            for listener in &listeners {
                let session = if own { session.as_deref_mut() } else { None };
                listener.on_change(event, session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_times_out_without_side_effects() {
        let lock = RefetchLock::new();
        let guard = lock.acquire(Holder::Commit { session: 1 }, Duration::from_secs(1)).unwrap();

        let err = lock
            .acquire(Holder::Refetch, Duration::from_millis(30))
            .err()
            .unwrap();
        assert!(matches!(err, KbError::RefetchTimeout { waited } if waited >= Duration::from_millis(30)));
        assert_eq!(lock.holder(), Some(Holder::Commit { session: 1 }));

        drop(guard);
        assert_eq!(lock.holder(), None);
        let _again = lock.acquire(Holder::Branch, Duration::from_millis(30)).unwrap();
    }

    #[test]
    fn waiters_get_the_lock_once_released() {
        let lock = Arc::new(RefetchLock::new());
        let guard = lock.acquire(Holder::Refetch, Duration::from_secs(1)).unwrap();
        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                lock.acquire(Holder::Commit { session: 2 }, Duration::from_secs(5))
                    .map(|_| ())
                    .is_ok()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap());
    }
}
