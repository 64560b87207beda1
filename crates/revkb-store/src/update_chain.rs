//! Forward-linked list of published revisions.
//!
//! ```text
//!  session A ──┐            session B ──┐
//!              v                        v
//!   [r3] ──> [r5] ──> [r6] ──> [r9] ──> [r10]  <── tail
//! ```
//!
//! Each session pins the link of the revision it reads at. Holding a link
//! keeps every later link alive, so the chain from the oldest pinned link to
//! the tail is exactly the set of events some session may still have to merge.
//! Older links are freed as soon as nothing points at them.
//!
//! Deferred cleanup rides on this: when a commit supersedes an item's values
//! it registers a cleanup on the link that preceded it. The cleanup runs when
//! that link is dropped, i.e. when no session can read at a revision where
//! the superseded values are visible any more.

use crate::event::ChangeEvent;
use crate::item::KnowledgeItem;
use crate::types::Revision;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Prune values of `item` that ended before `before`.
#[derive(Debug)]
pub(crate) struct Cleanup {
    pub(crate) item: Weak<KnowledgeItem>,
    pub(crate) before: Revision,
}

impl Cleanup {
    fn run(self) {
        if let Some(item) = self.item.upgrade() {
            let pruned = item.prune_before(self.before);
            if pruned > 0 {
                trace!(key = %item.key(), pruned, "superseded values released");
            }
        }
    }
}

pub struct UpdateLink {
    revision: Revision,
    prev_revision: Option<Revision>,
    event: Option<Arc<ChangeEvent>>,
    next: OnceLock<Arc<UpdateLink>>,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl UpdateLink {
    fn sentinel(revision: Revision) -> Self {
        Self {
            revision,
            prev_revision: None,
            event: None,
            next: OnceLock::new(),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// `None` for the sentinel a chain starts with.
    #[must_use]
    pub fn event(&self) -> Option<&Arc<ChangeEvent>> {
        self.event.as_ref()
    }

    #[must_use]
    pub fn next(&self) -> Option<&Arc<UpdateLink>> {
        self.next.get()
    }

    pub(crate) fn prev_revision(&self) -> Option<Revision> {
        self.prev_revision
    }
}

impl Drop for UpdateLink {
    fn drop(&mut self) {
        for cleanup in self.cleanups.get_mut().drain(..) {
            cleanup.run();
        }
        // Unlink iteratively: a long unpinned tail would otherwise recurse
        // once per link.
        let mut next = self.next.take();
        while let Some(link) = next {
            match Arc::try_unwrap(link) {
                Ok(mut link) => {
                    for cleanup in link.cleanups.get_mut().drain(..) {
                        cleanup.run();
                    }
                    next = link.next.take();
                }
                Err(_) => break,
            }
        }
    }
}

impl std::fmt::Debug for UpdateLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateLink")
            .field("revision", &self.revision)
            .field("has_event", &self.event.is_some())
            .field("has_next", &self.next.get().is_some())
            .finish()
    }
}

struct ChainState {
    tail: Arc<UpdateLink>,
    /// Highest revision this process has caught up to. May run ahead of the
    /// tail's revision across revisions that were never committed.
    last_local: Revision,
}

pub struct UpdateChain {
    state: Mutex<ChainState>,
    announced: Mutex<Revision>,
    announced_cv: Condvar,
}

impl UpdateChain {
    #[must_use]
    pub fn new(start: Revision) -> Self {
        Self {
            state: Mutex::new(ChainState {
                tail: Arc::new(UpdateLink::sentinel(start)),
                last_local: start,
            }),
            announced: Mutex::new(start),
            announced_cv: Condvar::new(),
        }
    }

    #[must_use]
    pub fn tail(&self) -> Arc<UpdateLink> {
        Arc::clone(&self.state.lock().tail)
    }

    #[must_use]
    pub fn last_local_revision(&self) -> Revision {
        self.state.lock().last_local
    }

    /// Record that every revision up to `revision` has been processed.
    pub(crate) fn catch_up(&self, revision: Revision) {
        let mut state = self.state.lock();
        if revision > state.last_local {
            state.last_local = revision;
        }
    }

    /// Link a published event after the tail. `cleanups` are attached to the
    /// previous tail.
    pub(crate) fn append(&self, event: Arc<ChangeEvent>, cleanups: Vec<Cleanup>) -> Arc<UpdateLink> {
        let mut state = self.state.lock();
        let revision = event.revision;
        assert!(
            revision > state.last_local,
            "publishing {revision} after {} was already processed",
            state.last_local
        );
        let link = Arc::new(UpdateLink {
            revision,
            prev_revision: Some(state.tail.revision),
            event: Some(event),
            next: OnceLock::new(),
            cleanups: Mutex::new(Vec::new()),
        });
        state.tail.cleanups.lock().extend(cleanups);
        if state.tail.next.set(Arc::clone(&link)).is_err() {
            panic!("update chain tail at {} already has a successor", state.tail.revision);
        }
        state.tail = Arc::clone(&link);
        state.last_local = revision;
        link
    }

    /// Block until listeners of `revision` have run. Every appended link is
    /// announced by whoever publishes it, so this always returns; a warning
    /// is logged each time `warn_every` passes without progress.
    pub(crate) fn wait_announced(&self, revision: Revision, warn_every: Duration) {
        let started = Instant::now();
        let mut announced = self.announced.lock();
        while *announced < revision {
            if self
                .announced_cv
                .wait_for(&mut announced, warn_every)
                .timed_out()
                && *announced < revision
            {
                warn!(
                    %revision,
                    announced = %*announced,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "still waiting for listener turn"
                );
            }
        }
    }

    pub(crate) fn announce(&self, revision: Revision) {
        let mut announced = self.announced.lock();
        if revision > *announced {
            *announced = revision;
            self.announced_cv.notify_all();
        }
    }
}
