//! Per-item validity chain.
//!
//! Each [`Values`] node holds one immutable attribute snapshot valid over an
//! inclusive revision range. A [`ValuesChain`] keeps the nodes of one
//! generation-of-existence of an object, ordered by `min`, with these
//! invariants:
//!
//! - adjacent nodes are contiguous and never overlap,
//! - only the newest node may be open-ended (`max == Revision::CURRENT`),
//! - a finite `max` is only ever narrowed, when a newer node is spliced in
//!   or the object is deleted.
//!
//! The chain may be partially loaded: `origin` is the revision the generation
//! started at, and nodes older than the oldest loaded one are fetched lazily.

use crate::types::{Attributes, Revision};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Values {
    payload: Arc<Attributes>,
    min: Revision,
    max: Revision,
}

impl Values {
    pub fn new(payload: impl Into<Arc<Attributes>>, min: Revision, max: Revision) -> Self {
        assert!(min <= max, "validity range [{min}, {max}] is inverted");
        assert!(!min.is_current(), "CURRENT cannot start a validity range");
        Self {
            payload: payload.into(),
            min,
            max,
        }
    }

    #[must_use]
    pub fn payload(&self) -> &Arc<Attributes> {
        &self.payload
    }

    #[must_use]
    pub fn min(&self) -> Revision {
        self.min
    }

    #[must_use]
    pub fn max(&self) -> Revision {
        self.max
    }

    #[must_use]
    pub fn covers(&self, revision: Revision) -> bool {
        self.min <= revision && revision <= self.max
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.max.is_current()
    }
}

/// Result of a point-in-time lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Values),
    /// Inside the generation but older than every loaded node.
    Unloaded { oldest_loaded: Revision },
    /// After the generation ended.
    Deleted { last_live: Revision },
    /// Before the generation started.
    Unborn,
}

/// What [`ValuesChain::update_values`] did with a node.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Became the new head; `superseded` is the capped previous head.
    Prepended { superseded: Option<Values> },
    /// Filled a slot behind the head.
    InsertedOlder,
    /// Already known; at most narrowed an existing range.
    Redundant,
}

#[derive(Debug, Clone, Default)]
pub struct ValuesChain {
    /// Ordered by `min`, oldest first.
    nodes: Vec<Values>,
    origin: Option<Revision>,
}

impl ValuesChain {
    #[must_use]
    pub fn new(head: Values, origin: Revision) -> Self {
        assert!(origin <= head.min, "generation origin after its first node");
        Self {
            nodes: vec![head],
            origin: Some(origin),
        }
    }

    #[must_use]
    pub fn origin(&self) -> Option<Revision> {
        self.origin
    }

    #[must_use]
    pub fn head(&self) -> Option<&Values> {
        self.nodes.last()
    }

    #[must_use]
    pub fn oldest(&self) -> Option<&Values> {
        self.nodes.first()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Values> {
        self.nodes.iter().rev()
    }

    #[must_use]
    pub fn lookup(&self, revision: Revision) -> Lookup {
        let (Some(origin), Some(oldest)) = (self.origin, self.nodes.first()) else {
            return Lookup::Unborn;
        };
        if revision < origin {
            return Lookup::Unborn;
        }
        let idx = self.nodes.partition_point(|n| n.min <= revision);
        if idx == 0 {
            return Lookup::Unloaded {
                oldest_loaded: oldest.min,
            };
        }
        let node = &self.nodes[idx - 1];
        if node.covers(revision) {
            return Lookup::Found(node.clone());
        }
        assert!(
            idx == self.nodes.len(),
            "gap in values chain after {}",
            node.max
        );
        Lookup::Deleted {
            last_live: node.max,
        }
    }

    /// Whether the generation is alive at `revision`. Unloaded ranges count
    /// as alive because a generation is contiguous from its origin.
    #[must_use]
    pub fn is_alive(&self, revision: Revision) -> bool {
        matches!(
            self.lookup(revision),
            Lookup::Found(_) | Lookup::Unloaded { .. }
        )
    }

    /// Splice a node fetched or committed elsewhere into the chain.
    ///
    /// Newer nodes become the head and cap the previous head at
    /// `new.min - 1`. Older nodes are inserted behind the head if they are
    /// not already known. Re-fetching a known range is a no-op apart from
    /// narrowing an open head to what the backend reports.
    pub fn update_values(&mut self, new: Values) -> UpdateOutcome {
        let Some(head) = self.nodes.last_mut() else {
            self.origin = Some(self.origin.map_or(new.min, |o| o.min(new.min)));
            self.nodes.push(new);
            return UpdateOutcome::Prepended { superseded: None };
        };

        if new.min > head.min {
            assert!(
                head.is_open() || head.max.next() >= new.min,
                "splicing {} after a head that ended at {}",
                new.min,
                head.max
            );
            head.max = new.min.prev();
            let superseded = head.clone();
            self.nodes.push(new);
            return UpdateOutcome::Prepended {
                superseded: Some(superseded),
            };
        }

        if new.min == head.min {
            if new.max < head.max {
                head.max = new.max;
            }
            return UpdateOutcome::Redundant;
        }

        match self.nodes.binary_search_by(|n| n.min.cmp(&new.min)) {
            Ok(_) => UpdateOutcome::Redundant,
            Err(pos) => {
                let overlaps_prev = pos > 0 && self.nodes[pos - 1].max >= new.min;
                let overlaps_next = new.max >= self.nodes[pos].min;
                if overlaps_prev || overlaps_next {
                    return UpdateOutcome::Redundant;
                }
                if let Some(origin) = self.origin {
                    if new.min < origin {
                        self.origin = Some(new.min);
                    }
                }
                self.nodes.insert(pos, new);
                UpdateOutcome::InsertedOlder
            }
        }
    }

    /// End the generation: the head stays valid through `last_valid`.
    /// Returns false if the head was already closed at or before it.
    pub fn cap(&mut self, last_valid: Revision) -> bool {
        match self.nodes.last_mut() {
            Some(head) if head.max > last_valid => {
                assert!(
                    last_valid >= head.min,
                    "deleting {} before its head started at {}",
                    last_valid,
                    head.min
                );
                head.max = last_valid;
                true
            }
            _ => false,
        }
    }

    /// Drop nodes that ended before `revision`. The head is always kept.
    pub fn prune_before(&mut self, revision: Revision) -> usize {
        let keep_from = self
            .nodes
            .iter()
            .position(|n| n.max >= revision)
            .unwrap_or(self.nodes.len().saturating_sub(1));
        self.nodes.drain(..keep_from);
        keep_from
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::attrs;
    use proptest::prelude::*;

    fn v(title: &str, min: u64, max: Option<u64>) -> Values {
        Values::new(
            attrs([("title", title)]),
            Revision(min),
            max.map_or(Revision::CURRENT, Revision),
        )
    }

    fn title(l: Lookup) -> String {
        match l {
            Lookup::Found(v) => v.payload()["title"].as_text().unwrap().to_string(),
            other => panic!("expected values, got {other:?}"),
        }
    }

    #[test]
    fn newer_node_caps_previous_head() {
        let mut chain = ValuesChain::new(v("a", 1, None), Revision(1));
        let outcome = chain.update_values(v("b", 2, None));

        match outcome {
            UpdateOutcome::Prepended { superseded: Some(old) } => {
                assert_eq!(old.max(), Revision(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(title(chain.lookup(Revision(1))), "a");
        assert_eq!(title(chain.lookup(Revision(2))), "b");
        assert_eq!(title(chain.lookup(Revision(900))), "b");
        assert_eq!(chain.lookup(Revision::INITIAL), Lookup::Unborn);
    }

    #[test]
    fn cap_marks_later_revisions_deleted() {
        let mut chain = ValuesChain::new(v("a", 1, None), Revision(1));
        chain.update_values(v("b", 2, None));
        assert!(chain.cap(Revision(2)));
        assert!(!chain.cap(Revision(5)));

        assert_eq!(title(chain.lookup(Revision(2))), "b");
        assert_eq!(
            chain.lookup(Revision(3)),
            Lookup::Deleted {
                last_live: Revision(2)
            }
        );
        assert!(!chain.is_alive(Revision(3)));
    }

    #[test]
    fn older_nodes_fill_unloaded_history() {
        let mut chain = ValuesChain::new(v("c", 5, None), Revision(1));
        assert_eq!(
            chain.lookup(Revision(3)),
            Lookup::Unloaded {
                oldest_loaded: Revision(5)
            }
        );
        assert!(chain.is_alive(Revision(3)));

        assert_eq!(
            chain.update_values(v("b", 3, Some(4))),
            UpdateOutcome::InsertedOlder
        );
        assert_eq!(
            chain.update_values(v("a", 1, Some(2))),
            UpdateOutcome::InsertedOlder
        );
        assert_eq!(chain.update_values(v("b", 3, Some(4))), UpdateOutcome::Redundant);
        assert_eq!(title(chain.lookup(Revision(4))), "b");
        assert_eq!(title(chain.lookup(Revision(1))), "a");
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn refetch_of_head_narrows_open_range() {
        let mut chain = ValuesChain::new(v("a", 1, None), Revision(1));
        assert_eq!(chain.update_values(v("a", 1, Some(6))), UpdateOutcome::Redundant);
        assert_eq!(chain.head().unwrap().max(), Revision(6));
        assert_eq!(chain.update_values(v("a", 1, None)), UpdateOutcome::Redundant);
        assert_eq!(chain.head().unwrap().max(), Revision(6));
    }

    #[test]
    fn prune_keeps_head_and_recent_nodes() {
        let mut chain = ValuesChain::new(v("a", 1, None), Revision(1));
        chain.update_values(v("b", 3, None));
        chain.update_values(v("c", 5, None));
        assert_eq!(chain.prune_before(Revision(5)), 2);
        assert_eq!(chain.len(), 1);
        assert_eq!(
            chain.lookup(Revision(2)),
            Lookup::Unloaded {
                oldest_loaded: Revision(5)
            }
        );
        assert_eq!(chain.prune_before(Revision(100)), 0);
        assert_eq!(chain.len(), 1);
    }

    proptest! {
        /// Every revision from the origin through the last observed one is
        /// covered by exactly one node, whatever order updates arrive in.
        #[test]
        fn chain_covers_every_revision_exactly_once(
            steps in proptest::collection::vec(1u64..4, 1..12),
            deleted in any::<bool>(),
        ) {
            let mut starts = vec![1u64];
            for step in &steps {
                let last = *starts.last().unwrap();
                starts.push(last + step);
            }
            let last_start = *starts.last().unwrap();
            let end = last_start + 2;

            let mut chain = ValuesChain::new(
                Values::new(attrs([("n", last_start as i64)]), Revision(last_start), Revision::CURRENT),
                Revision(1),
            );
            for (i, start) in starts.iter().enumerate().rev().skip(1) {
                let max = starts[i + 1] - 1;
                chain.update_values(Values::new(
                    attrs([("n", *start as i64)]),
                    Revision(*start),
                    Revision(max),
                ));
            }
            if deleted {
                chain.cap(Revision(end - 1));
            }

            for r in 1..end {
                let covering = chain.iter().filter(|n| n.covers(Revision(r))).count();
                prop_assert_eq!(covering, 1, "revision {} covered {} times", r, covering);
            }
            prop_assert_eq!(chain.is_alive(Revision(end)), !deleted);
            prop_assert_eq!(chain.len(), starts.len());
        }
    }
}
