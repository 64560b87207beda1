//! Change events and the hooks that observe them.

use crate::session::Session;
use crate::storage::{BranchRecord, RevisionRecord};
use crate::types::{Attributes, Identity, ObjectKey, Revision};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Where a published revision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Committed by a session of this process.
    Local { session: u64 },
    /// Picked up by a refetch.
    Remote,
}

/// Before/after payloads of one object in one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectChange {
    /// Keyed at the event's revision.
    pub key: ObjectKey,
    pub before: Option<Arc<Attributes>>,
    pub after: Option<Arc<Attributes>>,
}

impl ObjectChange {
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.key.identity()
    }

    /// Attributes whose value differs between `before` and `after`.
    #[must_use]
    pub fn changed_attributes(&self) -> BTreeSet<String> {
        let empty = Attributes::new();
        let before = self.before.as_deref().unwrap_or(&empty);
        let after = self.after.as_deref().unwrap_or(&empty);
        before
            .keys()
            .chain(after.keys())
            .filter(|name| before.get(*name) != after.get(*name))
            .cloned()
            .collect()
    }
}

/// Everything published for one revision.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub revision: Revision,
    pub record: RevisionRecord,
    pub origin: EventOrigin,
    pub created: Vec<ObjectChange>,
    pub updated: Vec<ObjectChange>,
    pub deleted: Vec<ObjectChange>,
    pub branch_created: Option<BranchRecord>,
}

impl ChangeEvent {
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.origin, EventOrigin::Local { .. })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.branch_created.is_none()
    }

    pub fn changes(&self) -> impl Iterator<Item = &ObjectChange> {
        self.created
            .iter()
            .chain(self.updated.iter())
            .chain(self.deleted.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListenerPriority {
    /// Runs before every normal listener of the same revision.
    High,
    Normal,
}

/// Observer of published revisions.
///
/// Events arrive in strict revision order. For a local commit the committing
/// session is passed in with its transaction context locked: the listener
/// may read through it but any write fails with `IllegalState`.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent, session: Option<&mut Session>);
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent, _session: Option<&mut Session>) {
        self(event)
    }
}

/// A named check run against the pending event before anything is written.
pub trait CommitVeto: Send + Sync {
    fn name(&self) -> &str;

    /// `Err(reason)` aborts the commit.
    fn check(&self, pending: &ChangeEvent) -> std::result::Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{attrs, AttrValue, BranchId, ObjectId};

    #[test]
    fn changed_attributes_compares_both_sides() {
        let key = Identity::new(BranchId::TRUNK, "Doc".into(), ObjectId(1)).at(Revision(2));
        let change = ObjectChange {
            key,
            before: Some(Arc::new(attrs([("a", 1_i64), ("b", 2)]))),
            after: Some(Arc::new(attrs([
                ("a", AttrValue::Int(1)),
                ("b", AttrValue::Int(3)),
                ("c", AttrValue::Bool(true)),
            ]))),
        };
        let changed: Vec<_> = change.changed_attributes().into_iter().collect();
        assert_eq!(changed, vec!["b".to_string(), "c".to_string()]);

        let deletion = ObjectChange {
            after: None,
            ..change
        };
        assert_eq!(deletion.changed_attributes().len(), 2);
    }
}
