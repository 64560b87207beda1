//! Storage for undeclared attributes of flexible types.
//!
//! Flexible attributes are versioned like rows: every write is tagged with the
//! revision that produced it. The commit coordinator writes them alongside the
//! row batch and calls [`FlexAttributeStore::discard`] if the backend commit
//! fails, so an aborted revision never leaves versions behind.

use crate::schema::TypeDescriptor;
use crate::storage::StorageResult;
use crate::types::{Attributes, Identity, Revision};
use parking_lot::Mutex;
use std::collections::HashMap;

pub trait FlexAttributeStore: Send + Sync {
    /// Flexible attributes of `identity` as of `revision` (empty if none).
    fn load(&self, identity: &Identity, revision: Revision) -> StorageResult<Attributes>;

    /// Record the full flexible attribute set written at `revision`.
    fn store(&self, identity: &Identity, revision: Revision, attributes: &Attributes)
        -> StorageResult<()>;

    /// The object was deleted at `revision`.
    fn delete(&self, identity: &Identity, revision: Revision) -> StorageResult<()>;

    /// Undo every write made at `revision`.
    fn discard(&self, revision: Revision) -> StorageResult<()>;
}

/// Split a full payload into `(row attributes, flexible attributes)`.
#[must_use]
pub fn split_flex(descriptor: &TypeDescriptor, attributes: &Attributes) -> (Attributes, Attributes) {
    if !descriptor.flexible {
        return (attributes.clone(), Attributes::new());
    }
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(k, _)| !descriptor.is_flex_attribute(k))
}

#[derive(Debug, Clone)]
struct FlexVersion {
    min: Revision,
    max: Revision,
    attributes: Attributes,
}

#[derive(Debug, Default)]
pub struct MemoryFlexStore {
    versions: Mutex<HashMap<Identity, Vec<FlexVersion>>>,
}

impl MemoryFlexStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn close_open(versions: &mut [FlexVersion], revision: Revision) {
        if let Some(last) = versions.last_mut() {
            if last.max.is_current() {
                last.max = revision.prev();
            }
        }
    }
}

impl FlexAttributeStore for MemoryFlexStore {
    fn load(&self, identity: &Identity, revision: Revision) -> StorageResult<Attributes> {
        let versions = self.versions.lock();
        Ok(versions
            .get(identity)
            .and_then(|vs| {
                vs.iter()
                    .rev()
                    .find(|v| v.min <= revision && revision <= v.max)
            })
            .map(|v| v.attributes.clone())
            .unwrap_or_default())
    }

    fn store(
        &self,
        identity: &Identity,
        revision: Revision,
        attributes: &Attributes,
    ) -> StorageResult<()> {
        let mut versions = self.versions.lock();
        let entry = versions.entry(identity.clone()).or_default();
        Self::close_open(entry, revision);
        entry.push(FlexVersion {
            min: revision,
            max: Revision::CURRENT,
            attributes: attributes.clone(),
        });
        Ok(())
    }

    fn delete(&self, identity: &Identity, revision: Revision) -> StorageResult<()> {
        if let Some(entry) = self.versions.lock().get_mut(identity) {
            Self::close_open(entry, revision);
        }
        Ok(())
    }

    fn discard(&self, revision: Revision) -> StorageResult<()> {
        let mut versions = self.versions.lock();
        for entry in versions.values_mut() {
            entry.retain(|v| v.min != revision);
            if let Some(last) = entry.last_mut() {
                if last.max == revision.prev() {
                    last.max = Revision::CURRENT;
                }
            }
        }
        versions.retain(|_, entry| !entry.is_empty());
        Ok(())
    }
}
