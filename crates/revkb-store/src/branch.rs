//! Branch registry.
//!
//! A branch forks from a base branch at a base revision. Only the types
//! named at creation are branched: their rows are copied to the new branch
//! and evolve independently. Every other type keeps reading and writing the
//! rows of the base's data branch, so for each `(branch, type)` the registry
//! answers which *data branch* actually holds the rows.

use crate::error::{KbError, Result};
use crate::storage::BranchRecord;
use crate::types::{BranchId, Revision, TypeName};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    record: BranchRecord,
}

impl Branch {
    #[must_use]
    pub fn id(&self) -> BranchId {
        self.record.id
    }

    #[must_use]
    pub fn base_branch(&self) -> Option<BranchId> {
        self.record.base_branch
    }

    #[must_use]
    pub fn base_revision(&self) -> Revision {
        self.record.base_revision
    }

    #[must_use]
    pub fn created_at(&self) -> Revision {
        self.record.created_at
    }

    #[must_use]
    pub fn record(&self) -> &BranchRecord {
        &self.record
    }

    /// Types added to the schema after the branch was created live on trunk.
    #[must_use]
    pub fn data_branch(&self, type_name: &TypeName) -> BranchId {
        self.record
            .data_branches
            .get(type_name)
            .copied()
            .unwrap_or(BranchId::TRUNK)
    }

    /// Whether this branch holds its own rows for `type_name`.
    #[must_use]
    pub fn is_branched(&self, type_name: &TypeName) -> bool {
        self.data_branch(type_name) == self.record.id
    }

    pub fn branched_types(&self) -> impl Iterator<Item = &TypeName> {
        self.record
            .data_branches
            .iter()
            .filter(|(_, data)| **data == self.record.id)
            .map(|(name, _)| name)
    }
}

/// The trunk record written when a database is initialized.
#[must_use]
pub fn trunk_record<'a>(types: impl IntoIterator<Item = &'a TypeName>) -> BranchRecord {
    BranchRecord {
        id: BranchId::TRUNK,
        base_branch: None,
        base_revision: Revision::INITIAL,
        created_at: Revision::INITIAL,
        data_branches: types
            .into_iter()
            .map(|t| (t.clone(), BranchId::TRUNK))
            .collect(),
    }
}

#[derive(Debug, Default)]
pub struct BranchRegistry {
    branches: RwLock<BTreeMap<BranchId, Arc<Branch>>>,
}

impl BranchRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; a branch record never changes once written.
    pub fn register(&self, record: BranchRecord) -> Arc<Branch> {
        let mut branches = self.branches.write();
        Arc::clone(
            branches
                .entry(record.id)
                .or_insert_with(|| Arc::new(Branch { record })),
        )
    }

    pub fn get(&self, id: BranchId) -> Result<Arc<Branch>> {
        self.branches
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| KbError::illegal_argument(format!("unknown branch {id}")))
    }

    #[must_use]
    pub fn contains(&self, id: BranchId) -> bool {
        self.branches.read().contains_key(&id)
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Branch>> {
        self.branches.read().values().cloned().collect()
    }

    pub fn data_branch(&self, branch: BranchId, type_name: &TypeName) -> Result<BranchId> {
        Ok(self.get(branch)?.data_branch(type_name))
    }

    /// Where to read `type_name` through `branch` at `revision`.
    ///
    /// Before a branch existed its branched types are read from the base
    /// branch, as of the base revision at the latest.
    pub fn resolve_read(
        &self,
        branch: BranchId,
        type_name: &TypeName,
        revision: Revision,
    ) -> Result<(BranchId, Revision)> {
        let b = self.get(branch)?;
        let data = b.data_branch(type_name);
        if data != b.id() {
            return self.resolve_read(data, type_name, revision);
        }
        match b.base_branch() {
            Some(base) if revision < b.created_at() => {
                self.resolve_read(base, type_name, revision.min(b.base_revision()))
            }
            _ => Ok((b.id(), revision)),
        }
    }

    /// Record for a new branch of `base`. `branched` types get their own
    /// rows; all others keep the base's data branch.
    pub(crate) fn plan_branch<'a>(
        &self,
        id: BranchId,
        base: BranchId,
        base_revision: Revision,
        created_at: Revision,
        types: impl IntoIterator<Item = &'a TypeName>,
        branched: &[TypeName],
    ) -> Result<BranchRecord> {
        let base_branch = self.get(base)?;
        if base_revision < base_branch.created_at() {
            return Err(KbError::illegal_argument(format!(
                "{base} did not exist at {base_revision}"
            )));
        }
        let data_branches = types
            .into_iter()
            .map(|t| {
                let data = if branched.contains(t) {
                    id
                } else {
                    base_branch.data_branch(t)
                };
                (t.clone(), data)
            })
            .collect();
        Ok(BranchRecord {
            id,
            base_branch: Some(base),
            base_revision,
            created_at,
            data_branches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types() -> Vec<TypeName> {
        vec!["Doc".into(), "User".into()]
    }

    #[test]
    fn unbranched_types_read_through_to_the_base() {
        let registry = BranchRegistry::new();
        let types = types();
        registry.register(trunk_record(&types));

        let record = registry
            .plan_branch(BranchId(2), BranchId::TRUNK, Revision(5), Revision(7), &types, &["Doc".into()])
            .unwrap();
        let branch = registry.register(record);

        assert!(branch.is_branched(&"Doc".into()));
        assert!(!branch.is_branched(&"User".into()));
        assert_eq!(
            registry.resolve_read(BranchId(2), &"User".into(), Revision(9)).unwrap(),
            (BranchId::TRUNK, Revision(9))
        );
        assert_eq!(
            registry.resolve_read(BranchId(2), &"Doc".into(), Revision(9)).unwrap(),
            (BranchId(2), Revision(9))
        );
        // Before the branch existed: trunk as of the base revision.
        assert_eq!(
            registry.resolve_read(BranchId(2), &"Doc".into(), Revision(6)).unwrap(),
            (BranchId::TRUNK, Revision(5))
        );
        assert_eq!(
            registry.resolve_read(BranchId(2), &"Doc".into(), Revision(3)).unwrap(),
            (BranchId::TRUNK, Revision(3))
        );
    }

    #[test]
    fn nested_branches_resolve_through_each_ancestor() {
        let registry = BranchRegistry::new();
        let types = types();
        registry.register(trunk_record(&types));
        let b2 = registry
            .plan_branch(BranchId(2), BranchId::TRUNK, Revision(4), Revision(5), &types, &["Doc".into()])
            .unwrap();
        registry.register(b2);
        let b3 = registry
            .plan_branch(BranchId(3), BranchId(2), Revision(8), Revision(9), &types, &["User".into()])
            .unwrap();
        let b3 = registry.register(b3);

        assert_eq!(b3.data_branch(&"Doc".into()), BranchId(2));
        assert_eq!(
            registry.resolve_read(BranchId(3), &"Doc".into(), Revision(3)).unwrap(),
            (BranchId::TRUNK, Revision(3))
        );
        assert_eq!(
            registry.resolve_read(BranchId(3), &"User".into(), Revision(8)).unwrap(),
            (BranchId::TRUNK, Revision(8))
        );
        assert!(registry.get(BranchId(77)).is_err());
        assert!(registry
            .plan_branch(BranchId(4), BranchId(3), Revision(2), Revision(10), &types, &[])
            .is_err());
    }
}
