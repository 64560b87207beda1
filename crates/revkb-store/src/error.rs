//! Error types.
//!
//! | Class | Variant | Retry? |
//! |-------|---------|--------|
//! | Programmer misuse | `IllegalState`, `IllegalArgument`, `UnknownType` | no |
//! | Optimistic concurrency | `MergeConflict` | after `Session::rollback` |
//! | Stale data | `DeletedObjectAccess` | no |
//! | Commit validation | `DeleteVeto`, `CommitVetoed`, `ConstraintViolation`, `BranchCrossing` | no |
//! | Coordination | `RefetchTimeout` | yes, state untouched |
//! | Backend | `Storage` | already retried where retryable |
//!
//! Broken internal invariants (overlapping validity ranges, a revision that
//! does not follow the last published one) panic instead.

use crate::storage::StorageError;
use crate::types::{Identity, ObjectKey, Revision, TypeName};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KbError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("unknown type `{0}`")]
    UnknownType(TypeName),

    #[error("{0}")]
    MergeConflict(MergeConflicts),

    /// Read of an object that is not alive at the requested revision.
    #[error("{key} is not alive{}", last_live_suffix(.last_live))]
    DeletedObjectAccess {
        key: ObjectKey,
        last_live: Option<ObjectKey>,
    },

    #[error("timed out after {waited:?} waiting for a running commit or refetch")]
    RefetchTimeout { waited: Duration },

    #[error("{target} cannot be deleted: still referenced by {referrer} via `{attribute}`")]
    DeleteVeto {
        target: Identity,
        referrer: Identity,
        attribute: String,
    },

    #[error("commit vetoed by {check}: {reason}")]
    CommitVetoed { check: String, reason: String },

    #[error("constraint violated on {identity}: {reason}")]
    ConstraintViolation { identity: Identity, reason: String },

    #[error("reference {source_type}.{attribute} -> {target_type} would cross the branch boundary")]
    BranchCrossing {
        source_type: TypeName,
        attribute: String,
        target_type: TypeName,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, KbError>;

fn last_live_suffix(last_live: &Option<ObjectKey>) -> String {
    last_live
        .as_ref()
        .map(|k| format!(" (last live version {k})"))
        .unwrap_or_default()
}

impl KbError {
    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        KbError::IllegalState(msg.into())
    }

    pub(crate) fn illegal_argument(msg: impl Into<String>) -> Self {
        KbError::IllegalArgument(msg.into())
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, KbError::MergeConflict(_))
    }

    #[must_use]
    pub fn conflicts(&self) -> Option<&MergeConflicts> {
        match self {
            KbError::MergeConflict(c) => Some(c),
            _ => None,
        }
    }
}

// ============================================================================
// Merge conflicts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// Both sides changed the same attribute.
    ConcurrentChange,
    /// Both sides created the same identity.
    ConcurrentCreation,
    /// Changed locally, deleted remotely.
    ChangedThenDeleted,
    /// Deleted locally, changed remotely.
    DeletedThenChanged,
    /// Local writes reference an object deleted remotely.
    DanglingReference,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::ConcurrentChange => "concurrent change",
            ConflictKind::ConcurrentCreation => "concurrent creation",
            ConflictKind::ChangedThenDeleted => "changed locally but deleted",
            ConflictKind::DeletedThenChanged => "deleted locally but changed",
            ConflictKind::DanglingReference => "reference to deleted object",
        };
        f.write_str(s)
    }
}

/// One detected incompatibility between local and remote changes.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConflict {
    pub kind: ConflictKind,
    /// The object the conflict is about.
    pub identity: Identity,
    /// Revision of the remote change.
    pub revision: Revision,
    /// Attributes involved, when the conflict is attribute-level.
    pub attributes: Vec<String>,
    /// For dangling references: the local object holding the reference.
    pub referrer: Option<Identity>,
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} in {}", self.kind, self.identity, self.revision)?;
        if !self.attributes.is_empty() {
            write!(f, " [{}]", self.attributes.join(", "))?;
        }
        if let Some(referrer) = &self.referrer {
            write!(f, " (referenced from {referrer})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeConflicts(pub Vec<MergeConflict>);

impl MergeConflicts {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MergeConflict> {
        self.0.iter()
    }

    #[must_use]
    pub fn has(&self, kind: ConflictKind) -> bool {
        self.0.iter().any(|c| c.kind == kind)
    }
}

impl fmt::Display for MergeConflicts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} merge conflict(s)", self.0.len())?;
        for conflict in &self.0 {
            write!(f, "; {conflict}")?;
        }
        Ok(())
    }
}
