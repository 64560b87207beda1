//! Identity and value types shared by every layer of the store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Revisions
// ============================================================================

/// A commit number.
///
/// Revision numbers are strictly increasing but not dense: an aborted commit
/// burns the number it allocated. [`Revision::CURRENT`] is a request marker
/// for "the live head" and is never stored as the revision of a data row; it
/// only appears as the open-ended upper bound of a validity range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl Revision {
    /// The bootstrap revision written when a database is first initialized.
    pub const INITIAL: Revision = Revision(0);
    /// Sentinel for "current"; sorts after every concrete revision.
    pub const CURRENT: Revision = Revision(u64::MAX);

    #[must_use]
    pub fn is_current(self) -> bool {
        self == Self::CURRENT
    }

    #[must_use]
    pub fn next(self) -> Revision {
        debug_assert!(!self.is_current(), "no revision follows CURRENT");
        Revision(self.0 + 1)
    }

    /// The revision before this one, saturating at [`Revision::INITIAL`].
    #[must_use]
    pub fn prev(self) -> Revision {
        debug_assert!(!self.is_current(), "CURRENT has no predecessor");
        Revision(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_current() {
            f.write_str("current")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

// ============================================================================
// Branches, types and object names
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId(pub u64);

impl BranchId {
    /// The root of the branch tree. It has no base branch.
    pub const TRUNK: BranchId = BranchId(1);
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Name of a storable type, e.g. `Doc`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeName(String);

impl TypeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Keys
// ============================================================================

/// A logical object independent of the revision it is observed at.
///
/// `branch` is always the *data branch* of the type, so types that are not
/// branched share one identity across all branches that defer to them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub branch: BranchId,
    pub type_name: TypeName,
    pub id: ObjectId,
}

impl Identity {
    pub fn new(branch: BranchId, type_name: TypeName, id: ObjectId) -> Self {
        Self {
            branch,
            type_name,
            id,
        }
    }

    /// The key of this identity observed at `history`.
    #[must_use]
    pub fn at(&self, history: Revision) -> ObjectKey {
        ObjectKey {
            branch: self.branch,
            history,
            type_name: self.type_name.clone(),
            id: self.id,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.branch, self.type_name, self.id)
    }
}

/// One version of one logical object: (branch, history context, type, id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub branch: BranchId,
    pub history: Revision,
    pub type_name: TypeName,
    pub id: ObjectId,
}

impl ObjectKey {
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            branch: self.branch,
            type_name: self.type_name.clone(),
            id: self.id,
        }
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.history.is_current()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}{}@{}",
            self.branch, self.type_name, self.id, self.history
        )
    }
}

// ============================================================================
// Attribute payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Reference to another object of the attribute's declared target type.
    Ref(ObjectId),
}

impl AttrValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    #[must_use]
    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            AttrValue::Ref(id) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse the textual form used by the CLI: `null`, `true`, `42`, `1.5`,
    /// `@7` (reference) or anything else as text.
    #[must_use]
    pub fn parse_literal(raw: &str) -> AttrValue {
        match raw {
            "null" => return AttrValue::Null,
            "true" => return AttrValue::Bool(true),
            "false" => return AttrValue::Bool(false),
            _ => {}
        }
        if let Some(id) = raw.strip_prefix('@').and_then(|s| s.parse::<u64>().ok()) {
            return AttrValue::Ref(ObjectId(id));
        }
        if let Ok(i) = raw.parse::<i64>() {
            return AttrValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return AttrValue::Float(f);
        }
        AttrValue::Text(raw.to_string())
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Null => f.write_str("null"),
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Float(x) => write!(f, "{x}"),
            AttrValue::Text(s) => write!(f, "{s:?}"),
            AttrValue::Ref(id) => write!(f, "@{}", id.0),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

/// The attribute payload of one object version.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Build an [`Attributes`] map from `(name, value)` pairs.
pub fn attrs<I, K, V>(pairs: I) -> Attributes
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<AttrValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
