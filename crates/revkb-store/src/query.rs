//! Attribute predicates and their compilation into storage scans.
//!
//! A query is compiled once per `(type, data branch)` and can be re-bound to
//! another revision with [`CompiledQuery::at`]. The compiler picks an access
//! path: a top-level `RefersTo` uses the backend's referrer lookup, anything
//! else becomes a type scan with the predicate applied to each row. For
//! flexible types, predicates over undeclared attributes cannot be evaluated
//! on the row alone and are returned as a residual for the caller to apply
//! once the flexible attributes are merged in.

use crate::error::{KbError, Result};
use crate::schema::{Schema, TypeDescriptor};
use crate::storage::{Connection, StorageError, StorageResult, StoredRow};
use crate::types::{AttrValue, Attributes, BranchId, ObjectId, Revision, TypeName};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    All,
    Eq(String, AttrValue),
    Ne(String, AttrValue),
    HasAttr(String),
    RefersTo(String, ObjectId),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn eq(attribute: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Expr::Eq(attribute.into(), value.into())
    }

    pub fn ne(attribute: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Expr::Ne(attribute.into(), value.into())
    }

    pub fn has(attribute: impl Into<String>) -> Self {
        Expr::HasAttr(attribute.into())
    }

    pub fn refers_to(attribute: impl Into<String>, target: ObjectId) -> Self {
        Expr::RefersTo(attribute.into(), target)
    }

    #[must_use]
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut parts) => {
                parts.push(other);
                Expr::And(parts)
            }
            Expr::All => other,
            first => Expr::And(vec![first, other]),
        }
    }

    #[must_use]
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut parts) => {
                parts.push(other);
                Expr::Or(parts)
            }
            first => Expr::Or(vec![first, other]),
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// Evaluate against one attribute payload. Absent attributes read as
    /// `Null`.
    #[must_use]
    pub fn matches(&self, attributes: &Attributes) -> bool {
        let get = |name: &str| attributes.get(name).unwrap_or(&AttrValue::Null);
        match self {
            Expr::All => true,
            Expr::Eq(name, value) => get(name) == value,
            Expr::Ne(name, value) => get(name) != value,
            Expr::HasAttr(name) => !get(name).is_null(),
            Expr::RefersTo(name, target) => get(name).as_ref_id() == Some(*target),
            Expr::And(parts) => parts.iter().all(|p| p.matches(attributes)),
            Expr::Or(parts) => parts.iter().any(|p| p.matches(attributes)),
            Expr::Not(inner) => !inner.matches(attributes),
        }
    }

    /// Every attribute name the expression mentions.
    #[must_use]
    pub fn attributes(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_attributes(&mut out);
        out
    }

    fn collect_attributes<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::All => {}
            Expr::Eq(name, _) | Expr::Ne(name, _) | Expr::HasAttr(name) | Expr::RefersTo(name, _) => {
                out.push(name)
            }
            Expr::And(parts) | Expr::Or(parts) => {
                for part in parts {
                    part.collect_attributes(out);
                }
            }
            Expr::Not(inner) => inner.collect_attributes(out),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum AccessPath {
    Scan,
    Referrers { attribute: String, target: ObjectId },
}

/// A validated query bound to one type on one data branch.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    descriptor: Arc<TypeDescriptor>,
    branch: BranchId,
    revision: Revision,
    path: AccessPath,
    pushdown: Expr,
    residual: Option<Expr>,
}

impl CompiledQuery {
    #[must_use]
    pub fn type_name(&self) -> &TypeName {
        &self.descriptor.name
    }

    #[must_use]
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    #[must_use]
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Predicate the caller must apply after merging flexible attributes.
    #[must_use]
    pub fn residual(&self) -> Option<&Expr> {
        self.residual.as_ref()
    }

    /// The same query against another revision.
    #[must_use]
    pub fn at(&self, revision: Revision) -> CompiledQuery {
        CompiledQuery {
            revision,
            ..self.clone()
        }
    }

    pub fn execute(&self, conn: &mut dyn Connection) -> StorageResult<Vec<StoredRow>> {
        Ok(self.stream(conn)?.collect())
    }

    /// Rows matching the pushed-down predicate, filtered lazily.
    pub fn stream(
        &self,
        conn: &mut dyn Connection,
    ) -> StorageResult<impl Iterator<Item = StoredRow> + '_> {
        if self.revision.is_current() {
            return Err(StorageError::InvalidRequest(
                "queries run against a concrete revision".to_string(),
            ));
        }
        let rows = match &self.path {
            AccessPath::Scan => conn.scan_type(self.branch, &self.descriptor.name, self.revision)?,
            AccessPath::Referrers { attribute, target } => conn.find_referrers(
                self.branch,
                &self.descriptor.name,
                attribute,
                *target,
                self.revision,
            )?,
        };
        Ok(rows
            .into_iter()
            .filter(move |row| self.pushdown.matches(&row.attributes)))
    }
}

pub struct QueryCompiler<'a> {
    schema: &'a Schema,
}

impl<'a> QueryCompiler<'a> {
    #[must_use]
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    pub fn compile(
        &self,
        type_name: &TypeName,
        branch: BranchId,
        revision: Revision,
        expr: &Expr,
    ) -> Result<CompiledQuery> {
        let descriptor = Arc::clone(self.schema.descriptor(type_name)?);
        self.check(&descriptor, expr)?;

        let uses_flex = expr
            .attributes()
            .iter()
            .any(|name| descriptor.is_flex_attribute(name));
        let (pushdown, residual) = if uses_flex {
            (Expr::All, Some(expr.clone()))
        } else {
            (expr.clone(), None)
        };
        let path = match &pushdown {
            Expr::RefersTo(attribute, target) => AccessPath::Referrers {
                attribute: attribute.clone(),
                target: *target,
            },
            _ => AccessPath::Scan,
        };

        Ok(CompiledQuery {
            descriptor,
            branch,
            revision,
            path,
            pushdown,
            residual,
        })
    }

    fn check(&self, descriptor: &TypeDescriptor, expr: &Expr) -> Result<()> {
        match expr {
            Expr::All => Ok(()),
            Expr::Eq(name, value) | Expr::Ne(name, value) => {
                self.schema.check_value(descriptor, name, value)
            }
            Expr::HasAttr(name) => {
                if descriptor.attribute(name).is_none() && !descriptor.flexible {
                    return Err(KbError::illegal_argument(format!(
                        "type `{}` has no attribute `{name}`",
                        descriptor.name
                    )));
                }
                Ok(())
            }
            Expr::RefersTo(name, _) => match descriptor.attribute(name) {
                Some(def) if def.reference_target().is_some() => Ok(()),
                _ => Err(KbError::illegal_argument(format!(
                    "`{}.{name}` is not a reference attribute",
                    descriptor.name
                ))),
            },
            Expr::And(parts) | Expr::Or(parts) => {
                parts.iter().try_for_each(|p| self.check(descriptor, p))
            }
            Expr::Not(inner) => self.check(descriptor, inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeDescriptor;
    use crate::storage::MemoryDatabase;
    use crate::types::attrs;

    fn schema() -> Schema {
        Schema::new(vec![
            TypeDescriptor::new("User").primitive("name"),
            TypeDescriptor::new("Doc")
                .primitive("title")
                .primitive("pages")
                .reference("owner", "User"),
            TypeDescriptor::new("Note").primitive("body").flexible(),
        ])
        .unwrap()
    }

    fn row(id: u64, attributes: Attributes) -> StoredRow {
        StoredRow {
            branch: BranchId::TRUNK,
            type_name: "Doc".into(),
            id: ObjectId(id),
            rev_min: Revision(1),
            rev_max: Revision::CURRENT,
            attributes,
        }
    }

    #[test]
    fn predicates_treat_missing_attributes_as_null() {
        let a = attrs([("title", AttrValue::from("x")), ("owner", AttrValue::Ref(ObjectId(3)))]);
        assert!(Expr::eq("title", "x").matches(&a));
        assert!(Expr::refers_to("owner", ObjectId(3)).matches(&a));
        assert!(!Expr::has("pages").matches(&a));
        assert!(Expr::Eq("pages".into(), AttrValue::Null).matches(&a));
        assert!(Expr::eq("title", "y").or(Expr::has("title")).matches(&a));
        assert!(!Expr::eq("title", "x").and(Expr::has("pages")).matches(&a));
        assert!(Expr::eq("title", "y").not().matches(&a));
    }

    #[test]
    fn compile_rejects_unknown_and_mistyped_attributes() {
        let schema = schema();
        let compiler = QueryCompiler::new(&schema);
        let doc = TypeName::new("Doc");

        assert!(compiler
            .compile(&doc, BranchId::TRUNK, Revision(1), &Expr::eq("nope", 1_i64))
            .is_err());
        assert!(compiler
            .compile(&doc, BranchId::TRUNK, Revision(1), &Expr::refers_to("title", ObjectId(1)))
            .is_err());
        assert!(matches!(
            compiler.compile(&"Ghost".into(), BranchId::TRUNK, Revision(1), &Expr::All),
            Err(KbError::UnknownType(_))
        ));
    }

    #[test]
    fn flexible_attributes_become_residual() {
        let schema = schema();
        let compiler = QueryCompiler::new(&schema);
        let note = TypeName::new("Note");

        let declared = compiler
            .compile(&note, BranchId::TRUNK, Revision(1), &Expr::eq("body", "x"))
            .unwrap();
        assert!(declared.residual().is_none());

        let flex = compiler
            .compile(&note, BranchId::TRUNK, Revision(1), &Expr::eq("mood", "ok"))
            .unwrap();
        assert_eq!(flex.residual(), Some(&Expr::eq("mood", "ok")));
    }

    #[test]
    fn execute_filters_rows_and_rebinds_revision() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        conn.begin().unwrap();
        conn.insert_rows(vec![
            row(1, attrs([("title", AttrValue::from("a")), ("owner", AttrValue::Ref(ObjectId(9)))])),
            row(2, attrs([("title", "b")])),
        ])
        .unwrap();
        conn.commit().unwrap();

        let schema = schema();
        let compiler = QueryCompiler::new(&schema);
        let by_owner = compiler
            .compile(
                &"Doc".into(),
                BranchId::TRUNK,
                Revision(1),
                &Expr::refers_to("owner", ObjectId(9)),
            )
            .unwrap();
        let rows = by_owner.execute(&mut conn).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, ObjectId(1));

        let all = compiler
            .compile(&"Doc".into(), BranchId::TRUNK, Revision(1), &Expr::All)
            .unwrap();
        assert_eq!(all.stream(&mut conn).unwrap().count(), 2);
        assert!(all.at(Revision::INITIAL).execute(&mut conn).unwrap().is_empty());
    }
}
