//! Type registry.
//!
//! Types are plain serde data so that a schema can live next to a store as
//! `schema.json`. References carry two flags that the commit protocol cares
//! about:
//!
//! - `veto_delete`: the target may not be deleted while the reference exists.
//! - `branch_global`: the reference may point across a branch boundary.

use crate::error::{KbError, Result};
use crate::types::{AttrValue, TypeName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributeKind {
    Primitive,
    Reference {
        target: TypeName,
        #[serde(default)]
        veto_delete: bool,
        #[serde(default)]
        branch_global: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub kind: AttributeKind,
    #[serde(default)]
    pub mandatory: bool,
}

impl AttributeDef {
    #[must_use]
    pub fn reference_target(&self) -> Option<&TypeName> {
        match &self.kind {
            AttributeKind::Reference { target, .. } => Some(target),
            AttributeKind::Primitive => None,
        }
    }

    #[must_use]
    pub fn vetoes_delete(&self) -> bool {
        matches!(self.kind, AttributeKind::Reference { veto_delete: true, .. })
    }

    #[must_use]
    pub fn is_branch_global(&self) -> bool {
        matches!(self.kind, AttributeKind::Reference { branch_global: true, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: TypeName,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
    /// Undeclared attributes are accepted and kept in the flexible store.
    #[serde(default)]
    pub flexible: bool,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: TypeName::new(name),
            attributes: Vec::new(),
            flexible: false,
        }
    }

    #[must_use]
    pub fn primitive(mut self, name: &str) -> Self {
        self.attributes.push(AttributeDef {
            name: name.to_string(),
            kind: AttributeKind::Primitive,
            mandatory: false,
        });
        self
    }

    #[must_use]
    pub fn mandatory(mut self, name: &str) -> Self {
        self.attributes.push(AttributeDef {
            name: name.to_string(),
            kind: AttributeKind::Primitive,
            mandatory: true,
        });
        self
    }

    #[must_use]
    pub fn reference(self, name: &str, target: &str) -> Self {
        self.reference_with(name, target, false, false)
    }

    /// A reference that blocks deletion of its target.
    #[must_use]
    pub fn veto_reference(self, name: &str, target: &str) -> Self {
        self.reference_with(name, target, true, false)
    }

    /// A reference allowed to point across branch boundaries.
    #[must_use]
    pub fn global_reference(self, name: &str, target: &str) -> Self {
        self.reference_with(name, target, false, true)
    }

    #[must_use]
    pub fn reference_with(
        mut self,
        name: &str,
        target: &str,
        veto_delete: bool,
        branch_global: bool,
    ) -> Self {
        self.attributes.push(AttributeDef {
            name: name.to_string(),
            kind: AttributeKind::Reference {
                target: TypeName::new(target),
                veto_delete,
                branch_global,
            },
            mandatory: false,
        });
        self
    }

    #[must_use]
    pub fn flexible(mut self) -> Self {
        self.flexible = true;
        self
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn references(&self) -> impl Iterator<Item = &AttributeDef> {
        self.attributes
            .iter()
            .filter(|a| a.reference_target().is_some())
    }

    /// Whether `name` is stored outside the row (flexible types only).
    #[must_use]
    pub fn is_flex_attribute(&self, name: &str) -> bool {
        self.flexible && self.attribute(name).is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDef {
    pub types: Vec<TypeDescriptor>,
}

/// The validated set of storable types.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: BTreeMap<TypeName, Arc<TypeDescriptor>>,
}

impl Schema {
    pub fn new(types: Vec<TypeDescriptor>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for descriptor in types {
            if map.contains_key(&descriptor.name) {
                return Err(KbError::illegal_argument(format!(
                    "type `{}` declared twice",
                    descriptor.name
                )));
            }
            map.insert(descriptor.name.clone(), Arc::new(descriptor));
        }
        for descriptor in map.values() {
            for attr in descriptor.references() {
                if let Some(target) = attr.reference_target() {
                    if !map.contains_key(target) {
                        return Err(KbError::UnknownType(target.clone()));
                    }
                }
            }
        }
        Ok(Self { types: map })
    }

    pub fn from_def(def: SchemaDef) -> Result<Self> {
        Self::new(def.types)
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let def: SchemaDef = serde_json::from_str(&contents)?;
        Ok(Self::from_def(def)?)
    }

    pub fn descriptor(&self, name: &TypeName) -> Result<&Arc<TypeDescriptor>> {
        self.types
            .get(name)
            .ok_or_else(|| KbError::UnknownType(name.clone()))
    }

    pub fn type_names(&self) -> impl Iterator<Item = &TypeName> {
        self.types.keys()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<TypeDescriptor>> {
        self.types.values()
    }

    /// Every `(source type, attribute)` whose reference targets `target`.
    #[must_use]
    pub fn referrers_of(&self, target: &TypeName) -> Vec<(Arc<TypeDescriptor>, AttributeDef)> {
        let mut out = Vec::new();
        for descriptor in self.types.values() {
            for attr in descriptor.references() {
                if attr.reference_target() == Some(target) {
                    out.push((Arc::clone(descriptor), attr.clone()));
                }
            }
        }
        out
    }

    /// Check one attribute assignment against the declaration.
    pub fn check_value(
        &self,
        descriptor: &TypeDescriptor,
        attribute: &str,
        value: &AttrValue,
    ) -> Result<()> {
        match descriptor.attribute(attribute) {
            None if descriptor.flexible => Ok(()),
            None => Err(KbError::illegal_argument(format!(
                "type `{}` has no attribute `{attribute}`",
                descriptor.name
            ))),
            Some(def) => match (&def.kind, value) {
                (_, AttrValue::Null) => Ok(()),
                (AttributeKind::Reference { .. }, AttrValue::Ref(_)) => Ok(()),
                (AttributeKind::Reference { target, .. }, other) => Err(KbError::illegal_argument(
                    format!("`{attribute}` expects a reference to `{target}`, got {other}"),
                )),
                (AttributeKind::Primitive, AttrValue::Ref(_)) => Err(KbError::illegal_argument(
                    format!("`{attribute}` is not a reference attribute"),
                )),
                (AttributeKind::Primitive, _) => Ok(()),
            },
        }
    }
}
