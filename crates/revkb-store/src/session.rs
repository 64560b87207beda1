//! Sessions: the unit of isolation.
//!
//! A [`Session`] pins the update-chain link of the revision it reads at and
//! owns at most one [`TransactionContext`]. Reads are repeatable until
//! [`Session::advance`] moves the pin to the tail, merging every event passed
//! on the way into the open context. Writes go to the context and only become
//! visible to other sessions when [`Session::commit`] publishes them.
//!
//! Sessions are not shared between threads; each thread opens its own.

use crate::branch::Branch;
use crate::error::{KbError, MergeConflict, Result};
use crate::event::EventOrigin;
use crate::item::KnowledgeItem;
use crate::kb::KnowledgeBase;
use crate::query::{Expr, QueryCompiler};
use crate::schema::{AttributeDef, TypeDescriptor};
use crate::storage::SequenceKind;
use crate::transaction::{NestingExit, TransactionContext};
use crate::types::{AttrValue, Attributes, Identity, ObjectId, Revision, TypeName};
use crate::update_chain::UpdateLink;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub struct Session {
    pub(crate) id: u64,
    pub(crate) kb: Arc<KnowledgeBase>,
    pub(crate) branch: Arc<Branch>,
    pub(crate) pinned: Option<Arc<UpdateLink>>,
    pub(crate) context: Option<TransactionContext>,
}

impl Session {
    pub(crate) fn new(id: u64, kb: Arc<KnowledgeBase>, branch: Arc<Branch>) -> Self {
        Self {
            id,
            kb,
            branch,
            pinned: None,
            context: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn branch(&self) -> &Arc<Branch> {
        &self.branch
    }

    #[must_use]
    pub fn kb(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    /// The open transaction context, if any.
    #[must_use]
    pub fn context(&self) -> Option<&TransactionContext> {
        self.context.as_ref()
    }

    /// The revision this session reads at. The first call pins the tail.
    pub fn revision(&mut self) -> Revision {
        let kb = &self.kb;
        self.pinned
            .get_or_insert_with(|| kb.chain.tail())
            .revision()
    }

    /// Catch up with everything committed so far and move the pin to the
    /// tail. Returns the number of revisions merged into the open context.
    pub fn advance(&mut self) -> Result<usize> {
        if self.context.as_ref().is_some_and(TransactionContext::is_locked) {
            return Err(KbError::illegal_state(
                "cannot advance while listeners of this session's commit run",
            ));
        }
        self.kb.refetch()?;
        Ok(self.merge_to_tail())
    }

    /// Move the pin to the tail, merging the events in between.
    pub(crate) fn merge_to_tail(&mut self) -> usize {
        let Some(mut link) = self.pinned.take() else {
            self.pinned = Some(self.kb.chain.tail());
            return 0;
        };
        let mut merged = 0;
        while let Some(next) = link.next().cloned() {
            if let (Some(ctx), Some(event)) = (self.context.as_mut(), next.event()) {
                let own = matches!(event.origin, EventOrigin::Local { session } if session == self.id);
                if !own {
                    let conflicts = ctx.merge(event);
                    if conflicts > 0 {
                        debug!(session = self.id, revision = %event.revision, conflicts, "merge conflicts recorded");
                    }
                    merged += 1;
                }
            }
            link = next;
        }
        self.pinned = Some(link);
        merged
    }

    pub(crate) fn resume_context(&mut self) {
        if let Some(ctx) = self.context.as_mut() {
            ctx.resume();
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    fn context_mut(&mut self) -> &mut TransactionContext {
        let id = self.id;
        self.context
            .get_or_insert_with(|| TransactionContext::new(id))
    }

    /// The context, opened on first use, if it accepts writes.
    fn writable_context(&mut self) -> Result<&mut TransactionContext> {
        let ctx = self.context_mut();
        ctx.check_modifiable()?;
        Ok(ctx)
    }

    /// Open a (possibly nested) transaction. Returns the nesting depth.
    pub fn begin(&mut self) -> Result<usize> {
        self.revision();
        self.context_mut().begin_nested()
    }

    /// Commit the innermost transaction.
    ///
    /// Only the outermost level writes; it returns the new revision, or
    /// `None` if there was nothing to commit. Writes outside an explicit
    /// [`begin`](Self::begin) are committed by a plain `commit()` as well.
    pub fn commit(&mut self) -> Result<Option<Revision>> {
        let Some(ctx) = self.context.as_mut() else {
            return Ok(None);
        };
        match ctx.end_nested(true)? {
            NestingExit::Inner => Ok(None),
            NestingExit::Outermost { rollback_only: true } => {
                ctx.discard();
                self.context = None;
                Err(KbError::illegal_state(
                    "an inner transaction failed; the outer transaction was rolled back",
                ))
            }
            NestingExit::Outermost { .. } => {
                let kb = Arc::clone(&self.kb);
                kb.commit_session(self)
            }
        }
    }

    /// Roll back the innermost transaction. An inner rollback only marks
    /// the enclosing transaction as failed.
    pub fn rollback(&mut self) -> Result<()> {
        let Some(ctx) = self.context.as_mut() else {
            return Ok(());
        };
        if let NestingExit::Outermost { .. } = ctx.end_nested(false)? {
            ctx.discard();
            self.context = None;
            debug!(session = self.id, "rolled back");
        }
        Ok(())
    }

    pub fn set_commit_message(&mut self, message: impl Into<String>) -> Result<()> {
        self.writable_context()?.set_message(message);
        Ok(())
    }

    pub fn set_author(&mut self, author: impl Into<String>) -> Result<()> {
        self.writable_context()?.set_author(author);
        Ok(())
    }

    pub fn check_conflicts(&self) -> Result<()> {
        self.context
            .as_ref()
            .map_or(Ok(()), TransactionContext::check_conflicts)
    }

    #[must_use]
    pub fn conflicts(&self) -> &[MergeConflict] {
        self.context
            .as_ref()
            .map_or(&[][..], TransactionContext::conflicts)
    }

    // ------------------------------------------------------------------
    // Identities
    // ------------------------------------------------------------------

    fn identity(&self, type_name: &TypeName, id: ObjectId) -> Identity {
        Identity::new(self.branch.data_branch(type_name), type_name.clone(), id)
    }

    fn reference_identity(&self, def: &AttributeDef, value: &AttrValue) -> Option<Identity> {
        let target = def.reference_target()?;
        value.as_ref_id().map(|id| self.identity(target, id))
    }

    fn check_attributes(&self, descriptor: &TypeDescriptor, attributes: &Attributes) -> Result<()> {
        for (name, value) in attributes {
            self.kb.schema.check_value(descriptor, name, value)?;
        }
        Ok(())
    }

    fn note_references(&mut self, descriptor: &TypeDescriptor, identity: &Identity, attributes: &Attributes) {
        let targets: Vec<Identity> = descriptor
            .references()
            .filter_map(|def| {
                attributes
                    .get(&def.name)
                    .and_then(|v| self.reference_identity(def, v))
            })
            .collect();
        let ctx = self.context_mut();
        for target in targets {
            ctx.note_reference(target, identity.clone());
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    fn prepare_new(
        &mut self,
        type_name: &TypeName,
        id: Option<ObjectId>,
        attributes: &Attributes,
    ) -> Result<(Arc<TypeDescriptor>, Identity)> {
        let descriptor = Arc::clone(self.kb.schema.descriptor(type_name)?);
        self.check_attributes(&descriptor, attributes)?;
        let id = match id {
            Some(id) => id,
            None => ObjectId(self.kb.read("next_sequence", |c| c.next_sequence(SequenceKind::Object))?),
        };
        let identity = self.identity(type_name, id);
        let revision = self.revision();
        if self.kb.resolve_current(&identity, revision)?.is_some() {
            return Err(KbError::illegal_state(format!("{identity} already exists")));
        }
        Ok((descriptor, identity))
    }

    /// Create an object. Without an explicit id one is allocated.
    pub fn create(
        &mut self,
        type_name: &TypeName,
        id: Option<ObjectId>,
        attributes: Attributes,
    ) -> Result<Arc<KnowledgeItem>> {
        self.writable_context()?;
        let (descriptor, identity) = self.prepare_new(type_name, id, &attributes)?;
        let item = KnowledgeItem::new_local(
            &identity,
            Arc::clone(&descriptor),
            self.kb.cache.reclaim_handle(),
        );
        self.note_references(&descriptor, &identity, &attributes);
        self.context_mut().put_new(Arc::clone(&item), attributes)?;
        debug!(session = self.id, %identity, "created");
        Ok(item)
    }

    /// Create several objects of one type; either all are registered or
    /// none is.
    pub fn create_batch(
        &mut self,
        type_name: &TypeName,
        objects: Vec<(Option<ObjectId>, Attributes)>,
    ) -> Result<Vec<Arc<KnowledgeItem>>> {
        self.writable_context()?;
        let mut prepared = Vec::with_capacity(objects.len());
        for (id, attributes) in objects {
            let (descriptor, identity) = self.prepare_new(type_name, id, &attributes)?;
            let item = KnowledgeItem::new_local(
                &identity,
                Arc::clone(&descriptor),
                self.kb.cache.reclaim_handle(),
            );
            prepared.push((descriptor, identity, item, attributes));
        }
        let batch = prepared
            .iter()
            .map(|(_, _, item, attributes)| (Arc::clone(item), attributes.clone()))
            .collect();
        self.context_mut().put_new_batch(batch)?;
        for (descriptor, identity, _, attributes) in &prepared {
            self.note_references(descriptor, identity, attributes);
        }
        Ok(prepared.into_iter().map(|(_, _, item, _)| item).collect())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The current instance of an object as this session sees it.
    pub fn lookup(&mut self, type_name: &TypeName, id: ObjectId) -> Result<Option<Arc<KnowledgeItem>>> {
        self.kb.schema.descriptor(type_name)?;
        let identity = self.identity(type_name, id);
        if let Some(ctx) = &self.context {
            if let Some(item) = ctx.get_new(&identity) {
                return Ok(Some(Arc::clone(item)));
            }
            if ctx.is_removed(&identity) {
                return Ok(None);
            }
        }
        let revision = self.revision();
        self.kb.resolve_current(&identity, revision)
    }

    /// The read-only version of an object as of `revision`.
    pub fn lookup_at(
        &mut self,
        type_name: &TypeName,
        id: ObjectId,
        revision: Revision,
    ) -> Result<Option<Arc<KnowledgeItem>>> {
        if revision.is_current() {
            return self.lookup(type_name, id);
        }
        self.kb.schema.descriptor(type_name)?;
        self.check_visible(revision)?;
        let (data_branch, revision) = self
            .kb
            .branches
            .resolve_read(self.branch.id(), type_name, revision)?;
        self.kb
            .resolve_historical(&Identity::new(data_branch, type_name.clone(), id), revision)
    }

    fn check_visible(&self, revision: Revision) -> Result<()> {
        let last = self.kb.last_local_revision();
        if revision > last {
            return Err(KbError::illegal_argument(format!(
                "{revision} is not visible yet; latest local revision is {last}"
            )));
        }
        Ok(())
    }

    fn check_readable(&self, item: &KnowledgeItem) -> Result<()> {
        if !item.is_valid() {
            return Err(KbError::illegal_state(format!(
                "{} was rolled back and is no longer valid",
                item.identity()
            )));
        }
        Ok(())
    }

    /// All attributes of `item` as this session sees them.
    pub fn attributes(&mut self, item: &KnowledgeItem) -> Result<Arc<Attributes>> {
        self.check_readable(item)?;
        if item.is_historical() {
            return self.kb.values_at(item, item.key().history);
        }
        let identity = item.identity();
        let revision = self.revision();
        if let Some(ctx) = &self.context {
            if ctx.is_removed(&identity) {
                return Err(KbError::DeletedObjectAccess {
                    key: identity.at(Revision::CURRENT),
                    last_live: Some(identity.at(revision)),
                });
            }
            if let Some(local) = ctx.local_values(&identity) {
                return Ok(Arc::new(local.clone()));
            }
        }
        if item.is_new() {
            return Err(KbError::illegal_state(format!(
                "{identity} belongs to another session's transaction"
            )));
        }
        self.kb.values_at(item, revision)
    }

    /// One attribute; absent attributes read as `Null`.
    pub fn get(&mut self, item: &KnowledgeItem, attribute: &str) -> Result<AttrValue> {
        check_attribute(item.descriptor(), attribute)?;
        Ok(self
            .attributes(item)?
            .get(attribute)
            .cloned()
            .unwrap_or(AttrValue::Null))
    }

    /// One committed attribute value as of `revision`, ignoring local
    /// changes.
    pub fn get_at(&mut self, item: &KnowledgeItem, attribute: &str, revision: Revision) -> Result<AttrValue> {
        check_attribute(item.descriptor(), attribute)?;
        self.check_readable(item)?;
        let revision = if revision.is_current() {
            self.revision()
        } else {
            self.check_visible(revision)?;
            revision
        };
        Ok(self
            .kb
            .values_at(item, revision)?
            .get(attribute)
            .cloned()
            .unwrap_or(AttrValue::Null))
    }

    #[must_use]
    pub fn is_alive(&mut self, item: &KnowledgeItem) -> bool {
        if !item.is_valid() {
            return false;
        }
        if item.is_historical() {
            return true;
        }
        let identity = item.identity();
        if let Some(ctx) = &self.context {
            if ctx.is_new(&identity) {
                return true;
            }
            if ctx.is_removed(&identity) {
                return false;
            }
        }
        let revision = self.revision();
        !item.is_new() && item.is_alive_at(revision)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn check_writable_item(&self, item: &KnowledgeItem) -> Result<()> {
        if item.is_historical() {
            return Err(KbError::illegal_state(format!(
                "{} is a historical version and cannot be modified",
                item.key()
            )));
        }
        self.check_readable(item)
    }

    /// Write one attribute. `Null` removes it.
    pub fn set(&mut self, item: &Arc<KnowledgeItem>, attribute: &str, value: impl Into<AttrValue>) -> Result<()> {
        let value = value.into();
        self.check_writable_item(item)?;
        self.writable_context()?;
        let descriptor = Arc::clone(item.descriptor());
        self.kb.schema.check_value(&descriptor, attribute, &value)?;

        let identity = item.identity();
        let revision = self.revision();
        let local = self.context.as_ref().map_or(false, |ctx| {
            ctx.is_new(&identity) || ctx.is_changed(&identity)
        });
        if self.context.as_ref().is_some_and(|ctx| ctx.is_removed(&identity)) {
            return Err(KbError::DeletedObjectAccess {
                key: identity.at(Revision::CURRENT),
                last_live: Some(identity.at(revision)),
            });
        }
        if !local {
            if item.is_new() {
                return Err(KbError::illegal_state(format!(
                    "{identity} belongs to another session's transaction"
                )));
            }
            let base = self.kb.values_at(item, revision)?;
            self.context_mut().mark_changed(item, base);
        }

        let reference = descriptor
            .attribute(attribute)
            .filter(|def| def.reference_target().is_some())
            .cloned();
        let new_target = reference
            .as_ref()
            .and_then(|def| self.reference_identity(def, &value));
        let previous = self.context_mut().set_local(&identity, attribute, value)?;
        if let Some(def) = &reference {
            let old_target = previous
                .as_ref()
                .and_then(|v| self.reference_identity(def, v));
            let ctx = self.context_mut();
            if let Some(old) = old_target {
                ctx.drop_reference(&old, &identity);
            }
            if let Some(new) = new_target {
                ctx.note_reference(new, identity.clone());
            }
        }
        Ok(())
    }

    /// Delete an object. Returns true if a persistent deletion was recorded,
    /// false if the object only existed in this transaction.
    pub fn delete(&mut self, item: &Arc<KnowledgeItem>) -> Result<bool> {
        self.check_writable_item(item)?;
        self.writable_context()?;
        let identity = item.identity();
        let revision = self.revision();
        let (is_new, is_removed) = self
            .context
            .as_ref()
            .map_or((false, false), |ctx| (ctx.is_new(&identity), ctx.is_removed(&identity)));
        if is_removed {
            return Ok(false);
        }
        let base = if is_new {
            Arc::new(Attributes::new())
        } else if item.is_new() {
            return Err(KbError::illegal_state(format!(
                "{identity} belongs to another session's transaction"
            )));
        } else {
            self.kb.values_at(item, revision)?
        };
        let persistent = self.context_mut().remove(item, base)?;
        debug!(session = self.id, %identity, persistent, "deleted");
        Ok(persistent)
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Objects of `type_name` matching `expr`, including this session's
    /// uncommitted creations and changes and excluding its deletions.
    pub fn search(&mut self, type_name: &TypeName, expr: &Expr) -> Result<Vec<Arc<KnowledgeItem>>> {
        let revision = self.revision();
        let data_branch = self.branch.data_branch(type_name);
        let query = QueryCompiler::new(&self.kb.schema).compile(type_name, data_branch, revision, expr)?;
        let rows = self.kb.read("search", |c| query.execute(c))?;

        let mut seen = BTreeSet::new();
        let mut found = Vec::new();
        for row in &rows {
            let identity = row.identity();
            if let Some(ctx) = &self.context {
                if ctx.is_removed(&identity) || ctx.is_changed(&identity) {
                    continue;
                }
            }
            let Some(item) = self.kb.materialize_row(row, revision)? else {
                continue;
            };
            if let Some(residual) = query.residual() {
                if !residual.matches(&*self.kb.values_at(&item, revision)?) {
                    continue;
                }
            }
            seen.insert(identity);
            found.push(item);
        }

        if let Some(ctx) = &self.context {
            let local = ctx
                .new_entries()
                .map(|(identity, entry)| (identity, &entry.item, &entry.values))
                .chain(
                    ctx.changed_entries()
                        .map(|(identity, entry)| (identity, &entry.item, &entry.values)),
                );
            for (identity, item, values) in local {
                if identity.type_name == *type_name
                    && identity.branch == data_branch
                    && !seen.contains(identity)
                    && expr.matches(values)
                {
                    found.push(Arc::clone(item));
                }
            }
        }
        found.sort_by_key(|item| item.identity());
        debug!(session = self.id, type_name = %type_name, %revision, hits = found.len(), "search");
        Ok(found)
    }
}

fn check_attribute(descriptor: &TypeDescriptor, attribute: &str) -> Result<()> {
    if descriptor.attribute(attribute).is_none() && !descriptor.flexible {
        return Err(KbError::illegal_argument(format!(
            "type `{}` has no attribute `{attribute}`",
            descriptor.name
        )));
    }
    Ok(())
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut ctx) = self.context.take() {
            if !ctx.is_empty() {
                debug!(session = self.id, "session dropped with uncommitted changes");
            }
            ctx.discard();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("branch", &self.branch.id())
            .field("pinned", &self.pinned.as_ref().map(|l| l.revision()))
            .field("context", &self.context.as_ref().map(TransactionContext::state))
            .finish()
    }
}
