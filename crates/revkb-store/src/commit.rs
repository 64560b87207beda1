//! Commit coordinator.
//!
//! Turns a session's transaction context into one revision:
//!
//! ```text
//!  begin_commit ──> refetch lock ──> begin + allocate rN ──> refetch (.., rN-1]
//!        │                                                         │
//!        │                 merge into context, check conflicts <──┘
//!        │                                │
//!        │                     plan (before/after per object)
//!        │                                │
//!        │                     validate (mandatory, targets, vetoes)
//!        │                                │
//!        │                     write: deletes, updates, inserts, record
//!        │                                │
//!        └── on error: rollback ──   commit ──> cache + chain ──> listeners
//! ```
//!
//! A revision number is allocated before anything can fail and is never
//! handed back, so an aborted commit leaves a gap in the sequence.

use crate::branch::Branch;
use crate::error::{KbError, Result};
use crate::event::{ChangeEvent, EventOrigin, ObjectChange};
use crate::flex::split_flex;
use crate::item::KnowledgeItem;
use crate::kb::KnowledgeBase;
use crate::refetch::Holder;
use crate::schema::TypeDescriptor;
use crate::session::Session;
use crate::storage::{
    rollback_write_connection, BranchRecord, BranchSwitchRow, Connection, RevisionRecord,
    SequenceKind, StoredRow,
};
use crate::transaction::TransactionContext;
use crate::types::{AttrValue, Attributes, BranchId, Identity, Revision, TypeName};
use crate::update_chain::{Cleanup, UpdateLink};
use crate::values::{UpdateOutcome, Values};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Session id recorded for revisions written by the knowledge base itself.
const KB_SESSION: u64 = 0;

struct PlannedChange {
    item: Arc<KnowledgeItem>,
    identity: Identity,
    before: Option<Arc<Attributes>>,
    after: Option<Arc<Attributes>>,
}

impl PlannedChange {
    fn to_change(&self, revision: Revision) -> ObjectChange {
        ObjectChange {
            key: self.identity.at(revision),
            before: self.before.clone(),
            after: self.after.clone(),
        }
    }

    fn after(&self) -> &Attributes {
        self.after.as_deref().unwrap_or(&EMPTY)
    }
}

static EMPTY: Attributes = Attributes::new();

#[derive(Default)]
struct CommitPlan {
    created: Vec<PlannedChange>,
    updated: Vec<PlannedChange>,
    deleted: Vec<PlannedChange>,
}

impl CommitPlan {
    fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

fn by_type(changes: &[PlannedChange]) -> BTreeMap<&TypeName, Vec<&PlannedChange>> {
    let mut buckets: BTreeMap<&TypeName, Vec<&PlannedChange>> = BTreeMap::new();
    for change in changes {
        buckets.entry(&change.identity.type_name).or_default().push(change);
    }
    buckets
}

fn without_nulls(attributes: &Attributes) -> Attributes {
    attributes
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl KnowledgeBase {
    /// Borrow the write connection, open a transaction and allocate the
    /// next revision, retrying retryable failures on a fresh connection.
    fn begin_write(&self) -> Result<(Box<dyn Connection>, Revision)> {
        let mut attempt = 0_u32;
        loop {
            let mut conn = self.pool.borrow_write_connection()?;
            let result = conn
                .begin()
                .and_then(|()| conn.next_sequence(SequenceKind::Revision));
            match result {
                Ok(value) => {
                    let revision = Revision(value);
                    debug!(%revision, connection = conn.id(), "revision allocated");
                    return Ok((conn, revision));
                }
                Err(err) => {
                    let retry = attempt < self.pool.retry_count() && self.pool.can_retry(&err);
                    if err.poisons_connection() {
                        self.pool.invalidate_connection(conn);
                    } else {
                        rollback_write_connection(self.pool.as_ref(), conn);
                    }
                    if !retry {
                        return Err(err.into());
                    }
                    attempt += 1;
                    warn!(attempt, error = %err, "retrying commit start on a fresh connection");
                    let backoff = self.pool.retry_backoff();
                    if !backoff.is_zero() {
                        std::thread::sleep(backoff * attempt);
                    }
                }
            }
        }
    }

    /// Give a failed write transaction back: roll it back, or drop the
    /// connection if its state can no longer be trusted.
    fn abandon_write(&self, conn: Box<dyn Connection>, err: &KbError, revision: Revision) {
        match err {
            KbError::Storage(e) if e.poisons_connection() => self.pool.invalidate_connection(conn),
            _ => rollback_write_connection(self.pool.as_ref(), conn),
        }
        if let Some(flex) = &self.flex {
            if let Err(e) = flex.discard(revision) {
                warn!(%revision, error = %e, "could not discard flexible attributes of aborted revision");
            }
        }
    }

    /// Commit the outermost transaction of `session`.
    ///
    /// Returns `None` if there was nothing to write.
    pub(crate) fn commit_session(&self, session: &mut Session) -> Result<Option<Revision>> {
        {
            let Some(ctx) = session.context.as_mut() else {
                return Ok(None);
            };
            ctx.begin_commit()?;
            if let Err(err) = ctx.check_conflicts() {
                ctx.resume();
                return Err(err);
            }
            if ctx.is_empty() {
                ctx.finish();
                session.context = None;
                return Ok(None);
            }
        }

        let guard = match self.refetch_lock.acquire(
            Holder::Commit {
                session: session.id,
            },
            self.config.refetch_timeout(),
        ) {
            Ok(guard) => guard,
            Err(err) => {
                session.resume_context();
                return Err(err);
            }
        };
        let (mut conn, revision) = match self.begin_write() {
            Ok(started) => started,
            Err(err) => {
                drop(guard);
                session.resume_context();
                return Err(err);
            }
        };

        let mut links = Vec::new();
        match self.run_commit(session, conn.as_mut(), revision, &mut links) {
            Ok(Some((event, plan))) => {
                let mut cleanups = Vec::new();
                for change in &plan.created {
                    let after = change.after.clone().unwrap_or_default();
                    change
                        .item
                        .make_persistent(Values::new(after, revision, Revision::CURRENT));
                    self.cache.insert(Arc::clone(&change.item), revision);
                }
                for change in &plan.updated {
                    let after = change.after.clone().unwrap_or_default();
                    if let UpdateOutcome::Prepended { superseded: Some(_) } = change
                        .item
                        .update_values(Values::new(after, revision, Revision::CURRENT))
                    {
                        cleanups.push(Cleanup {
                            item: Arc::downgrade(&change.item),
                            before: revision,
                        });
                    }
                }
                for change in &plan.deleted {
                    change.item.cap(revision.prev());
                }
                if !self.config.cleanup_history {
                    cleanups.clear();
                }
                let changes = event.len();
                let link = self.chain.append(Arc::new(event), cleanups);
                self.pool.release_write_connection(conn);
                drop(guard);

                links.push(Arc::clone(&link));
                session.pinned = Some(link);
                if let Some(ctx) = session.context.as_mut() {
                    ctx.lock();
                }
                self.publish(&links, Some(&mut *session));
                if let Some(ctx) = session.context.as_mut() {
                    ctx.unlock();
                    ctx.finish();
                }
                session.context = None;
                info!(%revision, session = session.id, changes, "committed");
                Ok(Some(revision))
            }
            Ok(None) => {
                rollback_write_connection(self.pool.as_ref(), conn);
                drop(guard);
                self.publish(&links, None);
                if let Some(ctx) = session.context.as_mut() {
                    ctx.finish();
                }
                session.context = None;
                debug!(%revision, "commit had no net changes; revision left unused");
                Ok(None)
            }
            Err(err) => {
                self.abandon_write(conn, &err, revision);
                drop(guard);
                self.publish(&links, None);
                match &err {
                    KbError::Storage(_) => {
                        if let Some(ctx) = session.context.as_mut() {
                            ctx.discard();
                        }
                        session.context = None;
                    }
                    _ => session.resume_context(),
                }
                warn!(%revision, session = session.id, error = %err, "commit rolled back");
                Err(err)
            }
        }
    }

    fn run_commit(
        &self,
        session: &mut Session,
        conn: &mut dyn Connection,
        revision: Revision,
        links: &mut Vec<Arc<UpdateLink>>,
    ) -> Result<Option<(ChangeEvent, CommitPlan)>> {
        links.extend(self.refetch_locked(revision.prev())?);
        assert_eq!(
            self.chain.last_local_revision().next(),
            revision,
            "allocated revision does not follow the last processed one"
        );
        session.merge_to_tail();

        let branch = Arc::clone(&session.branch);
        let Some(ctx) = session.context.as_ref() else {
            return Err(KbError::illegal_state("transaction context vanished during commit"));
        };
        ctx.check_conflicts()?;

        let plan = self.plan_commit(ctx, revision)?;
        if plan.is_empty() {
            return Ok(None);
        }
        let record = RevisionRecord {
            revision,
            author: ctx
                .author()
                .map_or_else(|| self.config.default_author.clone(), str::to_string),
            message: ctx.message().unwrap_or_default().to_string(),
            timestamp: Utc::now(),
        };
        let event = ChangeEvent {
            revision,
            record,
            origin: EventOrigin::Local {
                session: session.id,
            },
            created: plan.created.iter().map(|c| c.to_change(revision)).collect(),
            updated: plan.updated.iter().map(|c| c.to_change(revision)).collect(),
            deleted: plan.deleted.iter().map(|c| c.to_change(revision)).collect(),
            branch_created: None,
        };

        self.validate(&branch, ctx, &plan, &event, revision.prev())?;
        self.write_plan(conn, &plan, &event.record)?;
        conn.commit()?;
        Ok(Some((event, plan)))
    }

    /// Net before/after of every buffered object against the latest
    /// committed state.
    fn plan_commit(&self, ctx: &TransactionContext, revision: Revision) -> Result<CommitPlan> {
        let latest = revision.prev();
        let mut plan = CommitPlan::default();

        for (identity, entry) in ctx.new_entries() {
            plan.created.push(PlannedChange {
                item: Arc::clone(&entry.item),
                identity: identity.clone(),
                before: None,
                after: Some(Arc::new(without_nulls(&entry.values))),
            });
        }

        for (identity, entry) in ctx.changed_entries() {
            let current = self.values_at(&entry.item, latest)?;
            let mut after = (*current).clone();
            for name in &entry.dirty {
                match entry.values.get(name) {
                    Some(value) if !value.is_null() => {
                        after.insert(name.clone(), value.clone());
                    }
                    _ => {
                        after.remove(name);
                    }
                }
            }
            if after == *current {
                debug!(%identity, "reverted change dropped from commit");
                continue;
            }
            plan.updated.push(PlannedChange {
                item: Arc::clone(&entry.item),
                identity: identity.clone(),
                before: Some(current),
                after: Some(Arc::new(after)),
            });
        }

        for (identity, entry) in ctx.removed_entries() {
            match self.values_at(&entry.item, latest) {
                Ok(current) => plan.deleted.push(PlannedChange {
                    item: Arc::clone(&entry.item),
                    identity: identity.clone(),
                    before: Some(current),
                    after: None,
                }),
                Err(KbError::DeletedObjectAccess { .. }) => {
                    debug!(%identity, "already deleted; nothing to write");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(plan)
    }

    fn validate(
        &self,
        branch: &Branch,
        ctx: &TransactionContext,
        plan: &CommitPlan,
        pending: &ChangeEvent,
        latest: Revision,
    ) -> Result<()> {
        for change in plan.created.iter().chain(plan.updated.iter()) {
            let descriptor = change.item.descriptor();
            let after = change.after();
            for def in descriptor.attributes.iter().filter(|d| d.mandatory) {
                if after.get(&def.name).map_or(true, AttrValue::is_null) {
                    return Err(KbError::ConstraintViolation {
                        identity: change.identity.clone(),
                        reason: format!("mandatory attribute `{}` is missing", def.name),
                    });
                }
            }
            let before = change.before.as_deref();
            for def in descriptor.references() {
                let Some(target_id) = after.get(&def.name).and_then(AttrValue::as_ref_id) else {
                    continue;
                };
                if before.and_then(|b| b.get(&def.name)) == after.get(&def.name) {
                    continue;
                }
                let Some(target_type) = def.reference_target() else {
                    continue;
                };
                let target = Identity::new(branch.data_branch(target_type), target_type.clone(), target_id);
                let alive = if ctx.is_new(&target) {
                    true
                } else if ctx.is_removed(&target) {
                    false
                } else {
                    self.resolve_current(&target, latest)?.is_some()
                };
                if !alive {
                    return Err(KbError::ConstraintViolation {
                        identity: change.identity.clone(),
                        reason: format!("`{}` refers to {target}, which does not exist", def.name),
                    });
                }
            }
        }

        for change in &plan.deleted {
            self.check_delete_veto(branch, ctx, &change.identity, latest)?;
        }

        for veto in self.vetoes.read().iter() {
            veto.check(pending).map_err(|reason| KbError::CommitVetoed {
                check: veto.name().to_string(),
                reason,
            })?;
        }
        Ok(())
    }

    /// A target with a live inbound veto reference may not be deleted.
    fn check_delete_veto(
        &self,
        branch: &Branch,
        ctx: &TransactionContext,
        target: &Identity,
        latest: Revision,
    ) -> Result<()> {
        let veto = |referrer: Identity, attribute: &str| KbError::DeleteVeto {
            target: target.clone(),
            referrer,
            attribute: attribute.to_string(),
        };

        for (source, def) in self.schema.referrers_of(&target.type_name) {
            if !def.vetoes_delete() {
                continue;
            }
            let source_branch = branch.data_branch(&source.name);
            let rows = self.read("find_referrers", |c| {
                c.find_referrers(source_branch, &source.name, &def.name, target.id, latest)
            })?;
            for row in rows {
                let referrer = row.identity();
                if ctx.is_removed(&referrer) {
                    continue;
                }
                let still_refers = ctx.local_values(&referrer).map_or(true, |local| {
                    local.get(&def.name).and_then(AttrValue::as_ref_id) == Some(target.id)
                });
                if still_refers {
                    return Err(veto(referrer, &def.name));
                }
            }
        }

        for referrer in ctx.referrers_of(target) {
            let Some(local) = ctx.local_values(&referrer) else {
                continue;
            };
            let descriptor = self.schema.descriptor(&referrer.type_name)?;
            for def in descriptor.references().filter(|d| d.vetoes_delete()) {
                if def.reference_target() == Some(&target.type_name)
                    && local.get(&def.name).and_then(AttrValue::as_ref_id) == Some(target.id)
                {
                    return Err(veto(referrer.clone(), &def.name));
                }
            }
        }
        Ok(())
    }

    /// Deletions, then updates, then insertions, each bucketed by type.
    fn write_plan(&self, conn: &mut dyn Connection, plan: &CommitPlan, record: &RevisionRecord) -> Result<()> {
        let revision = record.revision;
        let last_valid = revision.prev();

        for (type_name, changes) in by_type(&plan.deleted) {
            let identities: Vec<Identity> = changes.iter().map(|c| c.identity.clone()).collect();
            conn.outdate_rows(identities, last_valid)?;
            if let Some(flex) = &self.flex {
                if self.schema.descriptor(type_name)?.flexible {
                    for change in &changes {
                        flex.delete(&change.identity, revision)?;
                    }
                }
            }
            debug!(%revision, type_name = %type_name, count = changes.len(), "rows outdated");
        }

        for (type_name, changes) in by_type(&plan.updated) {
            let identities: Vec<Identity> = changes.iter().map(|c| c.identity.clone()).collect();
            conn.outdate_rows(identities, last_valid)?;
            let rows = self.rows_for(&changes, revision)?;
            conn.insert_rows(rows)?;
            debug!(%revision, type_name = %type_name, count = changes.len(), "rows updated");
        }

        for (type_name, changes) in by_type(&plan.created) {
            let rows = self.rows_for(&changes, revision)?;
            conn.insert_rows(rows)?;
            debug!(%revision, type_name = %type_name, count = changes.len(), "rows inserted");
        }

        conn.insert_revision(record.clone())?;
        Ok(())
    }

    /// Stored rows for `changes`; flexible attributes go to the flex store.
    fn rows_for(&self, changes: &[&PlannedChange], revision: Revision) -> Result<Vec<StoredRow>> {
        changes
            .iter()
            .map(|change| {
                let attributes =
                    self.row_attributes(change.item.descriptor(), &change.identity, revision, change.after())?;
                Ok(StoredRow {
                    branch: change.identity.branch,
                    type_name: change.identity.type_name.clone(),
                    id: change.identity.id,
                    rev_min: revision,
                    rev_max: Revision::CURRENT,
                    attributes,
                })
            })
            .collect()
    }

    /// The part of `payload` stored in the row. With a flex store attached,
    /// undeclared attributes of flexible types go there instead.
    fn row_attributes(
        &self,
        descriptor: &TypeDescriptor,
        identity: &Identity,
        revision: Revision,
        payload: &Attributes,
    ) -> Result<Attributes> {
        match &self.flex {
            Some(flex) if descriptor.flexible => {
                let (fixed, flexible) = split_flex(descriptor, payload);
                flex.store(identity, revision, &flexible)?;
                Ok(fixed)
            }
            _ => Ok(payload.clone()),
        }
    }

    // ------------------------------------------------------------------
    // Branch creation
    // ------------------------------------------------------------------

    /// Fork `base` at `base_revision` (default: the latest revision).
    ///
    /// Only `branched` types get their own rows on the new branch; every
    /// other type keeps reading and writing the base's data branch.
    pub fn create_branch(
        &self,
        base: BranchId,
        base_revision: Option<Revision>,
        branched: &[TypeName],
        message: &str,
    ) -> Result<Arc<Branch>> {
        for type_name in branched {
            self.schema.descriptor(type_name)?;
        }
        let guard = self
            .refetch_lock
            .acquire(Holder::Branch, self.config.refetch_timeout())?;
        let (mut conn, revision) = self.begin_write()?;

        let mut links = Vec::new();
        match self.run_branch(conn.as_mut(), revision, base, base_revision, branched, message, &mut links) {
            Ok((record, event)) => {
                let branch = self.branches.register(record);
                let link = self.chain.append(Arc::new(event), Vec::new());
                self.pool.release_write_connection(conn);
                drop(guard);
                links.push(link);
                self.publish(&links, None);
                info!(branch = %branch.id(), base = %base, base_revision = %branch.base_revision(), %revision, "branch created");
                Ok(branch)
            }
            Err(err) => {
                self.abandon_write(conn, &err, revision);
                drop(guard);
                self.publish(&links, None);
                warn!(%revision, error = %err, "branch creation rolled back");
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_branch(
        &self,
        conn: &mut dyn Connection,
        revision: Revision,
        base: BranchId,
        base_revision: Option<Revision>,
        branched: &[TypeName],
        message: &str,
        links: &mut Vec<Arc<UpdateLink>>,
    ) -> Result<(BranchRecord, ChangeEvent)> {
        links.extend(self.refetch_locked(revision.prev())?);
        assert_eq!(
            self.chain.last_local_revision().next(),
            revision,
            "allocated revision does not follow the last processed one"
        );
        let latest = revision.prev();
        let base_revision = base_revision.unwrap_or(latest);
        if base_revision > latest {
            return Err(KbError::illegal_argument(format!(
                "cannot branch at {base_revision}: latest revision is {latest}"
            )));
        }

        let id = BranchId(conn.next_sequence(SequenceKind::Branch)?);
        let record = self.branches.plan_branch(
            id,
            base,
            base_revision,
            revision,
            self.schema.type_names(),
            branched,
        )?;
        self.check_branch_crossing(conn, &record)?;

        let mut created = Vec::new();
        for (type_name, _) in record.data_branches.iter().filter(|(_, data)| **data == id) {
            let descriptor = self.schema.descriptor(type_name)?;
            let (source_branch, source_revision) =
                self.branches.resolve_read(base, type_name, base_revision)?;
            let rows = conn.scan_type(source_branch, type_name, source_revision)?;
            let mut copies = Vec::with_capacity(rows.len());
            for row in rows {
                let identity = Identity::new(id, type_name.clone(), row.id);
                let values = self.row_values(&row)?;
                let attributes = self.row_attributes(descriptor, &identity, revision, values.payload())?;
                copies.push(StoredRow {
                    branch: id,
                    type_name: type_name.clone(),
                    id: row.id,
                    rev_min: revision,
                    rev_max: Revision::CURRENT,
                    attributes,
                });
                created.push(ObjectChange {
                    key: identity.at(revision),
                    before: None,
                    after: Some(Arc::clone(values.payload())),
                });
            }
            debug!(branch = %id, type_name = %type_name, rows = copies.len(), "rows copied to branch");
            conn.insert_rows(copies)?;
        }

        for (type_name, data_branch) in &record.data_branches {
            conn.insert_branch_switch(BranchSwitchRow {
                branch: id,
                type_name: type_name.clone(),
                data_branch: *data_branch,
                revision,
            })?;
        }
        conn.insert_branch(record.clone())?;
        let revision_record = RevisionRecord {
            revision,
            author: self.config.default_author.clone(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        conn.insert_revision(revision_record.clone())?;
        conn.commit()?;

        let event = ChangeEvent {
            revision,
            record: revision_record,
            origin: EventOrigin::Local {
                session: KB_SESSION,
            },
            created,
            updated: Vec::new(),
            deleted: Vec::new(),
            branch_created: Some(record.clone()),
        };
        Ok((record, event))
    }

    /// A non-global reference between a branched and an unbranched type may
    /// not be in use at the branch point.
    fn check_branch_crossing(&self, conn: &mut dyn Connection, record: &BranchRecord) -> Result<()> {
        let Some(base) = record.base_branch else {
            return Ok(());
        };
        let is_branched = |t: &TypeName| record.data_branches.get(t).copied() == Some(record.id);
        for source in self.schema.descriptors() {
            for def in source.references() {
                if def.is_branch_global() {
                    continue;
                }
                let Some(target) = def.reference_target() else {
                    continue;
                };
                if is_branched(&source.name) == is_branched(target) {
                    continue;
                }
                let (branch, revision) =
                    self.branches.resolve_read(base, &source.name, record.base_revision)?;
                let in_use = conn
                    .scan_type(branch, &source.name, revision)?
                    .iter()
                    .any(|row| row.attributes.get(&def.name).is_some_and(|v| !v.is_null()));
                if in_use {
                    return Err(KbError::BranchCrossing {
                        source_type: source.name.clone(),
                        attribute: def.name.clone(),
                        target_type: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
