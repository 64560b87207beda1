//! End-to-end tests for the knowledge base

use super::*;
use crate::refetch::Holder;
use crate::storage::{Fault, FaultKind, FaultPoint};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Helper schema shared by every scenario
fn test_schema() -> Schema {
    Schema::new(vec![
        TypeDescriptor::new("User").primitive("name"),
        TypeDescriptor::new("Doc")
            .primitive("title")
            .primitive("status")
            .global_reference("author", "User"),
        TypeDescriptor::new("Comment")
            .primitive("text")
            .veto_reference("doc", "Doc"),
        TypeDescriptor::new("Tag").mandatory("label"),
        TypeDescriptor::new("Note").primitive("title").flexible(),
    ])
    .unwrap()
}

fn test_kb() -> Arc<KnowledgeBase> {
    KnowledgeBase::in_memory(test_schema()).unwrap()
}

fn doc() -> TypeName {
    "Doc".into()
}

/// Create and commit one document, returning its item.
fn committed_doc(session: &mut Session, id: u64, title: &str) -> Arc<KnowledgeItem> {
    let item = session
        .create(&doc(), Some(ObjectId(id)), attrs([("title", title)]))
        .unwrap();
    session.commit().unwrap();
    item
}

fn text(value: &str) -> AttrValue {
    AttrValue::Text(value.to_string())
}

#[test]
fn test_document_lifecycle_across_revisions() {
    let kb = test_kb();
    let mut session = kb.session();

    let item = session
        .create(&doc(), Some(ObjectId(42)), attrs([("title", "a")]))
        .unwrap();
    assert_eq!(session.commit().unwrap(), Some(Revision(1)));

    session.set(&item, "title", "b").unwrap();
    assert_eq!(session.commit().unwrap(), Some(Revision(2)));

    assert_eq!(session.get_at(&item, "title", Revision(1)).unwrap(), text("a"));
    assert_eq!(session.get_at(&item, "title", Revision(2)).unwrap(), text("b"));
    assert_eq!(session.get(&item, "title").unwrap(), text("b"));

    let as_of_r1 = session.lookup_at(&doc(), ObjectId(42), Revision(1)).unwrap().unwrap();
    assert!(as_of_r1.is_historical());
    assert_eq!(session.get(&as_of_r1, "title").unwrap(), text("a"));
    assert!(
        session.set(&as_of_r1, "title", "x").is_err(),
        "historical versions are read-only"
    );

    assert!(session.delete(&item).unwrap());
    assert_eq!(session.commit().unwrap(), Some(Revision(3)));

    let identity = item.identity();
    match session.get_at(&item, "title", Revision(3)) {
        Err(KbError::DeletedObjectAccess { key, last_live }) => {
            assert_eq!(key, identity.at(Revision(3)));
            assert_eq!(last_live, Some(identity.at(Revision(2))));
        }
        other => panic!("expected a not-alive failure, got {other:?}"),
    }
    assert_eq!(session.get_at(&item, "title", Revision(2)).unwrap(), text("b"));
    assert!(session.lookup(&doc(), ObjectId(42)).unwrap().is_none());
    assert!(session
        .lookup_at(&doc(), ObjectId(42), Revision(3))
        .unwrap()
        .is_none());

    let history = kb.history(&identity).unwrap();
    assert_eq!(history.len(), 2, "one stored row per committed version");
    assert_eq!(history[0].rev_max, Revision(1));
    assert_eq!(history[1].rev_max, Revision(2));
}

#[test]
fn test_reads_beyond_the_last_revision_are_rejected() {
    let kb = test_kb();
    let mut session = kb.session();
    let item = committed_doc(&mut session, 1, "a");

    assert!(matches!(
        session.get_at(&item, "title", Revision(7)),
        Err(KbError::IllegalArgument(_))
    ));
    assert!(matches!(
        session.get(&item, "nope"),
        Err(KbError::IllegalArgument(_))
    ));
    assert!(matches!(
        session.create(&"Ghost".into(), None, Attributes::new()),
        Err(KbError::UnknownType(_))
    ));
}

#[test]
fn test_read_your_writes_and_isolation() {
    let kb = test_kb();
    let mut writer = kb.session();
    let item = committed_doc(&mut writer, 1, "a");

    writer.set(&item, "title", "draft").unwrap();
    assert_eq!(writer.get(&item, "title").unwrap(), text("draft"));

    let mut reader = kb.session();
    let seen = reader.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    assert!(Arc::ptr_eq(&seen, &item), "one cached instance per identity");
    assert_eq!(reader.get(&seen, "title").unwrap(), text("a"));

    let again = reader.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    assert!(Arc::ptr_eq(&seen, &again));
}

#[test]
fn test_creating_an_existing_object_fails() {
    let kb = test_kb();
    let mut session = kb.session();
    committed_doc(&mut session, 1, "a");

    assert!(matches!(
        session.create(&doc(), Some(ObjectId(1)), attrs([("title", "again")])),
        Err(KbError::IllegalState(_))
    ));
}

#[test]
fn test_allocated_ids_are_unique() {
    let kb = test_kb();
    let mut session = kb.session();
    let items = session
        .create_batch(
            &doc(),
            vec![
                (None, attrs([("title", "one")])),
                (None, attrs([("title", "two")])),
            ],
        )
        .unwrap();
    session.commit().unwrap();

    assert_ne!(items[0].id(), items[1].id());
    assert_eq!(session.get(&items[1], "title").unwrap(), text("two"));
}

#[test]
fn test_rollback_invalidates_new_items() {
    let kb = test_kb();
    let mut session = kb.session();
    let item = session
        .create(&doc(), Some(ObjectId(1)), attrs([("title", "a")]))
        .unwrap();

    session.rollback().unwrap();

    assert!(!item.is_valid());
    assert!(matches!(session.attributes(&item), Err(KbError::IllegalState(_))));
    assert!(session.lookup(&doc(), ObjectId(1)).unwrap().is_none());
    assert_eq!(kb.revisions().unwrap().len(), 1, "only the bootstrap revision");
}

#[test]
fn test_reverted_change_commits_nothing() {
    let kb = test_kb();
    let mut session = kb.session();
    let item = committed_doc(&mut session, 1, "a");

    session.set(&item, "title", "b").unwrap();
    session.set(&item, "title", "a").unwrap();
    assert_eq!(session.commit().unwrap(), None);
    assert_eq!(kb.revisions().unwrap().len(), 2);

    session.set(&item, "title", "c").unwrap();
    assert_eq!(
        session.commit().unwrap(),
        Some(Revision(3)),
        "the unused revision leaves a gap"
    );
}

#[test]
fn test_nested_transactions() {
    let kb = test_kb();
    let mut session = kb.session();

    assert_eq!(session.begin().unwrap(), 1);
    session
        .create(&doc(), Some(ObjectId(1)), attrs([("title", "outer")]))
        .unwrap();
    assert_eq!(session.begin().unwrap(), 2);
    session
        .create(&doc(), Some(ObjectId(2)), attrs([("title", "inner")]))
        .unwrap();
    assert_eq!(session.commit().unwrap(), None, "inner commit writes nothing");
    assert_eq!(session.commit().unwrap(), Some(Revision(1)));
    assert!(session.lookup(&doc(), ObjectId(2)).unwrap().is_some());

    let item = session.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    session.begin().unwrap();
    session.set(&item, "title", "changed").unwrap();
    session.begin().unwrap();
    session.set(&item, "status", "broken").unwrap();
    session.rollback().unwrap();

    assert!(matches!(session.commit(), Err(KbError::IllegalState(_))));
    assert_eq!(session.get(&item, "title").unwrap(), text("outer"));
    assert_eq!(kb.revisions().unwrap().len(), 2);
}

#[test]
fn test_conflict_when_deleted_locally_and_changed_remotely() {
    let kb = test_kb();
    let mut setup = kb.session();
    committed_doc(&mut setup, 1, "a");

    let mut deleter = kb.session();
    let mut editor = kb.session();
    let theirs = deleter.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    let mine = editor.lookup(&doc(), ObjectId(1)).unwrap().unwrap();

    deleter.delete(&theirs).unwrap();
    editor.set(&mine, "title", "b").unwrap();
    editor.commit().unwrap();

    let err = deleter.commit().unwrap_err();
    assert!(err.is_conflict());
    assert!(err.conflicts().unwrap().has(ConflictKind::DeletedThenChanged));
    assert!(!deleter.conflicts().is_empty());

    deleter.rollback().unwrap();
    deleter.advance().unwrap();
    assert_eq!(deleter.get(&theirs, "title").unwrap(), text("b"));
}

#[test]
fn test_conflict_when_changed_locally_and_deleted_remotely() {
    let kb = test_kb();
    let mut setup = kb.session();
    committed_doc(&mut setup, 1, "a");

    let mut deleter = kb.session();
    let mut editor = kb.session();
    let theirs = deleter.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    let mine = editor.lookup(&doc(), ObjectId(1)).unwrap().unwrap();

    editor.set(&mine, "title", "b").unwrap();
    deleter.delete(&theirs).unwrap();
    deleter.commit().unwrap();

    let err = editor.commit().unwrap_err();
    assert!(err.conflicts().unwrap().has(ConflictKind::ChangedThenDeleted));
}

#[test]
fn test_concurrent_creation_conflicts() {
    let kb = test_kb();
    let mut first = kb.session();
    let mut second = kb.session();

    first
        .create(&doc(), Some(ObjectId(7)), attrs([("title", "first")]))
        .unwrap();
    second
        .create(&doc(), Some(ObjectId(7)), attrs([("title", "second")]))
        .unwrap();
    first.commit().unwrap();

    let err = second.commit().unwrap_err();
    assert!(err.conflicts().unwrap().has(ConflictKind::ConcurrentCreation));
}

#[test]
fn test_dangling_reference_conflict() {
    let kb = test_kb();
    let mut setup = kb.session();
    setup
        .create(&"User".into(), Some(ObjectId(5)), attrs([("name", "ann")]))
        .unwrap();
    setup
        .create(&doc(), Some(ObjectId(1)), attrs([("title", "a")]))
        .unwrap();
    setup.commit().unwrap();

    let mut author = kb.session();
    let item = author.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    author.set(&item, "author", AttrValue::Ref(ObjectId(5))).unwrap();

    let mut remover = kb.session();
    let user = remover.lookup(&"User".into(), ObjectId(5)).unwrap().unwrap();
    remover.delete(&user).unwrap();
    remover.commit().unwrap();

    let err = author.commit().unwrap_err();
    assert!(err.conflicts().unwrap().has(ConflictKind::DanglingReference));
}

#[test]
fn test_disjoint_changes_merge_cleanly() {
    let kb = test_kb();
    let mut setup = kb.session();
    committed_doc(&mut setup, 1, "a");

    let mut left = kb.session();
    let mut right = kb.session();
    let l = left.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    let r = right.lookup(&doc(), ObjectId(1)).unwrap().unwrap();

    left.set(&l, "title", "b").unwrap();
    right.set(&r, "status", "review").unwrap();
    left.commit().unwrap();
    right.commit().unwrap();

    assert_eq!(right.get(&r, "title").unwrap(), text("b"));
    assert_eq!(right.get(&r, "status").unwrap(), text("review"));
}

#[test]
fn test_delete_veto_and_recovery() {
    let kb = test_kb();
    let mut session = kb.session();
    let target = committed_doc(&mut session, 1, "a");
    let comment = session
        .create(
            &"Comment".into(),
            Some(ObjectId(10)),
            attrs([("text", AttrValue::from("nice")), ("doc", AttrValue::Ref(ObjectId(1)))]),
        )
        .unwrap();
    session.commit().unwrap();
    let rows_before = kb.history(&target.identity()).unwrap().len();

    session.delete(&target).unwrap();
    match session.commit() {
        Err(KbError::DeleteVeto {
            target: vetoed,
            referrer,
            attribute,
        }) => {
            assert_eq!(vetoed, target.identity());
            assert_eq!(referrer, comment.identity());
            assert_eq!(attribute, "doc");
        }
        other => panic!("expected a delete veto, got {other:?}"),
    }
    assert_eq!(kb.history(&target.identity()).unwrap().len(), rows_before);

    // the transaction is still open; removing the referrer unblocks it
    session.delete(&comment).unwrap();
    assert!(session.commit().unwrap().is_some());
    assert!(session.lookup(&doc(), ObjectId(1)).unwrap().is_none());
}

struct NonEmptyTitles;

impl CommitVeto for NonEmptyTitles {
    fn name(&self) -> &str {
        "non-empty-titles"
    }

    fn check(&self, pending: &ChangeEvent) -> std::result::Result<(), String> {
        let empty = pending
            .changes()
            .filter_map(|change| change.after.as_ref())
            .any(|after| after.get("title") == Some(&AttrValue::Text(String::new())));
        if empty {
            Err("title must not be empty".to_string())
        } else {
            Ok(())
        }
    }
}

#[test]
fn test_commit_veto_rejects_pending_revision() {
    let kb = test_kb();
    kb.add_commit_veto(Arc::new(NonEmptyTitles));
    let mut session = kb.session();
    let item = session
        .create(&doc(), Some(ObjectId(1)), attrs([("title", "")]))
        .unwrap();

    match session.commit() {
        Err(KbError::CommitVetoed { check, .. }) => assert_eq!(check, "non-empty-titles"),
        other => panic!("expected a veto, got {other:?}"),
    }

    session.set(&item, "title", "fixed").unwrap();
    assert!(session.commit().unwrap().is_some());
}

#[test]
fn test_constraints_checked_at_commit() {
    let kb = test_kb();
    let mut session = kb.session();
    let tag = session
        .create(&"Tag".into(), Some(ObjectId(1)), Attributes::new())
        .unwrap();
    assert!(matches!(
        session.commit(),
        Err(KbError::ConstraintViolation { .. })
    ));
    session.set(&tag, "label", "urgent").unwrap();
    session.commit().unwrap();

    let item = committed_doc(&mut session, 2, "a");
    session.set(&item, "author", AttrValue::Ref(ObjectId(999))).unwrap();
    match session.commit() {
        Err(KbError::ConstraintViolation { identity, .. }) => assert_eq!(identity, item.identity()),
        other => panic!("expected a missing reference target, got {other:?}"),
    }
}

#[test]
fn test_revision_gap_after_aborted_commit() {
    let db = MemoryDatabase::new();
    let kb = KnowledgeBase::open_shared(&db, test_schema(), KbConfig::default()).unwrap();
    let mut session = kb.session();
    committed_doc(&mut session, 1, "a");

    db.inject_fault(Fault {
        point: FaultPoint::Commit,
        kind: FaultKind::Constraint,
        times: 1,
    });
    let lost = session
        .create(&doc(), Some(ObjectId(2)), attrs([("title", "lost")]))
        .unwrap();
    assert!(matches!(
        session.commit(),
        Err(KbError::Storage(StorageError::Constraint(_)))
    ));
    assert!(!lost.is_valid(), "a failed commit discards the transaction");

    session
        .create(&doc(), Some(ObjectId(2)), attrs([("title", "kept")]))
        .unwrap();
    assert_eq!(session.commit().unwrap(), Some(Revision(3)));

    let revisions: Vec<Revision> = kb
        .revisions()
        .unwrap()
        .into_iter()
        .map(|record| record.revision)
        .collect();
    assert_eq!(revisions, vec![Revision(0), Revision(1), Revision(3)]);

    let observer = KnowledgeBase::open_shared(&db, test_schema(), KbConfig::default()).unwrap();
    assert_eq!(observer.last_local_revision(), Revision(3));
}

#[test]
fn test_transient_failures_are_retried() {
    let db = MemoryDatabase::new();
    let writer = KnowledgeBase::open_shared(&db, test_schema(), KbConfig::default()).unwrap();
    let pool = Arc::new(MemoryPool::new(
        Arc::clone(&db),
        PoolConfig {
            retry_backoff_ms: 0,
            ..PoolConfig::default()
        },
    ));
    let reader = KnowledgeBase::builder(test_schema(), pool.clone()).open().unwrap();

    let mut session = writer.session();
    committed_doc(&mut session, 1, "a");

    db.inject_fault(Fault {
        point: FaultPoint::Read,
        kind: FaultKind::Transient,
        times: 1,
    });
    let mut remote = reader.session();
    remote.advance().unwrap();
    let item = remote.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    assert_eq!(remote.get(&item, "title").unwrap(), text("a"));
    assert_eq!(pool.stats().invalidated, 1);

    db.inject_fault(Fault {
        point: FaultPoint::Sequence,
        kind: FaultKind::Transient,
        times: 1,
    });
    remote.set(&item, "title", "b").unwrap();
    assert_eq!(remote.commit().unwrap(), Some(Revision(2)));
    assert_eq!(pool.stats().invalidated, 2);
}

#[test]
fn test_refetch_timeout_leaves_transaction_intact() {
    let config = KbConfig {
        refetch_timeout_ms: 50,
        ..KbConfig::default()
    };
    let kb = KnowledgeBase::open_shared(&MemoryDatabase::new(), test_schema(), config).unwrap();
    let mut session = kb.session();
    session
        .create(&doc(), Some(ObjectId(1)), attrs([("title", "a")]))
        .unwrap();

    let guard = kb
        .refetch_lock
        .acquire(Holder::Refetch, Duration::from_secs(1))
        .unwrap();
    assert!(matches!(
        session.commit(),
        Err(KbError::RefetchTimeout { .. })
    ));
    assert_eq!(session.context().map(TransactionContext::state), Some(ContextState::Open));
    drop(guard);

    assert_eq!(session.commit().unwrap(), Some(Revision(1)));
}

#[test]
fn test_listeners_run_by_tier_in_revision_order() {
    let kb = test_kb();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for (priority, name) in [
        (ListenerPriority::Normal, "n1"),
        (ListenerPriority::High, "h1"),
        (ListenerPriority::Normal, "n2"),
    ] {
        let seen = Arc::clone(&seen);
        kb.add_listener(
            priority,
            Arc::new(move |event: &ChangeEvent| {
                seen.lock().push(format!("{name}@{}", event.revision.0));
            }),
        );
    }

    let mut session = kb.session();
    let item = committed_doc(&mut session, 1, "a");
    session.set(&item, "title", "b").unwrap();
    session.commit().unwrap();

    assert_eq!(
        *seen.lock(),
        vec!["h1@1", "n1@1", "n2@1", "h1@2", "n1@2", "n2@2"]
    );
}

/// Reads through the committing session and tries to write through it.
struct WritingListener {
    outcome: Mutex<Vec<String>>,
}

impl ChangeListener for WritingListener {
    fn on_change(&self, event: &ChangeEvent, session: Option<&mut Session>) {
        let Some(session) = session else {
            self.outcome.lock().push(format!("remote@{}", event.revision.0));
            return;
        };
        let Ok(Some(item)) = session.lookup(&doc(), ObjectId(1)) else {
            self.outcome.lock().push("lookup failed".to_string());
            return;
        };
        let title = session.get(&item, "title").ok();
        let write = session.set(&item, "title", "from-listener");
        let mut outcome = self.outcome.lock();
        outcome.push(format!("read {title:?}"));
        outcome.push(format!(
            "write rejected: {}",
            matches!(write, Err(KbError::IllegalState(_)))
        ));
    }
}

#[test]
fn test_listener_writes_through_committing_session_fail() {
    let kb = test_kb();
    let listener = Arc::new(WritingListener {
        outcome: Mutex::new(Vec::new()),
    });
    kb.add_listener(ListenerPriority::Normal, listener.clone());

    let mut session = kb.session();
    let item = committed_doc(&mut session, 1, "a");

    assert_eq!(
        *listener.outcome.lock(),
        vec![
            format!("read {:?}", Some(text("a"))),
            "write rejected: true".to_string()
        ]
    );
    assert_eq!(session.get(&item, "title").unwrap(), text("a"));
}

#[test]
fn test_refetch_across_knowledge_bases() {
    let db = MemoryDatabase::new();
    let kb1 = KnowledgeBase::open_shared(&db, test_schema(), KbConfig::default()).unwrap();
    let kb2 = KnowledgeBase::open_shared(&db, test_schema(), KbConfig::default()).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        kb2.add_listener(
            ListenerPriority::Normal,
            Arc::new(move |event: &ChangeEvent| {
                events.lock().push((event.revision, event.is_local()));
            }),
        );
    }

    let mut s1 = kb1.session();
    let local = committed_doc(&mut s1, 1, "a");

    let mut s2 = kb2.session();
    assert!(s2.lookup(&doc(), ObjectId(1)).unwrap().is_none());
    assert_eq!(s2.advance().unwrap(), 0, "nothing to merge without a transaction");
    let remote = s2.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    assert_eq!(s2.get(&remote, "title").unwrap(), text("a"));

    s1.set(&local, "title", "b").unwrap();
    s1.commit().unwrap();
    assert_eq!(s2.get(&remote, "title").unwrap(), text("a"), "pinned to r1");

    s2.set(&remote, "status", "draft").unwrap();
    assert_eq!(s2.commit().unwrap(), Some(Revision(3)));
    assert_eq!(s2.get(&remote, "title").unwrap(), text("b"));
    assert_eq!(
        *events.lock(),
        vec![
            (Revision(1), false),
            (Revision(2), false),
            (Revision(3), true)
        ]
    );

    s1.advance().unwrap();
    assert_eq!(s1.get(&local, "status").unwrap(), text("draft"));

    s1.set(&local, "title", "c").unwrap();
    s2.set(&remote, "title", "d").unwrap();
    s1.commit().unwrap();
    let err = s2.commit().unwrap_err();
    assert!(err.conflicts().unwrap().has(ConflictKind::ConcurrentChange));
}

#[test]
fn test_superseded_values_pruned_once_unobservable() {
    let kb = test_kb();
    let mut writer = kb.session();
    let item = committed_doc(&mut writer, 1, "a");

    let mut reader = kb.session();
    let seen = reader.lookup(&doc(), ObjectId(1)).unwrap().unwrap();

    writer.set(&item, "title", "b").unwrap();
    writer.commit().unwrap();
    assert_eq!(item.loaded_values().len(), 2);
    assert_eq!(reader.get(&seen, "title").unwrap(), text("a"), "repeatable read");

    reader.advance().unwrap();
    assert_eq!(item.loaded_values().len(), 1, "r1 values pruned with the last pin");
    assert_eq!(reader.get(&seen, "title").unwrap(), text("b"));

    // still readable, just reloaded from the backend
    assert_eq!(reader.get_at(&seen, "title", Revision(1)).unwrap(), text("a"));
}

#[test]
fn test_search_overlays_local_changes() {
    let kb = test_kb();
    let mut setup = kb.session();
    for (id, status) in [(1, "draft"), (2, "draft"), (3, "final")] {
        setup
            .create(&doc(), Some(ObjectId(id)), attrs([("title", "t"), ("status", status)]))
            .unwrap();
    }
    setup.commit().unwrap();

    let mut session = kb.session();
    let first = session.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    let third = session.lookup(&doc(), ObjectId(3)).unwrap().unwrap();
    session.delete(&first).unwrap();
    session.set(&third, "status", "draft").unwrap();
    session
        .create(&doc(), Some(ObjectId(4)), attrs([("title", "t"), ("status", "draft")]))
        .unwrap();

    let drafts = Expr::eq("status", "draft");
    let ids: Vec<u64> = session
        .search(&doc(), &drafts)
        .unwrap()
        .iter()
        .map(|item| item.id().0)
        .collect();
    assert_eq!(ids, vec![2, 3, 4]);

    let mut other = kb.session();
    let ids: Vec<u64> = other
        .search(&doc(), &drafts)
        .unwrap()
        .iter()
        .map(|item| item.id().0)
        .collect();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn test_flexible_attributes_live_outside_the_row() {
    let db = MemoryDatabase::new();
    let flex = Arc::new(MemoryFlexStore::new());
    let open = || {
        let pool = Arc::new(MemoryPool::new(Arc::clone(&db), PoolConfig::default()));
        KnowledgeBase::builder(test_schema(), pool)
            .flex_store(flex.clone())
            .open()
            .unwrap()
    };
    let kb = open();
    let mut session = kb.session();
    let note = session
        .create(
            &"Note".into(),
            Some(ObjectId(1)),
            attrs([("title", "n"), ("color", "red")]),
        )
        .unwrap();
    session.commit().unwrap();
    assert_eq!(session.get(&note, "color").unwrap(), text("red"));

    let stored = kb.history(&note.identity()).unwrap();
    assert!(stored[0].attributes.contains_key("title"));
    assert!(!stored[0].attributes.contains_key("color"));

    let other = open();
    let mut remote = other.session();
    let found = remote
        .search(&"Note".into(), &Expr::eq("color", "red"))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(remote.get(&found[0], "color").unwrap(), text("red"));
}

/// Flexible attribute store whose reads can be switched off.
struct UnreliableFlexStore {
    inner: Arc<MemoryFlexStore>,
    failing: AtomicBool,
}

impl FlexAttributeStore for UnreliableFlexStore {
    fn load(&self, identity: &Identity, revision: Revision) -> StorageResult<Attributes> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Transient("flex store unavailable".into()));
        }
        self.inner.load(identity, revision)
    }

    fn store(
        &self,
        identity: &Identity,
        revision: Revision,
        attributes: &Attributes,
    ) -> StorageResult<()> {
        self.inner.store(identity, revision, attributes)
    }

    fn delete(&self, identity: &Identity, revision: Revision) -> StorageResult<()> {
        self.inner.delete(identity, revision)
    }

    fn discard(&self, revision: Revision) -> StorageResult<()> {
        self.inner.discard(revision)
    }
}

#[test]
fn test_failed_refetch_applies_no_revision() {
    let db = MemoryDatabase::new();
    let flex = Arc::new(MemoryFlexStore::new());
    let unreliable = Arc::new(UnreliableFlexStore {
        inner: Arc::clone(&flex),
        failing: AtomicBool::new(false),
    });
    let open = |store: Arc<dyn FlexAttributeStore>| {
        let pool = Arc::new(MemoryPool::new(Arc::clone(&db), PoolConfig::default()));
        KnowledgeBase::builder(test_schema(), pool)
            .flex_store(store)
            .open()
            .unwrap()
    };
    let writer = open(flex.clone());
    let reader = open(unreliable.clone());
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = Arc::clone(&events);
        reader.add_listener(
            ListenerPriority::Normal,
            Arc::new(move |event: &ChangeEvent| events.lock().push(event.revision)),
        );
    }

    let mut session = writer.session();
    committed_doc(&mut session, 1, "a");
    session
        .create(
            &"Note".into(),
            Some(ObjectId(1)),
            attrs([("title", "n"), ("color", "red")]),
        )
        .unwrap();
    assert_eq!(session.commit().unwrap(), Some(Revision(2)));

    unreliable.failing.store(true, Ordering::SeqCst);
    assert!(reader.refetch().is_err());
    assert!(events.lock().is_empty());
    assert_eq!(reader.last_local_revision(), Revision(0));

    unreliable.failing.store(false, Ordering::SeqCst);
    assert_eq!(reader.refetch().unwrap(), 2);
    assert_eq!(*events.lock(), vec![Revision(1), Revision(2)]);

    let mut local = reader.session();
    let started = std::time::Instant::now();
    committed_doc(&mut local, 2, "b");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        *events.lock(),
        vec![Revision(1), Revision(2), Revision(3)]
    );
}

#[test]
fn test_listeners_wait_for_earlier_revisions() {
    let config = KbConfig {
        refetch_timeout_ms: 20,
        ..KbConfig::default()
    };
    let kb = KnowledgeBase::open_shared(&MemoryDatabase::new(), test_schema(), config).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    {
        let seen = Arc::clone(&seen);
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        kb.add_listener(
            ListenerPriority::Normal,
            Arc::new(move |event: &ChangeEvent| {
                seen.lock().push(event.revision);
                if event.revision == Revision(1) {
                    entered_tx.lock().send(()).unwrap();
                    release_rx.lock().recv().unwrap();
                }
            }),
        );
    }

    let first = {
        let kb = Arc::clone(&kb);
        std::thread::spawn(move || {
            let mut session = kb.session();
            committed_doc(&mut session, 1, "a");
        })
    };
    entered_rx.recv().unwrap();

    let second = {
        let kb = Arc::clone(&kb);
        std::thread::spawn(move || {
            let mut session = kb.session();
            committed_doc(&mut session, 2, "b");
        })
    };
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*seen.lock(), vec![Revision(1)]);

    release_tx.send(()).unwrap();
    first.join().unwrap();
    second.join().unwrap();
    assert_eq!(*seen.lock(), vec![Revision(1), Revision(2)]);
}

#[test]
fn test_failed_rollback_discards_the_write_connection() {
    let db = MemoryDatabase::new();
    let pool = Arc::new(MemoryPool::new(Arc::clone(&db), PoolConfig::default()));
    let kb = KnowledgeBase::builder(test_schema(), pool.clone()).open().unwrap();
    let mut session = kb.session();
    committed_doc(&mut session, 1, "a");
    let invalidated = pool.stats().invalidated;

    for point in [FaultPoint::Commit, FaultPoint::Rollback] {
        db.inject_fault(Fault {
            point,
            kind: FaultKind::Constraint,
            times: 1,
        });
    }
    session
        .create(&doc(), Some(ObjectId(2)), attrs([("title", "lost")]))
        .unwrap();
    assert!(session.commit().is_err());
    assert_eq!(pool.stats().invalidated, invalidated + 1);

    session
        .create(&doc(), Some(ObjectId(2)), attrs([("title", "kept")]))
        .unwrap();
    assert_eq!(session.commit().unwrap(), Some(Revision(3)));
}

#[test]
fn test_deleting_an_edited_item_keeps_the_local_copy() {
    let kb = test_kb();
    let deletions = Arc::new(Mutex::new(Vec::new()));
    {
        let deletions = Arc::clone(&deletions);
        kb.add_listener(
            ListenerPriority::Normal,
            Arc::new(move |event: &ChangeEvent| {
                if event.revision == Revision(2) {
                    assert!(event.updated.is_empty());
                    deletions.lock().extend(event.deleted.iter().cloned());
                }
            }),
        );
    }
    let mut session = kb.session();
    let item = committed_doc(&mut session, 1, "a");
    let identity = item.identity();

    session.set(&item, "title", "edited").unwrap();
    assert!(session.delete(&item).unwrap());
    let context = session.context().unwrap();
    assert!(context.is_removed(&identity));
    assert!(!context.is_changed(&identity));
    assert_eq!(
        context.local_values(&identity).and_then(|values| values.get("title")),
        Some(&text("edited"))
    );

    assert_eq!(session.commit().unwrap(), Some(Revision(2)));
    let deletions = deletions.lock();
    assert_eq!(deletions.len(), 1);
    let before = deletions[0].before.as_ref().unwrap();
    assert_eq!(before.get("title"), Some(&text("a")));
}

#[test]
fn test_branch_isolation() {
    let db = MemoryDatabase::new();
    let kb = KnowledgeBase::open_shared(&db, test_schema(), KbConfig::default()).unwrap();
    let mut trunk = kb.session();
    trunk
        .create(&"User".into(), Some(ObjectId(1)), attrs([("name", "ann")]))
        .unwrap();
    trunk
        .create(
            &doc(),
            Some(ObjectId(1)),
            attrs([("title", AttrValue::from("a")), ("author", AttrValue::Ref(ObjectId(1)))]),
        )
        .unwrap();
    trunk.commit().unwrap();

    let branch = kb
        .create_branch(BranchId::TRUNK, None, &[doc()], "feature")
        .unwrap();
    assert_eq!(branch.base_revision(), Revision(1));
    assert!(branch.is_branched(&doc()));
    assert!(!branch.is_branched(&"User".into()));
    assert_eq!(kb.branches().len(), 2);
    assert_eq!(
        db.branch_switches()
            .iter()
            .filter(|row| row.branch == branch.id())
            .count(),
        test_schema().type_names().count()
    );

    let mut feature = kb.session_on(branch.id()).unwrap();
    let branched_doc = feature.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    assert_eq!(branched_doc.identity().branch, branch.id());
    feature.set(&branched_doc, "title", "feature-title").unwrap();
    feature.commit().unwrap();

    trunk.advance().unwrap();
    let trunk_doc = trunk.lookup(&doc(), ObjectId(1)).unwrap().unwrap();
    assert_eq!(trunk.get(&trunk_doc, "title").unwrap(), text("a"));
    assert_eq!(feature.get(&branched_doc, "title").unwrap(), text("feature-title"));

    let shared_user = feature.lookup(&"User".into(), ObjectId(1)).unwrap().unwrap();
    let trunk_user = trunk.lookup(&"User".into(), ObjectId(1)).unwrap().unwrap();
    assert!(Arc::ptr_eq(&shared_user, &trunk_user), "unbranched types are shared");
    assert_eq!(feature.get(&shared_user, "name").unwrap(), text("ann"));

    let before_fork = feature
        .lookup_at(&doc(), ObjectId(1), Revision(1))
        .unwrap()
        .unwrap();
    assert_eq!(before_fork.identity().branch, BranchId::TRUNK);
    assert_eq!(feature.get(&before_fork, "title").unwrap(), text("a"));
}

#[test]
fn test_branch_crossing_rejected() {
    let kb = test_kb();
    let mut session = kb.session();
    committed_doc(&mut session, 1, "a");
    session
        .create(
            &"Comment".into(),
            Some(ObjectId(2)),
            attrs([("doc", AttrValue::Ref(ObjectId(1)))]),
        )
        .unwrap();
    session.commit().unwrap();

    match kb.create_branch(BranchId::TRUNK, None, &[doc()], "fork docs only") {
        Err(KbError::BranchCrossing {
            source_type,
            attribute,
            target_type,
        }) => {
            assert_eq!(source_type, TypeName::new("Comment"));
            assert_eq!(attribute, "doc");
            assert_eq!(target_type, doc());
        }
        other => panic!("expected a branch crossing, got {other:?}"),
    }
    assert_eq!(kb.branches().len(), 1);

    let branch = kb
        .create_branch(BranchId::TRUNK, None, &[doc(), "Comment".into()], "fork both")
        .unwrap();
    assert!(branch.is_branched(&"Comment".into()));
}

#[test]
fn test_branch_at_future_revision_is_rejected() {
    let kb = test_kb();
    assert!(matches!(
        kb.create_branch(BranchId::TRUNK, Some(Revision(50)), &[doc()], "too early"),
        Err(KbError::IllegalArgument(_))
    ));
}
