//! Save coordination: rejected and lost batches, split saves, save-time checks

mod common;

use arbor_session::{
    ErrorKind, ItemStatus, Permission, SessionConfig, SessionError, StaticConstraints,
    ValueConflict,
};
use arbor_spi::{FailureKind, Instruction, ItemId, PropertyType, RemoteStore, Value};
use common::{child_names, open, open_with, states, store};

#[test]
fn test_rejected_batch_restores_snapshot_and_keeps_log() -> anyhow::Result<()> {
    let store = store();
    let mut session = open(&store);
    let root = session.root().clone();
    let a = session.create_node(&root, "a", None)?.id().clone();
    session.create_property(&a, "p", Value::from("x"))?;

    let before = states(&session);
    let pending = session.change_log().len();

    store.fail_next_batch(FailureKind::LockConflict, "locked by bob")?;
    let err = session.save().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BatchFailure);
    assert_eq!(err.reported_kind(), Some(FailureKind::LockConflict));
    assert!(matches!(err, SessionError::BatchRejected { index: 0, .. }));

    assert_eq!(states(&session), before);
    assert_eq!(session.change_log().len(), pending);
    assert!(!session.is_saving());
    assert!(store.history()?.is_empty());

    // Nothing was lost; the next attempt goes through
    let report = session.save()?;
    assert_eq!(report.submitted, 2);
    assert_eq!(store.history()?.len(), 1);
    Ok(())
}

#[test]
fn test_store_side_rejection_is_reported_with_index() -> anyhow::Result<()> {
    let store = store();
    let root = ItemId::new("root");
    let doomed = store.add_node(&root, "doomed", "nt:unstructured")?;

    let mut session = open(&store);
    let a = session.create_node(&root, "a", None)?.id().clone();
    session.node(&doomed)?;
    session.move_node(&a, &doomed, "a")?;
    let before = states(&session);

    // The destination vanishes after the refresh pass but before submission
    let batch = session.begin_save()?;
    store.remove(&doomed)?;

    let result = store.submit_batch(&batch);
    let err = session.complete_save(result).unwrap_err();
    match err {
        SessionError::BatchRejected { index, kind, .. } => {
            assert_eq!(index, 1);
            assert_eq!(kind, FailureKind::NotFound);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(states(&session), before);
    assert_eq!(session.change_log().len(), 2);
    Ok(())
}

#[test]
fn test_lost_batch_is_an_unknown_outcome() -> anyhow::Result<()> {
    let store = store();
    let mut session = open(&store);
    let root = session.root().clone();
    session.create_node(&root, "a", None)?;
    let before = states(&session);

    store.lose_next_batch()?;
    let err = session.save().unwrap_err();
    assert!(matches!(err, SessionError::BatchOutcomeUnknown(_)));
    assert_eq!(err.kind(), ErrorKind::BatchFailure);
    assert_eq!(states(&session), before);
    assert!(session.has_pending_changes());
    Ok(())
}

#[test]
fn test_split_save() -> anyhow::Result<()> {
    let store = store();
    let mut session = open(&store);
    let root = session.root().clone();
    let a = session.create_node(&root, "a", None)?.id().clone();

    let batch = session.begin_save()?;
    assert_eq!(batch.len(), 1);
    assert!(matches!(&batch.instructions[0], Instruction::AddNode { id, .. } if id == &a));

    let err = session.set_mixins(&a, vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalStateTransition);
    assert_eq!(session.begin_save().unwrap_err(), SessionError::SaveInProgress);

    let result = store.submit_batch(&batch);
    let report = session.complete_save(result)?;
    assert_eq!(report.reassigned[&a], ItemId::new("item-1"));
    assert!(!session.is_saving());
    assert_eq!(
        session.node(&ItemId::new("item-1"))?.status(),
        ItemStatus::Existing
    );
    Ok(())
}

#[test]
fn test_save_after_removing_the_source_of_a_move() -> anyhow::Result<()> {
    let store = store();
    let mut session = open(&store);
    let root = session.root().clone();
    let a = session.create_node(&root, "a", None)?.id().clone();
    let c = session.create_node(&a, "c", None)?.id().clone();
    session.move_node(&c, &root, "c")?;
    session.remove(&a)?;

    let report = session.save()?;
    assert_eq!(report.reassigned[&c], ItemId::new("item-2"));
    assert!(!store.contains(&ItemId::new("item-1"))?);
    assert!(store.contains(&ItemId::new("item-2"))?);
    assert_eq!(child_names(&session, &root), vec!["c"]);
    assert!(!session.has_pending_changes());

    let mut other = open(&store);
    assert_eq!(other.child_node(&root, "c")?.id(), &ItemId::new("item-2"));
    assert_eq!(other.child_node(&root, "a").unwrap_err().kind(), ErrorKind::NotFound);
    Ok(())
}

#[test]
fn test_moved_child_keeps_new_property_after_parent_removal() -> anyhow::Result<()> {
    let store = store();
    let mut session = open(&store);
    let root = session.root().clone();
    let a = session.create_node(&root, "a", None)?.id().clone();
    let c = session.create_node(&a, "c", None)?.id().clone();
    session.create_property(&c, "title", Value::from("kept"))?;
    session.move_node(&c, &root, "c")?;
    session.remove(&a)?;

    let report = session.save()?;
    let c = report.reassigned[&c].clone();
    assert_eq!(session.node(&c)?.status(), ItemStatus::Existing);

    let mut other = open(&store);
    assert_eq!(other.child_node(&root, "c")?.id(), &c);
    assert_eq!(other.property_of(&c, "title")?.value(), Some(&Value::from("kept")));
    assert_eq!(other.child_node(&root, "a").unwrap_err().kind(), ErrorKind::NotFound);
    Ok(())
}

#[test]
fn test_cancelled_save_keeps_pending_work() -> anyhow::Result<()> {
    let store = store();
    let mut session = open(&store);
    let root = session.root().clone();
    session.create_node(&root, "a", None)?;
    let before = states(&session);

    session.begin_save()?;
    session.cancel_save()?;
    assert_eq!(states(&session), before);
    assert_eq!(session.change_log().len(), 1);
    assert!(store.history()?.is_empty());

    let err = session.cancel_save().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    Ok(())
}

#[test]
fn test_lock_version_and_access_checks() -> anyhow::Result<()> {
    let store = store();
    let constraints = StaticConstraints::new();
    let mut session = open(&store).with_constraints(constraints.clone());
    let root = session.root().clone();

    let a = session.create_node(&root, "a", None)?.id().clone();
    let a = session.save()?.reassigned[&a].clone();

    constraints.lock(&a, "bob")?;
    let err = session.create_node(&a, "x", None).unwrap_err();
    assert_eq!(err, SessionError::LockConflict(a.clone()));

    // Our own lock does not get in the way
    constraints.lock(&a, "alice")?;
    session.create_node(&a, "mine", None)?;
    session.discard()?;
    constraints.unlock(&a)?;

    constraints.check_in(&a)?;
    let err = session.create_property(&a, "p", Value::from(1_i64)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VersionConflict);
    constraints.check_out(&a)?;

    constraints.deny(&a, Permission::RemoveItem)?;
    let err = session.remove(&a).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);

    session.create_node(&a, "x", None)?;
    assert_eq!(session.change_log().len(), 1);
    Ok(())
}

#[test]
fn test_locks_are_checked_again_at_save() -> anyhow::Result<()> {
    let store = store();
    let constraints = StaticConstraints::new();
    let mut session = open(&store).with_constraints(constraints.clone());
    let root = session.root().clone();

    session.create_node(&root, "a", None)?;
    let before = states(&session);

    constraints.lock(&root, "bob")?;
    let err = session.save().unwrap_err();
    assert_eq!(err, SessionError::LockConflict(root.clone()));
    assert!(!session.is_saving());
    assert_eq!(states(&session), before);

    constraints.unlock(&root)?;
    session.save()?;
    assert!(!session.has_pending_changes());
    Ok(())
}

#[test]
fn test_last_writer_wins_by_default() -> anyhow::Result<()> {
    let store = store();
    let root = ItemId::new("root");
    let p = store.add_property(&root, "p", PropertyType::String, vec![Value::from("v0")])?;

    let mut session = open(&store);
    session.set_value(&p, Value::from("v1"))?;
    session.set_value(&p, Value::from("v2"))?;
    assert_eq!(session.change_log().len(), 1);

    let report = session.save()?;
    assert_eq!(report.submitted, 1);

    let mut other = open(&store);
    assert_eq!(other.property(&p)?.value(), Some(&Value::from("v2")));
    Ok(())
}

#[test]
fn test_conflicting_value_changes_can_be_rejected() -> anyhow::Result<()> {
    let store = store();
    let root = ItemId::new("root");
    let p = store.add_property(&root, "p", PropertyType::String, vec![Value::from("v0")])?;

    let config = SessionConfig::default().with_value_conflict(ValueConflict::Reject);
    let mut session = open_with(&store, config);
    session.set_value(&p, Value::from("v1"))?;
    let before = states(&session);

    let err = session.set_value(&p, Value::from("v2")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert_eq!(states(&session), before);
    assert_eq!(session.property(&p)?.value(), Some(&Value::from("v1")));

    // Changes to a property created in this session fold into its creation
    let q = session.create_property(&root, "q", Value::from("a"))?.id().clone();
    session.set_value(&q, Value::from("b"))?;
    session.set_value(&q, Value::from("c"))?;
    assert_eq!(session.change_log().len(), 2);
    Ok(())
}

#[test]
fn test_change_log_capacity() -> anyhow::Result<()> {
    let store = store();
    let config = SessionConfig::default().with_max_change_log_entries(2);
    let mut session = open_with(&store, config);
    let root = session.root().clone();

    session.create_node(&root, "a", None)?;
    session.create_node(&root, "b", None)?;
    let err = session.create_node(&root, "c", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

    session.save()?;
    session.create_node(&root, "c", None)?;
    Ok(())
}
