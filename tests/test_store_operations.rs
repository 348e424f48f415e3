use loamdb::{
    Aggregate, Column, Entity, EntityDef, Error, Event, ExecFlags, Handle, Kind, MemoryDatabase,
    Predicate, Projection, Rows, Select, Statement, Store, Value,
};
use std::cell::Cell;
use std::rc::Rc;

struct Person;

impl Entity for Person {
    fn definition() -> EntityDef {
        EntityDef::new("person")
            .column("id", Kind::Int)
            .column("name", Kind::Text)
            .column("age", Kind::Int)
            .primary_key("id")
    }
}

const ID: Column<i64> = Column::new("id", Kind::Int);
const NAME: Column<String> = Column::new("name", Kind::Text);
const AGE: Column<i64> = Column::new("age", Kind::Int);

// Common test setup: one table with a server-generated integer key.
fn setup_store() -> (MemoryDatabase, Store) {
    let db = MemoryDatabase::new();
    db.create_table("person", Some("id"));
    let store = Store::new(&db).unwrap();
    (db, store)
}

fn new_person(name: &str, age: i64) -> Handle<Person> {
    let p = Handle::<Person>::new().unwrap();
    p.set(&NAME, name.to_string()).unwrap();
    p.set(&AGE, age).unwrap();
    p
}

#[test]
fn test_add_flush_assigns_generated_key() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    assert!(!p.is_defined(&ID));

    store.add(&p).unwrap();
    store.flush().unwrap();

    assert_eq!(p.get(&ID), Some(1));
}

#[test]
fn test_get_returns_the_cached_instance() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.flush().unwrap();

    let again = store.get::<Person, _>(1).unwrap().unwrap();
    assert!(again.is_same(&p));

    // Repeated lookups hit the cache, not the database.
    let third = store.get::<Person, _>(1).unwrap().unwrap();
    assert!(third.is_same(&p));
}

#[test]
fn test_get_missing_returns_none() {
    let (_db, mut store) = setup_store();
    assert!(store.get::<Person, _>(42).unwrap().is_none());
}

#[test]
fn test_get_rejects_wrong_key_width() {
    let (_db, mut store) = setup_store();
    let err = store
        .get::<Person, _>(vec![Value::Int(1), Value::Int(2)])
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn test_add_twice_is_rejected() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    assert_eq!(store.add(&p).unwrap_err(), Error::AlreadyAdded);
}

#[test]
fn test_foreign_store_is_rejected() {
    let (_db, mut store) = setup_store();
    let (_db2, mut other) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    assert_eq!(other.add(&p).unwrap_err(), Error::ForeignStore);
    assert_eq!(other.remove(&p).unwrap_err(), Error::NotInStore);
}

#[test]
fn test_add_then_remove_annihilates() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.remove(&p).unwrap();
    assert!(!store.is_dirty(&p));
    store.flush().unwrap();

    // Nothing ever reached the table.
    let mut rs = store.find::<Person>(Predicate::True).unwrap();
    assert_eq!(rs.count().unwrap(), 0);
}

#[test]
fn test_remove_then_add_cancels() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.flush().unwrap();

    store.remove(&p).unwrap();
    store.add(&p).unwrap();
    store.flush().unwrap();

    assert!(store.get::<Person, _>(1).unwrap().is_some());
}

#[test]
fn test_double_remove_is_rejected() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.flush().unwrap();
    store.remove(&p).unwrap();
    assert_eq!(store.remove(&p).unwrap_err(), Error::AlreadyRemoved);
}

#[test]
fn test_noop_writes_do_not_dirty() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.flush().unwrap();
    assert!(!store.is_dirty(&p));

    // Writing the value already held is a no-op.
    p.set(&NAME, "ada".to_string()).unwrap();
    assert!(!store.is_dirty(&p));

    // A change reverted before the flush leaves the object clean.
    p.set(&NAME, "grace".to_string()).unwrap();
    assert!(store.is_dirty(&p));
    p.set(&NAME, "ada".to_string()).unwrap();
    assert!(!store.is_dirty(&p));
}

#[test]
fn test_update_flushes_only_changes() {
    let (db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.flush().unwrap();

    p.set(&AGE, 37).unwrap();
    store.flush().unwrap();
    assert!(!store.is_dirty(&p));

    let fresh = Store::new(&db).unwrap().get::<Person, _>(1).unwrap();
    let fresh = fresh.unwrap();
    assert_eq!(fresh.get(&AGE), Some(37));
    assert_eq!(fresh.get(&NAME), Some("ada".to_string()));
}

#[test]
fn test_add_flush_remove_commit_lifecycle() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.flush().unwrap();
    assert_eq!(p.get(&ID), Some(1));

    let same = store.get::<Person, _>(1).unwrap().unwrap();
    assert!(same.is_same(&p));

    store.remove(&p).unwrap();
    store.commit().unwrap();
    assert!(store.get::<Person, _>(1).unwrap().is_none());
}

#[test]
fn test_removed_then_rolled_back_is_retrievable() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.commit().unwrap();

    store.remove(&p).unwrap();
    store.flush().unwrap();
    assert!(store.get::<Person, _>(1).unwrap().is_none());

    store.rollback().unwrap();
    let back = store.get::<Person, _>(1).unwrap().unwrap();
    assert!(back.is_same(&p));
    assert_eq!(back.get(&NAME), Some("ada".to_string()));
}

#[test]
fn test_rollback_discards_unflushed_changes() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.commit().unwrap();

    p.set(&AGE, 99).unwrap();
    store.rollback().unwrap();
    assert_eq!(p.get(&AGE), Some(36));
    assert!(!store.is_dirty(&p));
}

#[test]
fn test_rollback_of_flushed_insert_detaches() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.flush().unwrap();
    store.rollback().unwrap();

    assert!(store.get::<Person, _>(1).unwrap().is_none());
    // The instance reverted to a detached state and may be added again.
    store.add(&p).unwrap();
}

#[test]
fn test_commit_sets_a_new_rollback_baseline() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.commit().unwrap();

    p.set(&AGE, 37).unwrap();
    store.commit().unwrap();

    p.set(&AGE, 99).unwrap();
    store.rollback().unwrap();
    assert_eq!(p.get(&AGE), Some(37));
}

#[test]
fn test_ghost_resurrection() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.commit().unwrap();

    store.remove(&p).unwrap();
    store.flush().unwrap();

    // Re-adding a flushed removal reinserts the same instance.
    store.add(&p).unwrap();
    store.flush().unwrap();
    let back = store.get::<Person, _>(1).unwrap().unwrap();
    assert!(back.is_same(&p));
}

#[test]
fn test_flush_order_constraint_is_honored() {
    let (_db, mut store) = setup_store();
    let a = new_person("first-added", 1);
    let b = new_person("second-added", 2);
    store.add(&a).unwrap();
    store.add(&b).unwrap();

    // Force b's INSERT ahead of a's; generated keys expose the order.
    store.add_flush_order(&b, &a);
    store.flush().unwrap();
    assert_eq!(b.get(&ID), Some(1));
    assert_eq!(a.get(&ID), Some(2));
}

#[test]
fn test_flush_order_cycle_fails_flush() {
    let (_db, mut store) = setup_store();
    let a = new_person("a", 1);
    let b = new_person("b", 2);
    store.add(&a).unwrap();
    store.add(&b).unwrap();
    store.add_flush_order(&a, &b);
    store.add_flush_order(&b, &a);

    assert_eq!(store.flush().unwrap_err(), Error::OrderingCycle);
    // No insert went through.
    assert!(!a.is_defined(&ID));
    assert!(!b.is_defined(&ID));

    store.remove_flush_order(&b, &a);
    store.flush().unwrap();
    assert_eq!(a.get(&ID), Some(1));
}

#[test]
fn test_constraints_reset_after_flush() {
    let (_db, mut store) = setup_store();
    let a = new_person("a", 1);
    let b = new_person("b", 2);
    store.add(&a).unwrap();
    store.add(&b).unwrap();
    store.add_flush_order(&b, &a);
    store.flush().unwrap();

    // The old constraint must not block a later pass.
    a.set(&AGE, 10).unwrap();
    store.flush().unwrap();
    assert!(!store.is_dirty(&a));
}

#[test]
fn test_reload_discards_local_changes() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    store.flush().unwrap();

    p.set(&AGE, 99).unwrap();
    store.reload(&p).unwrap();
    assert_eq!(p.get(&AGE), Some(36));
    assert!(!store.is_dirty(&p));
}

#[test]
fn test_reload_requires_a_flushed_object() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();
    assert_eq!(store.reload(&p).unwrap_err(), Error::NeverFlushed);
}

#[test]
fn test_defaulted_columns_are_backfilled() {
    let (db, mut store) = setup_store();
    db.set_default("person", "age", Value::Int(30));

    let p = Handle::<Person>::new().unwrap();
    p.set(&NAME, "ada".to_string()).unwrap();
    store.add(&p).unwrap();
    store.flush().unwrap();

    // Both the generated key and the server default came back.
    assert_eq!(p.get(&ID), Some(1));
    assert_eq!(p.get(&AGE), Some(30));
}

#[test]
fn test_changed_and_flushed_hooks() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);

    let changed = Rc::new(Cell::new(0));
    let flushed = Rc::new(Cell::new(0));
    let c = Rc::clone(&changed);
    let f = Rc::clone(&flushed);
    p.on(Event::Changed, move |_| c.set(c.get() + 1));
    p.on(Event::Flushed, move |_| f.set(f.get() + 1));

    p.set(&AGE, 37).unwrap();
    p.set(&AGE, 37).unwrap(); // no-op, no event
    assert_eq!(changed.get(), 1);

    store.add(&p).unwrap();
    store.flush().unwrap();
    assert_eq!(flushed.get(), 1);
}

#[test]
fn test_execute_flushes_pending_changes_first() {
    let (_db, mut store) = setup_store();
    let p = new_person("ada", 36);
    store.add(&p).unwrap();

    let statement = Statement::Select(Select {
        table: "person",
        projection: Projection::Aggregate(Aggregate::Count),
        predicate: Predicate::True,
        order_by: vec![],
        limit: None,
    });
    let mut rows = store.execute(&statement, &[], ExecFlags::empty()).unwrap();
    assert_eq!(rows.fetch_one().unwrap(), Some(vec![Value::Int(1)]));
}
