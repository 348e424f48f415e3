use loamdb::{
    Assign, Column, Decimal, Entity, EntityDef, Error, ExecFlags, Handle, Kind, MemoryDatabase,
    Operand, Predicate, Projection, Rows, Select, Statement, Store, Value,
};
use proptest::prelude::*;

struct Article;

impl Entity for Article {
    fn definition() -> EntityDef {
        EntityDef::new("article")
            .column("id", Kind::Int)
            .column("title", Kind::Text)
            .column("stock", Kind::Int)
            .column("sold", Kind::Int)
            .column("price", Kind::Decimal)
            .column("active", Kind::Bool)
            .primary_key("id")
    }
}

const TITLE: Column<String> = Column::new("title", Kind::Text);
const STOCK: Column<i64> = Column::new("stock", Kind::Int);
const SOLD: Column<i64> = Column::new("sold", Kind::Int);
const PRICE: Column<Decimal> = Column::new("price", Kind::Decimal);
const ACTIVE: Column<bool> = Column::new("active", Kind::Bool);

// Common test setup: three articles committed to the backend.
fn setup_store() -> (MemoryDatabase, Store) {
    let db = MemoryDatabase::new();
    db.create_table("article", Some("id"));
    let mut store = Store::new(&db).unwrap();
    for (title, stock, sold, price, active) in [
        ("widget", 10, 2, "9.99", true),
        ("gadget", 5, 7, "19.50", true),
        ("gizmo", 0, 1, "0.25", false),
    ] {
        let a = Handle::<Article>::new().unwrap();
        a.set(&TITLE, title.to_string()).unwrap();
        a.set(&STOCK, stock).unwrap();
        a.set(&SOLD, sold).unwrap();
        a.set(&PRICE, price.parse().unwrap()).unwrap();
        a.set(&ACTIVE, active).unwrap();
        store.add(&a).unwrap();
    }
    store.commit().unwrap();
    (db, store)
}

#[test]
fn test_find_all_and_count() {
    let (_db, mut store) = setup_store();
    let mut rs = store.find::<Article>(Predicate::True).unwrap();
    assert_eq!(rs.count().unwrap(), 3);
    assert_eq!(rs.all().unwrap().len(), 3);
}

#[test]
fn test_find_with_predicate() {
    let (_db, mut store) = setup_store();
    let mut rs = store.find::<Article>(STOCK.gt(0)).unwrap();
    let found = rs.all().unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|a| a.get(&STOCK).unwrap() > 0));
}

#[test]
fn test_find_with_bool_and_decimal_predicates() {
    let (_db, mut store) = setup_store();
    // Both kinds cross the codec boundary on the way to the backend.
    let mut rs = store.find::<Article>(ACTIVE.eq(false)).unwrap();
    let found = rs.all().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get(&TITLE), Some("gizmo".to_string()));

    let mut rs = store
        .find::<Article>(PRICE.eq("19.50".parse().unwrap()))
        .unwrap();
    assert_eq!(rs.count().unwrap(), 1);
}

#[test]
fn test_order_by() {
    let (_db, mut store) = setup_store();
    let mut rs = store
        .find::<Article>(Predicate::True)
        .unwrap()
        .order_by(vec![STOCK.desc()]);
    let stocks: Vec<i64> = rs
        .all()
        .unwrap()
        .iter()
        .map(|a| a.get(&STOCK).unwrap())
        .collect();
    assert_eq!(stocks, vec![10, 5, 0]);
}

#[test]
fn test_one() {
    let (_db, mut store) = setup_store();
    let mut rs = store
        .find::<Article>(TITLE.eq("gadget".to_string()))
        .unwrap();
    let a = rs.one().unwrap().unwrap();
    assert_eq!(a.get(&STOCK), Some(5));

    let mut rs = store
        .find::<Article>(TITLE.eq("missing".to_string()))
        .unwrap();
    assert!(rs.one().unwrap().is_none());
}

#[test]
fn test_find_shares_instances_with_get() {
    let (_db, mut store) = setup_store();
    let got = store.get::<Article, _>(1).unwrap().unwrap();
    let mut rs = store
        .find::<Article>(TITLE.eq("widget".to_string()))
        .unwrap();
    let found = rs.one().unwrap().unwrap();
    assert!(found.is_same(&got));
}

#[test]
fn test_find_sees_pending_changes() {
    let (_db, mut store) = setup_store();
    let a = store.get::<Article, _>(1).unwrap().unwrap();
    a.set(&STOCK, 1000).unwrap();

    // find flushes first, so the pending UPDATE is visible.
    let mut rs = store.find::<Article>(STOCK.eq(1000)).unwrap();
    assert_eq!(rs.count().unwrap(), 1);
}

#[test]
fn test_aggregates() {
    let (_db, mut store) = setup_store();
    let mut rs = store.find::<Article>(Predicate::True).unwrap();
    assert_eq!(rs.min(&STOCK).unwrap(), Some(0));
    assert_eq!(rs.max(&STOCK).unwrap(), Some(10));
    assert_eq!(rs.sum(&STOCK).unwrap(), Some(15));
    assert_eq!(rs.avg(&STOCK).unwrap(), Some(5.0));
}

#[test]
fn test_aggregates_on_empty_result() {
    let (_db, mut store) = setup_store();
    let mut rs = store.find::<Article>(STOCK.gt(1_000_000)).unwrap();
    assert_eq!(rs.count().unwrap(), 0);
    assert_eq!(rs.min(&STOCK).unwrap(), None);
    assert_eq!(rs.avg(&STOCK).unwrap(), None);
}

#[test]
fn test_bulk_remove() {
    let (_db, mut store) = setup_store();
    store.find::<Article>(ACTIVE.eq(true)).unwrap().remove().unwrap();
    let mut rs = store.find::<Article>(Predicate::True).unwrap();
    assert_eq!(rs.count().unwrap(), 1);
}

#[test]
fn test_bulk_set_patches_cached_instances() {
    let (_db, mut store) = setup_store();
    let cached = store.get::<Article, _>(1).unwrap().unwrap();

    store
        .find::<Article>(TITLE.eq("widget".to_string()))
        .unwrap()
        .set(vec![STOCK.to(99)])
        .unwrap();

    // The live instance was patched in memory, no reload needed.
    assert_eq!(cached.get(&STOCK), Some(99));
}

#[test]
fn test_bulk_set_column_to_column() {
    let (_db, mut store) = setup_store();
    let cached = store.get::<Article, _>(2).unwrap().unwrap();

    store
        .find::<Article>(TITLE.eq("gadget".to_string()))
        .unwrap()
        .set(vec![STOCK.to_column(&SOLD)])
        .unwrap();

    assert_eq!(cached.get(&STOCK), Some(7));
}

#[test]
fn test_bulk_set_reloads_when_not_evaluable() {
    let (_db, mut store) = setup_store();
    let cached = store.get::<Article, _>(1).unwrap().unwrap();

    // Row-identity predicates only make sense to the backend, so the
    // cached instances are resynchronized by reloading instead.
    store
        .find::<Article>(Predicate::RowId(1))
        .unwrap()
        .set(vec![STOCK.to(77)])
        .unwrap();

    assert_eq!(cached.get(&STOCK), Some(77));
}

#[test]
fn test_bulk_set_rejects_unknown_columns() {
    let (_db, mut store) = setup_store();
    let err = store
        .find::<Article>(Predicate::True)
        .unwrap()
        .set(vec![Assign {
            column: "nope",
            operand: Operand::Value(Value::Int(1)),
        }])
        .unwrap_err();
    assert_eq!(err, Error::UnsupportedSetExpr);
}

#[test]
fn test_cached_matches_in_memory() {
    let (_db, mut store) = setup_store();
    let a = store.get::<Article, _>(1).unwrap().unwrap();
    let _b = store.get::<Article, _>(3).unwrap().unwrap();

    let rs = store.find::<Article>(STOCK.gt(5)).unwrap();
    let cached = rs.cached().unwrap();
    assert_eq!(cached.len(), 1);
    assert!(cached[0].is_same(&a));
}

#[test]
fn test_cached_refuses_backend_only_predicates() {
    let (_db, mut store) = setup_store();
    let rs = store.find::<Article>(Predicate::RowId(1)).unwrap();
    assert_eq!(rs.cached().unwrap_err(), Error::NotCompilable);
}

#[test]
fn test_decimal_round_trips_through_the_store() {
    let (db, mut store) = setup_store();
    let a = store.get::<Article, _>(1).unwrap().unwrap();
    a.set(&PRICE, "12345678901234567.000001".parse().unwrap())
        .unwrap();
    store.commit().unwrap();

    // A fresh store reads back the exact same quantity.
    let mut fresh = Store::new(&db).unwrap();
    let again = fresh.get::<Article, _>(1).unwrap().unwrap();
    assert_eq!(
        again.get(&PRICE),
        Some("12345678901234567.000001".parse().unwrap())
    );
}

#[test]
fn test_bool_is_stored_as_integer() {
    let (_db, mut store) = setup_store();
    let statement = Statement::Select(Select {
        table: "article",
        projection: Projection::Columns(vec!["active"]),
        predicate: Predicate::RowId(1),
        order_by: vec![],
        limit: Some(1),
    });
    let mut rows = store.execute(&statement, &[], ExecFlags::empty()).unwrap();
    assert_eq!(rows.fetch_one().unwrap(), Some(vec![Value::Int(1)]));

    // The typed read converts it back.
    let a = store.get::<Article, _>(1).unwrap().unwrap();
    assert_eq!(a.get(&ACTIVE), Some(true));
}

proptest! {
    #[test]
    fn decimal_codec_round_trips(unscaled in any::<i64>(), scale in 0u32..18) {
        let d = Decimal::new(unscaled as i128, scale);
        let db = Kind::Decimal.to_database(Value::Decimal(d)).unwrap();
        prop_assert!(matches!(db, Value::Text(_)));
        let back = Kind::Decimal.from_database(db).unwrap();
        prop_assert_eq!(back, Value::Decimal(d));
    }
}
