use std::marker::PhantomData;

use log::debug;

use crate::conn::{ExecFlags, Rows};
use crate::error::{Error, Result};
use crate::expr::{
    Aggregate, Assign, Delete, Operand, OrderBy, Predicate, Projection, Select, Statement, Update,
};
use crate::meta::{Column, Entity, EntitySpec, Handle};
use crate::store::Store;
use crate::value::{FromValue, Value};

/// A deferred query over one mapped type: a predicate plus ordering,
/// executed against the store's connection on demand. Obtained from
/// `Store::find`, which flushes first so queries see pending changes.
pub struct ResultSet<'a, T: Entity> {
    store: &'a mut Store,
    spec: &'static EntitySpec,
    predicate: Predicate,
    order_by: Vec<OrderBy>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Entity> ResultSet<'a, T> {
    pub(crate) fn new(
        store: &'a mut Store,
        spec: &'static EntitySpec,
        predicate: Predicate,
    ) -> Self {
        ResultSet {
            store,
            spec,
            predicate,
            order_by: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Replace the ordering of subsequent reads.
    pub fn order_by(mut self, order: Vec<OrderBy>) -> Self {
        self.order_by = order;
        self
    }

    fn select(&self, projection: Projection, limit: Option<usize>) -> Result<Statement> {
        Ok(Statement::Select(Select {
            table: self.spec.table,
            projection,
            predicate: self.spec.predicate_to_database(&self.predicate)?,
            order_by: self.order_by.clone(),
            limit,
        }))
    }

    /// Stream matching objects lazily.
    pub fn iter(&mut self) -> Result<ResultIter<'_, T>> {
        let statement = self.select(Projection::Columns(self.spec.column_names()), None)?;
        let rows = self.store.conn_execute(&statement, ExecFlags::empty())?;
        Ok(ResultIter {
            rows,
            store: &mut *self.store,
            spec: self.spec,
            _marker: PhantomData,
        })
    }

    /// Collect every matching object.
    pub fn all(&mut self) -> Result<Vec<Handle<T>>> {
        self.iter()?.collect()
    }

    /// The single match, or `None` when nothing matches.
    pub fn one(&mut self) -> Result<Option<Handle<T>>> {
        let statement = self.select(Projection::Columns(self.spec.column_names()), Some(1))?;
        let mut rows = self.store.conn_execute(&statement, ExecFlags::empty())?;
        match rows.fetch_one()? {
            Some(row) => Ok(Some(Handle::from_object(
                self.store.load_object(self.spec, row)?,
            ))),
            None => Ok(None),
        }
    }

    fn aggregate(&mut self, aggregate: Aggregate) -> Result<Value> {
        let statement = self.select(Projection::Aggregate(aggregate), None)?;
        let mut rows = self.store.conn_execute(&statement, ExecFlags::empty())?;
        let row = rows
            .fetch_one()?
            .ok_or_else(|| Error::Backend("aggregate produced no row".into()))?;
        row.into_iter()
            .next()
            .ok_or_else(|| Error::Backend("aggregate produced no value".into()))
    }

    pub fn count(&mut self) -> Result<i64> {
        match self.aggregate(Aggregate::Count)? {
            Value::Int(n) => Ok(n),
            other => Err(Error::TypeMismatch {
                expected: "int",
                found: other.type_name(),
            }),
        }
    }

    /// Extreme and sum aggregates come back in database-native form and
    /// are converted through the column's codec before the typed read.
    fn converted_aggregate<V: FromValue>(
        &mut self,
        aggregate: Aggregate,
        column: &Column<V>,
    ) -> Result<Option<V>> {
        let value = self.aggregate(aggregate)?;
        match column.kind.from_database(value)? {
            Value::Null => Ok(None),
            value => match V::from_value(&value) {
                Some(v) => Ok(Some(v)),
                None => Err(Error::TypeMismatch {
                    expected: column.kind.name(),
                    found: value.type_name(),
                }),
            },
        }
    }

    pub fn min<V: FromValue>(&mut self, column: &Column<V>) -> Result<Option<V>> {
        self.converted_aggregate(Aggregate::Min(column.name), column)
    }

    pub fn max<V: FromValue>(&mut self, column: &Column<V>) -> Result<Option<V>> {
        self.converted_aggregate(Aggregate::Max(column.name), column)
    }

    pub fn sum<V: FromValue>(&mut self, column: &Column<V>) -> Result<Option<V>> {
        self.converted_aggregate(Aggregate::Sum(column.name), column)
    }

    pub fn avg<V>(&mut self, column: &Column<V>) -> Result<Option<f64>> {
        match self.aggregate(Aggregate::Avg(column.name))? {
            Value::Null => Ok(None),
            Value::Float(f) => Ok(Some(f)),
            Value::Int(n) => Ok(Some(n as f64)),
            other => Err(Error::TypeMismatch {
                expected: "float",
                found: other.type_name(),
            }),
        }
    }

    /// Delete every matching row in one statement. Cached objects are
    /// not touched; they become stale the way any out-of-band write
    /// leaves them.
    pub fn remove(&mut self) -> Result<()> {
        let statement = Statement::Delete(Delete {
            table: self.spec.table,
            predicate: self.spec.predicate_to_database(&self.predicate)?,
        });
        self.store.conn_execute(&statement, ExecFlags::NO_RESULT)?;
        Ok(())
    }

    /// Update every matching row in one statement, then reconcile live
    /// cached instances: when the predicate can be evaluated in memory,
    /// matching instances are patched with the assigned values; when it
    /// cannot, every cached instance of the type is reloaded.
    pub fn set(&mut self, assigns: Vec<Assign>) -> Result<()> {
        if assigns.is_empty() {
            return Ok(());
        }

        let mut sets = Vec::with_capacity(assigns.len());
        let mut patches: Vec<(usize, Operand)> = Vec::with_capacity(assigns.len());
        for assign in &assigns {
            let index = self
                .spec
                .column_index(assign.column)
                .ok_or(Error::UnsupportedSetExpr)?;
            let kind = self.spec.columns[index].kind;
            let converted = match &assign.operand {
                Operand::Value(value) => Operand::Value(kind.to_database(value.clone())?),
                Operand::Column(source) => {
                    if self.spec.column_index(source).is_none() {
                        return Err(Error::UnsupportedSetExpr);
                    }
                    Operand::Column(*source)
                }
            };
            sets.push((assign.column, converted));
            patches.push((index, assign.operand.clone()));
        }

        let statement = Statement::Update(Update {
            table: self.spec.table,
            sets,
            predicate: self.spec.predicate_to_database(&self.predicate)?,
        });
        self.store.conn_execute(&statement, ExecFlags::NO_RESULT)?;

        if self.predicate.compilable() {
            for handle in self.cached()? {
                let obj = handle.obj();
                for (index, operand) in &patches {
                    let value = match operand {
                        Operand::Value(value) => value.clone(),
                        Operand::Column(source) => {
                            obj.get_named(source).unwrap_or(Value::Null)
                        }
                    };
                    obj.set_value(*index, value);
                }
            }
        } else {
            // The predicate only makes sense to the backend; resync
            // every live instance of the type instead.
            let cached = self.store.cached_of(self.spec);
            debug!(
                "bulk set predicate not evaluable in memory, reloading {} cached objects",
                cached.len()
            );
            for obj in cached {
                self.store.reload_object(&obj)?;
            }
        }
        Ok(())
    }

    /// Live cached instances matching the predicate, evaluated against
    /// in-memory values without touching the database.
    pub fn cached(&self) -> Result<Vec<Handle<T>>> {
        if !self.predicate.compilable() {
            return Err(Error::NotCompilable);
        }
        let mut matched = Vec::new();
        for obj in self.store.cached_of(self.spec) {
            let hit = {
                let fetch = |name: &str| obj.get_named(name);
                self.predicate.eval(&fetch)?
            };
            if hit {
                matched.push(Handle::from_object(obj));
            }
        }
        Ok(matched)
    }
}

/// Lazy, single-pass iteration over a query's matches. Each row is
/// resolved through the identity cache as it is fetched.
pub struct ResultIter<'a, T: Entity> {
    rows: Box<dyn Rows>,
    store: &'a mut Store,
    spec: &'static EntitySpec,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Iterator for ResultIter<'_, T> {
    type Item = Result<Handle<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rows.fetch_one() {
            Ok(Some(row)) => Some(
                self.store
                    .load_object(self.spec, row)
                    .map(Handle::from_object),
            ),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
