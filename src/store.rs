use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use log::{debug, trace};

use crate::conn::{Connection, Database, ExecFlags, Rows};
use crate::error::{Error, Result};
use crate::expr::{Delete, Insert, Operand, Predicate, Projection, Select, Statement, Update};
use crate::meta::{describe, Entity, EntitySpec, Event, Handle, Object};
use crate::result_set::ResultSet;
use crate::tracker::{DirtySet, FlushOrder, GhostSet, ObjId, Pending};
use crate::value::{ToValue, Value};

/// Identity-cache key: one live object per (type, primary-key tuple)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey(TypeId, Vec<Value>);

/// Bookkeeping shared between the store and the change-notification
/// path of every owned object.
#[derive(Default)]
pub(crate) struct StoreInner {
    cache: HashMap<CacheKey, Weak<Object>>,
    dirty: DirtySet,
    ghosts: GhostSet,
    order: FlushOrder,
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("StoreInner")
            .field("cached", &self.cache.len())
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

impl StoreInner {
    /// Changed-hook entry point: called on every effective field write
    /// of an owned, notification-enabled object.
    pub(crate) fn object_changed(&mut self, obj: &Rc<Object>, dirty: bool) {
        if dirty {
            self.dirty.insert(obj.id(), Rc::clone(obj));
        } else {
            self.dirty.remove(obj.id());
        }
    }
}

/// The unit of work: owns one connection, an identity cache of weak
/// references, and the dirty/ghost/order bookkeeping. Single-threaded;
/// one flush, one transaction, one connection at a time.
pub struct Store {
    conn: Box<dyn Connection>,
    inner: Rc<RefCell<StoreInner>>,
}

/// Conversions into a primary-key tuple for `Store::get`
pub trait IntoKey {
    fn into_key(self) -> Vec<Value>;
}

impl IntoKey for Vec<Value> {
    fn into_key(self) -> Vec<Value> {
        self
    }
}

impl IntoKey for &[Value] {
    fn into_key(self) -> Vec<Value> {
        self.to_vec()
    }
}

impl IntoKey for Value {
    fn into_key(self) -> Vec<Value> {
        vec![self]
    }
}

impl IntoKey for i64 {
    fn into_key(self) -> Vec<Value> {
        vec![self.to_value()]
    }
}

impl IntoKey for &str {
    fn into_key(self) -> Vec<Value> {
        vec![self.to_value()]
    }
}

impl IntoKey for String {
    fn into_key(self) -> Vec<Value> {
        vec![self.to_value()]
    }
}

impl<A: ToValue, B: ToValue> IntoKey for (A, B) {
    fn into_key(self) -> Vec<Value> {
        vec![self.0.to_value(), self.1.to_value()]
    }
}

impl Store {
    pub fn new(database: &dyn Database) -> Result<Store> {
        Ok(Store::with_connection(database.connect()?))
    }

    /// Build a store over an already-open connection, e.g. one wrapped
    /// in `BusyRetry`.
    pub fn with_connection(conn: Box<dyn Connection>) -> Store {
        Store {
            conn,
            inner: Rc::new(RefCell::new(StoreInner::default())),
        }
    }

    fn inner_weak(&self) -> Weak<RefCell<StoreInner>> {
        Rc::downgrade(&self.inner)
    }

    fn owns(&self, obj: &Object) -> bool {
        obj.store_ptr() == Some(Rc::as_ptr(&self.inner))
    }

    /// Execute an arbitrary statement, flushing pending changes first so
    /// the database sees a consistent state.
    pub fn execute(
        &mut self,
        statement: &Statement,
        params: &[Value],
        flags: ExecFlags,
    ) -> Result<Box<dyn Rows>> {
        self.flush()?;
        self.conn.execute(statement, params, flags)
    }

    pub(crate) fn conn_execute(
        &mut self,
        statement: &Statement,
        flags: ExecFlags,
    ) -> Result<Box<dyn Rows>> {
        trace!("execute {statement:?}");
        self.conn.execute(statement, &[], flags)
    }

    /// Schedule an object for insertion.
    pub fn add<T: Entity>(&mut self, handle: &Handle<T>) -> Result<()> {
        let obj = handle.obj();
        if obj.store_ptr().is_some() && !self.owns(obj) {
            return Err(Error::ForeignStore);
        }
        match obj.pending() {
            Pending::Add => Err(Error::AlreadyAdded),
            Pending::Remove => {
                // remove-then-add before a flush cancels the removal
                obj.set_pending(Pending::None);
                Ok(())
            }
            Pending::None => {
                let id = obj.id();
                let mut inner = self.inner.borrow_mut();
                if obj.store_ptr().is_none() {
                    obj.save();
                    obj.set_store(Rc::downgrade(&self.inner));
                } else if inner.ghosts.contains(id) {
                    // Re-adding a flushed removal resurrects the object.
                    inner.ghosts.remove(id);
                } else {
                    return Err(Error::AlreadyInStore);
                }
                obj.set_pending(Pending::Add);
                inner.dirty.insert(id, Rc::clone(obj));
                Ok(())
            }
        }
    }

    /// Schedule an object for deletion.
    pub fn remove<T: Entity>(&mut self, handle: &Handle<T>) -> Result<()> {
        let obj = handle.obj();
        if !self.owns(obj) {
            return Err(Error::NotInStore);
        }
        match obj.pending() {
            Pending::Remove => Err(Error::AlreadyRemoved),
            Pending::Add => {
                // add-then-remove before a flush annihilates both
                obj.set_pending(Pending::None);
                let id = obj.id();
                let mut inner = self.inner.borrow_mut();
                inner.ghosts.insert(id, Rc::clone(obj));
                inner.dirty.remove(id);
                Ok(())
            }
            Pending::None => {
                obj.set_pending(Pending::Remove);
                self.inner
                    .borrow_mut()
                    .dirty
                    .insert(obj.id(), Rc::clone(obj));
                Ok(())
            }
        }
    }

    /// Fetch one object by primary key, preferring the identity cache.
    pub fn get<T: Entity, K: IntoKey>(&mut self, key: K) -> Result<Option<Handle<T>>> {
        self.flush()?;
        let spec = describe::<T>()?;
        let key = key.into_key();
        if key.len() != spec.primary_key_pos.len() {
            return Err(Error::Configuration(format!(
                "key width {} does not match primary key width {}",
                key.len(),
                spec.primary_key_pos.len()
            )));
        }

        let cache_key = CacheKey(spec.type_id(), key.clone());
        let cached = self.inner.borrow().cache.get(&cache_key).cloned();
        if let Some(obj) = cached.and_then(|weak| weak.upgrade()) {
            return Ok(Some(Handle::from_object(obj)));
        }

        let statement = Statement::Select(Select {
            table: spec.table,
            projection: Projection::Columns(spec.column_names()),
            predicate: spec.key_predicate(&key)?,
            order_by: vec![],
            limit: Some(1),
        });
        let mut rows = self.conn_execute(&statement, ExecFlags::empty())?;
        match rows.fetch_one()? {
            Some(row) => Ok(Some(Handle::from_object(self.load_object(spec, row)?))),
            None => Ok(None),
        }
    }

    /// Query objects matching a predicate.
    pub fn find<T: Entity>(&mut self, predicate: Predicate) -> Result<ResultSet<'_, T>> {
        self.flush()?;
        let spec = describe::<T>()?;
        Ok(ResultSet::new(self, spec, predicate))
    }

    /// Refresh an object's fields from its database row, discarding
    /// unflushed changes to it.
    pub fn reload<T: Entity>(&mut self, handle: &Handle<T>) -> Result<()> {
        let obj = handle.obj();
        if !self.owns(obj) {
            return Err(Error::NotInStore);
        }
        let obj = Rc::clone(obj);
        self.reload_object(&obj)
    }

    pub(crate) fn reload_object(&mut self, obj: &Rc<Object>) -> Result<()> {
        let key = obj.primary_values().ok_or(Error::NeverFlushed)?;
        let spec = obj.spec();
        let statement = Statement::Select(Select {
            table: spec.table,
            projection: Projection::Columns(spec.column_names()),
            predicate: spec.key_predicate(&key)?,
            order_by: vec![],
            limit: Some(1),
        });
        let mut rows = self.conn_execute(&statement, ExecFlags::empty())?;
        let row = rows
            .fetch_one()?
            .ok_or_else(|| Error::Backend("reloaded row no longer exists".into()))?;
        let all: Vec<usize> = (0..spec.columns.len()).collect();
        set_values(obj, &all, row)?;
        obj.checkpoint();
        self.inner.borrow_mut().dirty.remove(obj.id());
        Ok(())
    }

    /// Require `before` to flush strictly earlier than `after` in the
    /// same flush pass. Constraints are reference-counted and advisory
    /// for one pass only.
    pub fn add_flush_order<A: Entity, B: Entity>(
        &mut self,
        before: &Handle<A>,
        after: &Handle<B>,
    ) {
        self.inner
            .borrow_mut()
            .order
            .add(before.obj().id(), after.obj().id());
    }

    pub fn remove_flush_order<A: Entity, B: Entity>(
        &mut self,
        before: &Handle<A>,
        after: &Handle<B>,
    ) {
        self.inner
            .borrow_mut()
            .order
            .remove(before.obj().id(), after.obj().id());
    }

    /// Apply every pending mutation to the database, respecting flush
    /// order constraints. Fails with `Error::OrderingCycle` when the
    /// constraints among still-dirty objects form a loop.
    pub fn flush(&mut self) -> Result<()> {
        let predecessors = self.inner.borrow().order.predecessors();
        if !self.inner.borrow().dirty.is_empty() {
            debug!("flushing {} dirty objects", self.inner.borrow().dirty.len());
        }
        loop {
            let inner = self.inner.borrow();
            if inner.dirty.is_empty() {
                break;
            }
            let next = inner
                .dirty
                .iter()
                .find(|(id, _)| {
                    predecessors.get(id).map_or(true, |befores| {
                        !befores.iter().any(|b| inner.dirty.contains(*b))
                    })
                })
                .map(|(_, obj)| Rc::clone(obj));
            drop(inner);
            match next {
                Some(obj) => self.flush_one(&obj)?,
                None => return Err(Error::OrderingCycle),
            }
        }
        self.inner.borrow_mut().order.clear();
        Ok(())
    }

    /// Flush a single object. The object leaves the dirty set before
    /// its statement runs, so re-entrant dirtying during the flush is
    /// observed by the next pass rather than this one.
    fn flush_one(&mut self, obj: &Rc<Object>) -> Result<()> {
        if self.inner.borrow_mut().dirty.remove(obj.id()).is_none() {
            return Ok(());
        }
        let spec = obj.spec();
        let pending = obj.pending();
        obj.set_pending(Pending::None);

        match pending {
            Pending::Remove => {
                if let Some(key) = obj.primary_values() {
                    let statement = Statement::Delete(Delete {
                        table: spec.table,
                        predicate: spec.key_predicate(&key)?,
                    });
                    self.conn_execute(&statement, ExecFlags::NO_RESULT)?;
                }
                obj.set_notify(false);
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.ghosts.insert(obj.id(), Rc::clone(obj));
                }
                self.remove_from_cache(obj);
            }
            Pending::Add => {
                let mut columns = Vec::new();
                let mut values = Vec::new();
                for (index, value) in obj.defined_values() {
                    let column = &spec.columns[index];
                    columns.push(column.name);
                    values.push(column.kind.to_database(value)?);
                }
                let statement = Statement::Insert(Insert {
                    table: spec.table,
                    columns,
                    values,
                });
                let rows = self.conn_execute(&statement, ExecFlags::empty())?;
                self.fill_missing_values(obj, rows)?;
                obj.set_notify(true);
                self.inner.borrow_mut().ghosts.remove(obj.id());
                self.add_to_cache(obj)?;
                obj.checkpoint();
            }
            Pending::None => {
                if obj.check_changed() {
                    let mut sets = Vec::new();
                    for (index, value) in obj.changes() {
                        let column = &spec.columns[index];
                        sets.push((
                            column.name,
                            Operand::Value(column.kind.to_database(value)?),
                        ));
                    }
                    if !sets.is_empty() {
                        let key = obj
                            .primary_values()
                            .ok_or(Error::NeverFlushed)?;
                        let statement = Statement::Update(Update {
                            table: spec.table,
                            sets,
                            predicate: spec.key_predicate(&key)?,
                        });
                        self.conn_execute(&statement, ExecFlags::NO_RESULT)?;
                        self.add_to_cache(obj)?;
                    }
                    obj.checkpoint();
                }
            }
        }

        obj.emit(Event::Flushed);
        Ok(())
    }

    /// After an INSERT, pull server-generated and defaulted column
    /// values the object did not supply locally.
    fn fill_missing_values(&mut self, obj: &Rc<Object>, rows: Box<dyn Rows>) -> Result<()> {
        let spec = obj.spec();
        let missing: Vec<usize> = (0..spec.columns.len())
            .filter(|&i| !obj.has_value(i))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let key_defined = spec.primary_key_pos.iter().all(|&pos| obj.has_value(pos));
        let predicate = if key_defined {
            let key = obj
                .current_key()
                .ok_or_else(|| Error::Backend("primary key value missing".into()))?;
            spec.key_predicate(&key)?
        } else {
            let id = rows
                .last_insert_id()
                .ok_or_else(|| Error::Backend("no insert identity available".into()))?;
            Predicate::RowId(id)
        };

        let statement = Statement::Select(Select {
            table: spec.table,
            projection: Projection::Columns(
                missing.iter().map(|&i| spec.columns[i].name).collect(),
            ),
            predicate,
            order_by: vec![],
            limit: Some(1),
        });
        let mut result = self.conn_execute(&statement, ExecFlags::empty())?;
        let row = result
            .fetch_one()?
            .ok_or_else(|| Error::Backend("inserted row not found".into()))?;
        set_values(obj, &missing, row)
    }

    /// Materialize one database row into an object, reusing the cached
    /// instance when the primary key already has a live entry.
    pub(crate) fn load_object(
        &mut self,
        spec: &'static EntitySpec,
        row: Vec<Value>,
    ) -> Result<Rc<Object>> {
        let mut converted = Vec::with_capacity(row.len());
        for (column, value) in spec.columns.iter().zip(row) {
            converted.push(column.kind.from_database(value)?);
        }
        let key: Vec<Value> = spec
            .primary_key_pos
            .iter()
            .map(|&pos| converted[pos].clone())
            .collect();

        let cache_key = CacheKey(spec.type_id(), key);
        let cached = self.inner.borrow().cache.get(&cache_key).cloned();
        if let Some(obj) = cached.and_then(|weak| weak.upgrade()) {
            return Ok(obj);
        }

        let obj = Object::new(spec);
        obj.set_store(self.inner_weak());
        for (index, value) in converted.into_iter().enumerate() {
            obj.set_value_raw(index, value);
        }
        obj.save();
        self.add_to_cache(&obj)?;
        obj.set_notify(true);
        Ok(obj)
    }

    /// Flush, commit the connection, and re-baseline every surviving
    /// object; ghosts are released from the store for good.
    pub fn commit(&mut self) -> Result<()> {
        self.flush()?;
        self.conn.commit()?;
        debug!("committed");
        let (ghosts, cached) = {
            let inner = self.inner.borrow();
            (inner.ghosts.objects(), cached_objects(&inner))
        };
        for obj in ghosts {
            obj.clear_store();
        }
        for obj in cached {
            obj.save();
        }
        self.inner.borrow_mut().ghosts.clear();
        Ok(())
    }

    /// Roll the connection back and restore every dirty, ghost, and
    /// cached object to its saved snapshot, reattaching cache and
    /// notification state for objects still owned by this store.
    pub fn rollback(&mut self) -> Result<()> {
        let affected: Vec<Rc<Object>> = {
            let inner = self.inner.borrow();
            let mut by_id: HashMap<ObjId, Rc<Object>> = HashMap::new();
            for (id, obj) in inner.dirty.iter() {
                by_id.insert(id, Rc::clone(obj));
            }
            for obj in inner.ghosts.objects() {
                by_id.insert(obj.id(), obj);
            }
            for obj in cached_objects(&inner) {
                by_id.insert(obj.id(), obj);
            }
            by_id.into_values().collect()
        };
        debug!("rolling back {} objects", affected.len());

        for obj in &affected {
            self.remove_from_cache(obj);
            obj.restore();
            if self.owns(obj) {
                self.add_to_cache(obj)?;
                obj.set_notify(true);
            }
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.ghosts.clear();
            inner.dirty.clear();
        }
        self.conn.rollback()
    }

    /// Close the underlying connection.
    pub fn close(&mut self) -> Result<()> {
        self.conn.close()
    }

    /// Whether the object has unflushed changes in this store.
    pub fn is_dirty<T: Entity>(&self, handle: &Handle<T>) -> bool {
        self.inner.borrow().dirty.contains(handle.obj().id())
    }

    /// Live cached objects of one mapped type.
    pub(crate) fn cached_of(&self, spec: &'static EntitySpec) -> Vec<Rc<Object>> {
        cached_objects(&self.inner.borrow())
            .into_iter()
            .filter(|obj| obj.spec().type_id() == spec.type_id())
            .collect()
    }

    /// Install or move the object's cache entry under its current
    /// primary-key tuple. The rekey is atomic: the old entry is removed
    /// and the new one installed in one step, so a lookup never sees
    /// both or neither.
    fn add_to_cache(&mut self, obj: &Rc<Object>) -> Result<()> {
        let spec = obj.spec();
        let new_key = obj
            .current_key()
            .ok_or_else(|| Error::Backend("primary key value missing".into()))?;
        let old_key = obj.primary_values();
        if old_key.as_ref() == Some(&new_key) {
            return Ok(());
        }
        let mut inner = self.inner.borrow_mut();
        if let Some(old) = old_key {
            trace!("rekey {}: {old:?} -> {new_key:?}", spec.table);
            inner.cache.remove(&CacheKey(spec.type_id(), old));
        }
        inner
            .cache
            .insert(CacheKey(spec.type_id(), new_key.clone()), Rc::downgrade(obj));
        obj.set_primary_values(Some(new_key));
        Ok(())
    }

    fn remove_from_cache(&mut self, obj: &Rc<Object>) {
        if let Some(key) = obj.primary_values() {
            self.inner
                .borrow_mut()
                .cache
                .remove(&CacheKey(obj.spec().type_id(), key));
            obj.set_primary_values(None);
        }
    }
}

/// Upgrade every live cache entry. Entries whose object has been
/// collected are skipped; losing one this way is a normal, silent event.
fn cached_objects(inner: &StoreInner) -> Vec<Rc<Object>> {
    inner
        .cache
        .values()
        .filter_map(Weak::upgrade)
        .collect()
}

/// Convert database-native row values into the given columns of an
/// object, without firing change notification.
pub(crate) fn set_values(obj: &Rc<Object>, columns: &[usize], row: Vec<Value>) -> Result<()> {
    let spec = obj.spec();
    for (&index, value) in columns.iter().zip(row) {
        let converted = spec.columns[index].kind.from_database(value)?;
        obj.set_value_raw(index, converted);
    }
    Ok(())
}
