use std::any::TypeId;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use once_cell::sync::Lazy;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::expr::{Assign, CmpOp, Direction, Operand, OrderBy, Predicate};
use crate::store::StoreInner;
use crate::tracker::{ObjId, Pending};
use crate::value::{FromValue, Kind, ToValue, Value};

/// Structural description of one mapped column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: Kind,
}

/// Raw per-type declaration, as written by the entity author
#[derive(Debug, Clone)]
pub struct EntityDef {
    table: &'static str,
    columns: Vec<ColumnDef>,
    primary_key: Vec<&'static str>,
}

impl EntityDef {
    pub fn new(table: &'static str) -> Self {
        EntityDef {
            table,
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    pub fn column(mut self, name: &'static str, kind: Kind) -> Self {
        self.columns.push(ColumnDef { name, kind });
        self
    }

    pub fn primary_key(mut self, name: &'static str) -> Self {
        self.primary_key.push(name);
        self
    }
}

/// A type with a declared table mapping
pub trait Entity: 'static {
    fn definition() -> EntityDef;
}

/// Validated structural description of a mapped type. Immutable once
/// built; interned per type on first use.
#[derive(Debug)]
pub struct EntitySpec {
    pub table: &'static str,
    pub columns: Vec<ColumnDef>,
    /// Positions of the primary-key columns, in key order
    pub primary_key_pos: Vec<usize>,
    type_id: TypeId,
}

impl EntitySpec {
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn primary_key_names(&self) -> Vec<&'static str> {
        self.primary_key_pos
            .iter()
            .map(|&i| self.columns[i].name)
            .collect()
    }

    /// Rewrite a predicate's bound values into database-native form.
    /// Statement trees handed to the connection always carry converted
    /// values; in-memory evaluation uses the unconverted original.
    pub(crate) fn predicate_to_database(&self, pred: &Predicate) -> Result<Predicate> {
        Ok(match pred {
            Predicate::Cmp {
                column,
                op,
                operand: Operand::Value(value),
            } => {
                let index = self
                    .column_index(column)
                    .ok_or_else(|| Error::NoSuchColumn(column.to_string()))?;
                Predicate::Cmp {
                    column: *column,
                    op: *op,
                    operand: Operand::Value(
                        self.columns[index].kind.to_database(value.clone())?,
                    ),
                }
            }
            Predicate::And(a, b) => Predicate::And(
                Box::new(self.predicate_to_database(a)?),
                Box::new(self.predicate_to_database(b)?),
            ),
            Predicate::Or(a, b) => Predicate::Or(
                Box::new(self.predicate_to_database(a)?),
                Box::new(self.predicate_to_database(b)?),
            ),
            Predicate::Not(p) => Predicate::Not(Box::new(self.predicate_to_database(p)?)),
            other => other.clone(),
        })
    }

    /// Primary-key lookup predicate in database-native form.
    pub(crate) fn key_predicate(&self, key: &[Value]) -> Result<Predicate> {
        let mut pred = Predicate::True;
        for (&pos, value) in self.primary_key_pos.iter().zip(key) {
            let column = &self.columns[pos];
            pred = pred.and(Predicate::Cmp {
                column: column.name,
                op: CmpOp::Eq,
                operand: Operand::Value(column.kind.to_database(value.clone())?),
            });
        }
        Ok(pred)
    }
}

static REGISTRY: Lazy<Mutex<HashMap<TypeId, &'static EntitySpec>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Look up (building and validating on first use) the descriptor for a
/// mapped type.
pub fn describe<T: Entity>() -> Result<&'static EntitySpec> {
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(spec) = registry.get(&TypeId::of::<T>()) {
        return Ok(spec);
    }

    let def = T::definition();
    if def.table.is_empty() {
        return Err(Error::Configuration("table name is empty".into()));
    }
    if def.columns.is_empty() {
        return Err(Error::Configuration("no columns declared".into()));
    }
    for (i, column) in def.columns.iter().enumerate() {
        if def.columns[..i].iter().any(|c| c.name == column.name) {
            return Err(Error::Configuration(format!(
                "duplicate column {:?}",
                column.name
            )));
        }
    }
    if def.primary_key.is_empty() {
        return Err(Error::Configuration(format!(
            "table {:?} declares no primary key",
            def.table
        )));
    }
    let mut primary_key_pos = Vec::with_capacity(def.primary_key.len());
    for name in &def.primary_key {
        match def.columns.iter().position(|c| c.name == *name) {
            Some(pos) => primary_key_pos.push(pos),
            None => {
                return Err(Error::Configuration(format!(
                    "primary key column {name:?} is not declared"
                )))
            }
        }
    }

    let spec: &'static EntitySpec = Box::leak(Box::new(EntitySpec {
        table: def.table,
        columns: def.columns,
        primary_key_pos,
        type_id: TypeId::of::<T>(),
    }));
    registry.insert(TypeId::of::<T>(), spec);
    Ok(spec)
}

/// Typed accessor for one mapped field. Entity authors declare these as
/// consts next to the `Entity` impl; every read and write of a mapped
/// field goes through one, which is how the engine observes mutation.
pub struct Column<V> {
    pub name: &'static str,
    pub kind: Kind,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Column<V> {
    pub const fn new(name: &'static str, kind: Kind) -> Self {
        Column {
            name,
            kind,
            _marker: PhantomData,
        }
    }

    fn cmp(&self, op: CmpOp, operand: Operand) -> Predicate {
        Predicate::Cmp {
            column: self.name,
            op,
            operand,
        }
    }

    pub fn is_null(&self) -> Predicate {
        Predicate::IsNull(self.name)
    }

    pub fn asc(&self) -> OrderBy {
        OrderBy {
            column: self.name,
            direction: Direction::Asc,
        }
    }

    pub fn desc(&self) -> OrderBy {
        OrderBy {
            column: self.name,
            direction: Direction::Desc,
        }
    }

    /// Assignment from another column of the same table, for bulk set()
    pub fn to_column(&self, other: &Column<V>) -> Assign {
        Assign {
            column: self.name,
            operand: Operand::Column(other.name),
        }
    }
}

#[allow(clippy::should_implement_trait)]
impl<V: ToValue> Column<V> {
    pub fn eq(&self, value: V) -> Predicate {
        self.cmp(CmpOp::Eq, Operand::Value(value.to_value()))
    }

    pub fn ne(&self, value: V) -> Predicate {
        self.cmp(CmpOp::Ne, Operand::Value(value.to_value()))
    }

    pub fn lt(&self, value: V) -> Predicate {
        self.cmp(CmpOp::Lt, Operand::Value(value.to_value()))
    }

    pub fn le(&self, value: V) -> Predicate {
        self.cmp(CmpOp::Le, Operand::Value(value.to_value()))
    }

    pub fn gt(&self, value: V) -> Predicate {
        self.cmp(CmpOp::Gt, Operand::Value(value.to_value()))
    }

    pub fn ge(&self, value: V) -> Predicate {
        self.cmp(CmpOp::Ge, Operand::Value(value.to_value()))
    }

    /// Assignment for bulk set()
    pub fn to(&self, value: V) -> Assign {
        Assign {
            column: self.name,
            operand: Operand::Value(value.to_value()),
        }
    }
}

fn kind_accepts(kind: Kind, value: &Value) -> bool {
    matches!(
        (kind, value),
        (_, Value::Null)
            | (Kind::Bool, Value::Bool(_))
            | (Kind::Int, Value::Int(_))
            | (Kind::Float, Value::Float(_))
            | (Kind::Float, Value::Int(_))
            | (Kind::Text, Value::Text(_))
            | (Kind::Bytes, Value::Bytes(_))
            | (Kind::Decimal, Value::Decimal(_))
    )
}

/// Saved snapshot used by rollback. The cached primary-key tuple is
/// deliberately not part of it: cache membership is store bookkeeping,
/// rebuilt by the store after a restore.
#[derive(Debug, Clone)]
struct Saved {
    values: BTreeMap<usize, Value>,
    pending: Pending,
    store: Option<Weak<RefCell<StoreInner>>>,
}

/// Mutable per-instance state: sparse current values (absence means
/// *undefined*, which is distinct from `Value::Null`), the checkpoint
/// used for dirty diffs, the rollback snapshot, lifecycle flags, and
/// the owning-store back-reference.
#[derive(Debug, Default)]
struct ObjState {
    values: BTreeMap<usize, Value>,
    checkpoint: BTreeMap<usize, Value>,
    saved: Option<Saved>,
    pending: Pending,
    primary_values: Option<Vec<Value>>,
    store: Option<Weak<RefCell<StoreInner>>>,
    notify: bool,
}

type HookFn = Rc<dyn Fn(&Object)>;

#[derive(Default)]
struct Hooks {
    changed: Vec<HookFn>,
    flushed: Vec<HookFn>,
}

/// Event hooks observable on a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Changed,
    Flushed,
}

/// The engine-facing side of one domain instance. Holds the descriptor,
/// the mutable state, and observer hooks. Application code sees this
/// only through `Handle<T>`.
pub struct Object {
    spec: &'static EntitySpec,
    state: RefCell<ObjState>,
    hooks: RefCell<Hooks>,
    self_ref: Weak<Object>,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("table", &self.spec.table)
            .field("id", &self.id())
            .finish()
    }
}

impl Object {
    pub(crate) fn new(spec: &'static EntitySpec) -> Rc<Object> {
        Rc::new_cyclic(|self_ref| Object {
            spec,
            state: RefCell::new(ObjState::default()),
            hooks: RefCell::new(Hooks::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn spec(&self) -> &'static EntitySpec {
        self.spec
    }

    pub(crate) fn id(&self) -> ObjId {
        ObjId::of(self)
    }

    /// Current value of a column, or `None` when undefined.
    pub(crate) fn get_value(&self, index: usize) -> Option<Value> {
        self.state.borrow().values.get(&index).cloned()
    }

    pub(crate) fn has_value(&self, index: usize) -> bool {
        self.state.borrow().values.contains_key(&index)
    }

    /// Column value by name, for in-memory predicate evaluation.
    pub(crate) fn get_named(&self, name: &str) -> Option<Value> {
        let index = self.spec.column_index(name)?;
        self.get_value(index)
    }

    /// Write through the accessor layer: records the value, recomputes
    /// dirtiness against the checkpoint (no-op writes do not dirty, and
    /// reverting the last diff marks the object clean again), and fires
    /// the changed hooks.
    pub(crate) fn set_value(&self, index: usize, value: Value) {
        let store = {
            let mut state = self.state.borrow_mut();
            if state.values.get(&index) == Some(&value) {
                return;
            }
            state.values.insert(index, value);
            if !state.notify {
                None
            } else {
                state.store.as_ref().and_then(Weak::upgrade).map(|store| {
                    let dirty = state.pending != Pending::None
                        || state.values != state.checkpoint;
                    (store, dirty)
                })
            }
        };
        if let (Some((store, dirty)), Some(rc)) = (store, self.self_ref.upgrade()) {
            store.borrow_mut().object_changed(&rc, dirty);
        }
        self.emit(Event::Changed);
    }

    /// Write without change notification, used when materializing rows.
    pub(crate) fn set_value_raw(&self, index: usize, value: Value) {
        self.state.borrow_mut().values.insert(index, value);
    }

    /// Columns with a defined value, with their current values.
    pub(crate) fn defined_values(&self) -> Vec<(usize, Value)> {
        self.state
            .borrow()
            .values
            .iter()
            .map(|(&i, v)| (i, v.clone()))
            .collect()
    }

    /// Whether any column differs from the checkpoint.
    pub(crate) fn check_changed(&self) -> bool {
        let state = self.state.borrow();
        state.values != state.checkpoint
    }

    /// Columns whose current value differs from the checkpoint.
    pub(crate) fn changes(&self) -> Vec<(usize, Value)> {
        let state = self.state.borrow();
        state
            .values
            .iter()
            .filter(|(i, v)| state.checkpoint.get(i) != Some(v))
            .map(|(&i, v)| (i, v.clone()))
            .collect()
    }

    /// Take a new checkpoint of the current values.
    pub(crate) fn checkpoint(&self) {
        let mut state = self.state.borrow_mut();
        state.checkpoint = state.values.clone();
    }

    /// Snapshot the full state for rollback, and checkpoint.
    pub(crate) fn save(&self) {
        let mut state = self.state.borrow_mut();
        state.checkpoint = state.values.clone();
        state.saved = Some(Saved {
            values: state.values.clone(),
            pending: state.pending,
            store: state.store.clone(),
        });
    }

    /// Restore the last saved snapshot. Objects never saved (touched only
    /// after the snapshot point) revert to empty, detached state.
    pub(crate) fn restore(&self) {
        let mut state = self.state.borrow_mut();
        match state.saved.clone() {
            Some(saved) => {
                state.values = saved.values;
                state.checkpoint = state.values.clone();
                state.pending = saved.pending;
                state.store = saved.store;
            }
            None => {
                state.values.clear();
                state.checkpoint.clear();
                state.pending = Pending::None;
                state.primary_values = None;
                state.store = None;
            }
        }
    }

    pub(crate) fn pending(&self) -> Pending {
        self.state.borrow().pending
    }

    pub(crate) fn set_pending(&self, pending: Pending) {
        self.state.borrow_mut().pending = pending;
    }

    /// Primary-key tuple under which this object is currently cached.
    pub(crate) fn primary_values(&self) -> Option<Vec<Value>> {
        self.state.borrow().primary_values.clone()
    }

    pub(crate) fn set_primary_values(&self, values: Option<Vec<Value>>) {
        self.state.borrow_mut().primary_values = values;
    }

    /// Current values of the primary-key columns, if all are defined.
    pub(crate) fn current_key(&self) -> Option<Vec<Value>> {
        let state = self.state.borrow();
        self.spec
            .primary_key_pos
            .iter()
            .map(|pos| state.values.get(pos).cloned())
            .collect()
    }

    pub(crate) fn store_ptr(&self) -> Option<*const RefCell<StoreInner>> {
        self.state.borrow().store.as_ref().map(Weak::as_ptr)
    }

    pub(crate) fn set_store(&self, store: Weak<RefCell<StoreInner>>) {
        self.state.borrow_mut().store = Some(store);
    }

    pub(crate) fn clear_store(&self) {
        self.state.borrow_mut().store = None;
    }

    pub(crate) fn set_notify(&self, enabled: bool) {
        self.state.borrow_mut().notify = enabled;
    }

    pub(crate) fn hook(&self, event: Event, f: HookFn) {
        let mut hooks = self.hooks.borrow_mut();
        match event {
            Event::Changed => hooks.changed.push(f),
            Event::Flushed => hooks.flushed.push(f),
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        // Clone the list out so a hook may register further hooks.
        let hooks: Vec<HookFn> = {
            let hooks = self.hooks.borrow();
            match event {
                Event::Changed => hooks.changed.clone(),
                Event::Flushed => hooks.flushed.clone(),
            }
        };
        for hook in hooks {
            hook(self);
        }
    }
}

/// Application-facing handle to one mapped instance. Cheap to clone;
/// clones refer to the same instance.
pub struct Handle<T: Entity> {
    obj: Rc<Object>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle {
            obj: Rc::clone(&self.obj),
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.obj.fmt(f)
    }
}

impl<T: Entity> Handle<T> {
    /// A fresh, detached instance with every column undefined.
    pub fn new() -> Result<Self> {
        let spec = describe::<T>()?;
        Ok(Handle {
            obj: Object::new(spec),
            _marker: PhantomData,
        })
    }

    pub(crate) fn from_object(obj: Rc<Object>) -> Self {
        debug_assert_eq!(obj.spec().type_id(), TypeId::of::<T>());
        Handle {
            obj,
            _marker: PhantomData,
        }
    }

    pub(crate) fn obj(&self) -> &Rc<Object> {
        &self.obj
    }

    /// Read a field. `None` when the column is undefined or NULL.
    pub fn get<V: FromValue>(&self, column: &Column<V>) -> Option<V> {
        let index = self.obj.spec().column_index(column.name);
        debug_assert!(
            index.is_some(),
            "unknown column {:?} on table {:?}",
            column.name,
            self.obj.spec().table
        );
        match index.and_then(|i| self.obj.get_value(i)) {
            Some(Value::Null) | None => None,
            Some(value) => V::from_value(&value),
        }
    }

    /// Read a field without collapsing NULL and undefined.
    pub fn raw(&self, name: &str) -> Option<Value> {
        self.obj.get_named(name)
    }

    pub fn is_defined<V>(&self, column: &Column<V>) -> bool {
        self.obj
            .spec()
            .column_index(column.name)
            .is_some_and(|i| self.obj.has_value(i))
    }

    /// Write a field through the accessor layer.
    pub fn set<V: ToValue>(&self, column: &Column<V>, value: V) -> Result<()> {
        let index = self
            .obj
            .spec()
            .column_index(column.name)
            .ok_or_else(|| Error::NoSuchColumn(column.name.to_string()))?;
        let value = value.to_value();
        let kind = self.obj.spec().columns[index].kind;
        if !kind_accepts(kind, &value) {
            return Err(Error::TypeMismatch {
                expected: kind.name(),
                found: value.type_name(),
            });
        }
        self.obj.set_value(index, value);
        Ok(())
    }

    /// Register an observer for a lifecycle event on this instance.
    pub fn on(&self, event: Event, f: impl Fn(&Object) + 'static) {
        self.obj.hook(event, Rc::new(f));
    }

    /// Whether two handles refer to the same instance.
    pub fn is_same(&self, other: &Handle<T>) -> bool {
        Rc::ptr_eq(&self.obj, &other.obj)
    }
}
