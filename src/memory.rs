use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use log::trace;

use crate::conn::{Connection, Database, ExecFlags, Rows};
use crate::error::{Error, Result};
use crate::expr::{
    compare_values, Aggregate, Operand, Predicate, Projection, Select, Statement,
};
use crate::value::Value;

/// In-memory reference backend. Tables are schemaless bags of rows with
/// an internal rowid, an optional auto-assigned integer key column, and
/// per-column insert defaults; commit and rollback work on a whole-state
/// snapshot. Intended for tests and as the bundled concrete backend.
#[derive(Default)]
pub struct MemoryDatabase {
    shared: Rc<RefCell<Shared>>,
}

#[derive(Debug, Clone, Default)]
struct Shared {
    committed: HashMap<String, Table>,
    working: HashMap<String, Table>,
}

#[derive(Debug, Clone, Default)]
struct Table {
    auto_key: Option<String>,
    defaults: HashMap<String, Value>,
    next_rowid: i64,
    rows: Vec<Row>,
}

#[derive(Debug, Clone)]
struct Row {
    rowid: i64,
    cells: HashMap<String, Value>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        MemoryDatabase::default()
    }

    /// Register a table. `auto_key` names an integer column that is
    /// assigned from the rowid counter when an INSERT leaves it out,
    /// mimicking a server-generated primary key.
    pub fn create_table(&self, name: &str, auto_key: Option<&str>) {
        let mut shared = self.shared.borrow_mut();
        let table = Table {
            auto_key: auto_key.map(str::to_string),
            next_rowid: 1,
            ..Table::default()
        };
        shared.committed.insert(name.to_string(), table.clone());
        shared.working.insert(name.to_string(), table);
    }

    /// Declare a server-side default applied when an INSERT leaves the
    /// column out.
    pub fn set_default(&self, table: &str, column: &str, value: Value) {
        let mut shared = self.shared.borrow_mut();
        if let Some(t) = shared.committed.get_mut(table) {
            t.defaults.insert(column.to_string(), value.clone());
        }
        if let Some(t) = shared.working.get_mut(table) {
            t.defaults.insert(column.to_string(), value);
        }
    }
}

impl Database for MemoryDatabase {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection {
            shared: Rc::clone(&self.shared),
            closed: false,
        }))
    }
}

struct MemoryConnection {
    shared: Rc<RefCell<Shared>>,
    closed: bool,
}

struct MemoryRows {
    rows: VecDeque<Vec<Value>>,
    last_insert_id: Option<i64>,
}

impl Rows for MemoryRows {
    fn fetch_one(&mut self) -> Result<Option<Vec<Value>>> {
        Ok(self.rows.pop_front())
    }

    fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }
}

/// Predicate evaluation with backend-only shapes resolved.
fn eval_on_row(pred: &Predicate, row: &Row) -> Result<bool> {
    match pred {
        Predicate::RowId(id) => Ok(row.rowid == *id),
        Predicate::And(a, b) => Ok(eval_on_row(a, row)? && eval_on_row(b, row)?),
        Predicate::Or(a, b) => Ok(eval_on_row(a, row)? || eval_on_row(b, row)?),
        Predicate::Not(p) => Ok(!eval_on_row(p, row)?),
        other => other.eval(&|name| row.cells.get(name).cloned()),
    }
}

impl MemoryConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn select(table: &Table, select: &Select) -> Result<VecDeque<Vec<Value>>> {
        let mut matched: Vec<&Row> = Vec::new();
        for row in &table.rows {
            if eval_on_row(&select.predicate, row)? {
                matched.push(row);
            }
        }

        for order in select.order_by.iter().rev() {
            matched.sort_by(|a, b| {
                let av = a.cells.get(order.column);
                let bv = b.cells.get(order.column);
                let ord = match (av, bv) {
                    (Some(a), Some(b)) => {
                        compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    // NULL and undefined sort first.
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                match order.direction {
                    crate::expr::Direction::Asc => ord,
                    crate::expr::Direction::Desc => ord.reverse(),
                }
            });
        }

        if let Some(limit) = select.limit {
            matched.truncate(limit);
        }

        match &select.projection {
            Projection::Columns(names) => Ok(matched
                .iter()
                .map(|row| {
                    names
                        .iter()
                        .map(|name| row.cells.get(*name).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect()),
            Projection::Aggregate(agg) => {
                let scalar = aggregate(&matched, *agg);
                Ok(VecDeque::from([vec![scalar]]))
            }
        }
    }
}

fn aggregate(rows: &[&Row], agg: Aggregate) -> Value {
    let column_values = |name: &str| -> Vec<Value> {
        rows.iter()
            .filter_map(|row| row.cells.get(name))
            .filter(|v| !v.is_null())
            .cloned()
            .collect()
    };
    match agg {
        Aggregate::Count => Value::Int(rows.len() as i64),
        Aggregate::Min(name) => column_values(name)
            .into_iter()
            .reduce(|a, b| {
                if compare_values(&b, &a) == Some(std::cmp::Ordering::Less) {
                    b
                } else {
                    a
                }
            })
            .unwrap_or(Value::Null),
        Aggregate::Max(name) => column_values(name)
            .into_iter()
            .reduce(|a, b| {
                if compare_values(&b, &a) == Some(std::cmp::Ordering::Greater) {
                    b
                } else {
                    a
                }
            })
            .unwrap_or(Value::Null),
        Aggregate::Sum(name) => {
            let values = column_values(name);
            if values.is_empty() {
                return Value::Null;
            }
            if values.iter().all(|v| matches!(v, Value::Int(_))) {
                Value::Int(
                    values
                        .iter()
                        .map(|v| match v {
                            Value::Int(i) => *i,
                            _ => 0,
                        })
                        .sum(),
                )
            } else {
                Value::Float(values.iter().map(as_f64).sum())
            }
        }
        Aggregate::Avg(name) => {
            let values = column_values(name);
            if values.is_empty() {
                return Value::Null;
            }
            Value::Float(values.iter().map(as_f64).sum::<f64>() / values.len() as f64)
        }
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => 0.0,
    }
}

impl Connection for MemoryConnection {
    fn execute(
        &mut self,
        statement: &Statement,
        _params: &[Value],
        _flags: ExecFlags,
    ) -> Result<Box<dyn Rows>> {
        self.check_open()?;
        let mut shared = self.shared.borrow_mut();
        let mut last_insert_id = None;
        let rows = match statement {
            Statement::Select(select) => {
                let table = shared
                    .working
                    .get(select.table)
                    .ok_or_else(|| Error::NoSuchTable(select.table.to_string()))?;
                MemoryConnection::select(table, select)?
            }
            Statement::Insert(insert) => {
                let table = shared
                    .working
                    .get_mut(insert.table)
                    .ok_or_else(|| Error::NoSuchTable(insert.table.to_string()))?;
                let mut cells: HashMap<String, Value> = HashMap::new();
                for (name, value) in insert.columns.iter().zip(&insert.values) {
                    cells.insert(name.to_string(), value.clone());
                }
                for (name, value) in &table.defaults {
                    cells
                        .entry(name.clone())
                        .or_insert_with(|| value.clone());
                }
                let rowid = table.next_rowid;
                table.next_rowid += 1;
                if let Some(key) = &table.auto_key {
                    cells.entry(key.clone()).or_insert(Value::Int(rowid));
                }
                trace!("memory insert into {} rowid {rowid}", insert.table);
                table.rows.push(Row { rowid, cells });
                last_insert_id = Some(rowid);
                VecDeque::new()
            }
            Statement::Update(update) => {
                let table = shared
                    .working
                    .get_mut(update.table)
                    .ok_or_else(|| Error::NoSuchTable(update.table.to_string()))?;
                for i in 0..table.rows.len() {
                    if eval_on_row(&update.predicate, &table.rows[i])? {
                        for (name, operand) in &update.sets {
                            let value = match operand {
                                Operand::Value(v) => v.clone(),
                                Operand::Column(source) => table.rows[i]
                                    .cells
                                    .get(*source)
                                    .cloned()
                                    .unwrap_or(Value::Null),
                            };
                            table.rows[i].cells.insert(name.to_string(), value);
                        }
                    }
                }
                VecDeque::new()
            }
            Statement::Delete(delete) => {
                let table = shared
                    .working
                    .get_mut(delete.table)
                    .ok_or_else(|| Error::NoSuchTable(delete.table.to_string()))?;
                let mut kept = Vec::with_capacity(table.rows.len());
                for row in table.rows.drain(..) {
                    if !eval_on_row(&delete.predicate, &row)? {
                        kept.push(row);
                    }
                }
                table.rows = kept;
                VecDeque::new()
            }
            Statement::Text(_) => {
                return Err(Error::Backend(
                    "memory backend only accepts statement trees".into(),
                ))
            }
        };
        Ok(Box::new(MemoryRows {
            rows,
            last_insert_id,
        }))
    }

    fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        let mut shared = self.shared.borrow_mut();
        shared.committed = shared.working.clone();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        let mut shared = self.shared.borrow_mut();
        shared.working = shared.committed.clone();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
