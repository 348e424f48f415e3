use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::value::Value;

/// Right-hand side of a comparison or an UPDATE assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    Column(&'static str),
}

/// Comparison operators supported by predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A boolean expression over the columns of one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row
    True,
    Cmp {
        column: &'static str,
        op: CmpOp,
        operand: Operand,
    },
    IsNull(&'static str),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    /// Addresses a row by the backend's internal row identity. Only the
    /// backend can resolve this; it has no in-memory meaning.
    RowId(i64),
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Predicate::True, p) | (p, Predicate::True) => p,
            (a, b) => Predicate::And(Box::new(a), Box::new(b)),
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }

    /// Whether every shape in this predicate can be evaluated against
    /// in-memory values, without the backend.
    pub fn compilable(&self) -> bool {
        match self {
            Predicate::True | Predicate::Cmp { .. } | Predicate::IsNull(_) => true,
            Predicate::And(a, b) | Predicate::Or(a, b) => a.compilable() && b.compilable(),
            Predicate::Not(p) => p.compilable(),
            Predicate::RowId(_) => false,
        }
    }

    /// Evaluate against an in-memory row. `fetch` returns the current
    /// value of a column, or `None` when the column is undefined
    /// (treated as SQL NULL).
    ///
    /// Fails with `Error::NotCompilable` for shapes only the backend can
    /// resolve, which is what triggers bulk set()'s reload fallback.
    pub fn eval(&self, fetch: &dyn Fn(&str) -> Option<Value>) -> Result<bool> {
        match self {
            Predicate::True => Ok(true),
            Predicate::Cmp {
                column,
                op,
                operand,
            } => {
                let left = fetch(column).unwrap_or(Value::Null);
                let right = match operand {
                    Operand::Value(v) => v.clone(),
                    Operand::Column(name) => fetch(name).unwrap_or(Value::Null),
                };
                // Comparisons against NULL never match, as in SQL.
                if left.is_null() || right.is_null() {
                    return Ok(false);
                }
                let ord = match compare_values(&left, &right) {
                    Some(ord) => ord,
                    None => return Ok(false),
                };
                Ok(match op {
                    CmpOp::Eq => ord == Ordering::Equal,
                    CmpOp::Ne => ord != Ordering::Equal,
                    CmpOp::Lt => ord == Ordering::Less,
                    CmpOp::Le => ord != Ordering::Greater,
                    CmpOp::Gt => ord == Ordering::Greater,
                    CmpOp::Ge => ord != Ordering::Less,
                })
            }
            Predicate::IsNull(column) => {
                Ok(fetch(column).map_or(true, |v| v.is_null()))
            }
            Predicate::And(a, b) => Ok(a.eval(fetch)? && b.eval(fetch)?),
            Predicate::Or(a, b) => Ok(a.eval(fetch)? || b.eval(fetch)?),
            Predicate::Not(p) => Ok(!p.eval(fetch)?),
            Predicate::RowId(_) => Err(Error::NotCompilable),
        }
    }
}

/// Order two values, coercing across the numeric variants.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Decimal(x), Value::Decimal(y)) => {
            decimal_cmp(x.unscaled(), x.scale(), y.unscaled(), y.scale())
        }
        _ => None,
    }
}

fn decimal_cmp(au: i128, ascale: u32, bu: i128, bscale: u32) -> Option<Ordering> {
    let scale_up = |unscaled: i128, by: u32| -> Option<i128> {
        let mut v = unscaled;
        for _ in 0..by {
            v = v.checked_mul(10)?;
        }
        Some(v)
    };
    let (a, b) = if ascale >= bscale {
        (Some(au), scale_up(bu, ascale - bscale))
    } else {
        (scale_up(au, bscale - ascale), Some(bu))
    };
    match (a, b) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        // Magnitudes too large for exact scaling; approximate.
        _ => {
            let fa = au as f64 / 10f64.powi(ascale as i32);
            let fb = bu as f64 / 10f64.powi(bscale as i32);
            fa.partial_cmp(&fb)
        }
    }
}

/// Build the conjunction `cols[0] = vals[0] AND cols[1] = vals[1] ...`,
/// the canonical primary-key lookup shape.
pub fn compare_columns(columns: &[&'static str], values: &[Value]) -> Predicate {
    let mut pred = Predicate::True;
    for (column, value) in columns.iter().zip(values) {
        pred = pred.and(Predicate::Cmp {
            column,
            op: CmpOp::Eq,
            operand: Operand::Value(value.clone()),
        });
    }
    pred
}

/// A single column assignment for bulk UPDATE
#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    pub column: &'static str,
    pub operand: Operand,
}

/// Sort direction for ORDER BY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: &'static str,
    pub direction: Direction,
}

/// Aggregate reads supported by the query façade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Min(&'static str),
    Max(&'static str),
    Avg(&'static str),
    Sum(&'static str),
}

/// What a SELECT produces per row
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Columns(Vec<&'static str>),
    Aggregate(Aggregate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: &'static str,
    pub projection: Projection,
    pub predicate: Predicate,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: &'static str,
    pub columns: Vec<&'static str>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: &'static str,
    pub sets: Vec<(&'static str, Operand)>,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: &'static str,
    pub predicate: Predicate,
}

/// A backend-agnostic statement: either an expression tree the backend
/// interprets, or literal text with positional `?` parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Text(String),
}
