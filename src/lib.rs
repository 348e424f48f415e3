mod conn;
mod error;
mod expr;
mod memory;
mod meta;
mod result_set;
mod store;
mod tracker;
mod value;

pub use conn::{
    convert_param_marks, BusyRetry, Connection, Database, ExecFlags, RetryOptions, RowIter, Rows,
    RowsExt,
};
pub use error::{Error, Result};
pub use expr::{
    compare_columns, compare_values, Aggregate, Assign, CmpOp, Delete, Direction, Insert, Operand,
    OrderBy, Predicate, Projection, Select, Statement, Update,
};
pub use memory::MemoryDatabase;
pub use meta::{
    describe, Column, ColumnDef, Entity, EntityDef, EntitySpec, Event, Handle, Object,
};
pub use result_set::{ResultIter, ResultSet};
pub use store::{IntoKey, Store};
pub use value::{Decimal, FromValue, Kind, ToValue, Value};
