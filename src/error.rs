use std::result;

use thiserror::Error;

/// Custom result type for store operations
pub type Result<T> = result::Result<T, Error>;

/// Store error conditions
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Entity declaration is unusable (empty table, empty or unknown primary key)
    #[error("invalid entity declaration: {0}")]
    Configuration(String),
    /// Object is already scheduled to be added
    #[error("object is already scheduled to be added")]
    AlreadyAdded,
    /// Object is already scheduled to be removed
    #[error("object is already scheduled to be removed")]
    AlreadyRemoved,
    /// Object is already part of a different store
    #[error("object is part of another store")]
    ForeignStore,
    /// Object is already present and alive in this store
    #[error("object is already in the store")]
    AlreadyInStore,
    /// Object does not belong to this store
    #[error("object is not in this store")]
    NotInStore,
    /// Object was never flushed, so it has no database row to reload
    #[error("can't reload an object that was never flushed")]
    NeverFlushed,
    /// Bulk set() was given an expression shape it does not support
    #[error("unsupported set expression")]
    UnsupportedSetExpr,
    /// Flush dependency constraints form a cycle
    #[error("can't flush due to ordering loop")]
    OrderingCycle,
    /// Predicate cannot be evaluated without the database
    #[error("predicate cannot be evaluated in memory")]
    NotCompilable,
    /// Value does not match the declared column kind
    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// Decimal literal could not be parsed
    #[error("invalid decimal literal: {0:?}")]
    InvalidDecimal(String),
    /// Statement referenced a table the backend does not know
    #[error("no such table: {0}")]
    NoSuchTable(String),
    /// Statement referenced a column the backend does not know
    #[error("no such column: {0}")]
    NoSuchColumn(String),
    /// Resource temporarily busy (lock contention in the backend)
    #[error("database is busy")]
    Busy,
    /// Connection has been closed
    #[error("connection is closed")]
    ConnectionClosed,
    /// Any other backend failure, propagated unchanged
    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            Error::OrderingCycle.to_string(),
            "can't flush due to ordering loop"
        );
        assert_eq!(Error::Busy.to_string(), "database is busy");
        let err = Error::TypeMismatch {
            expected: "int",
            found: "text",
        };
        assert_eq!(err.to_string(), "type mismatch: expected int, got text");
    }
}
