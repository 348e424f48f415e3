use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::trace;

use crate::error::{Error, Result};
use crate::expr::Statement;
use crate::value::Value;

bitflags! {
    /// Statement execution options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExecFlags: u32 {
        /// The caller will not read any rows from the result
        const NO_RESULT = 0x01;
    }
}

/// Lazy, single-pass handle over the rows produced by one statement.
pub trait Rows {
    /// Next row, or `None` once exhausted.
    fn fetch_one(&mut self) -> Result<Option<Vec<Value>>>;

    /// Backend-specific identity of the last inserted row. Only
    /// meaningful right after an INSERT with a server-generated key.
    fn last_insert_id(&self) -> Option<i64>;
}

/// Iterator adapter over any row handle.
pub struct RowIter<'a> {
    rows: &'a mut dyn Rows,
}

impl Iterator for RowIter<'_> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.fetch_one().transpose()
    }
}

pub trait RowsExt {
    fn iter(&mut self) -> RowIter<'_>;
}

impl<R: Rows> RowsExt for R {
    fn iter(&mut self) -> RowIter<'_> {
        RowIter { rows: self }
    }
}

impl RowsExt for dyn Rows {
    fn iter(&mut self) -> RowIter<'_> {
        RowIter { rows: self }
    }
}

/// A live database connection. All calls are synchronous; backend
/// errors propagate unchanged.
pub trait Connection {
    fn execute(
        &mut self,
        statement: &Statement,
        params: &[Value],
        flags: ExecFlags,
    ) -> Result<Box<dyn Rows>>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// A database that can hand out connections.
pub trait Database {
    fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// Bounded retry policy for transient lock contention
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    /// Total time to keep retrying before the busy error propagates
    pub busy_timeout: Duration,
    /// Pause between attempts
    pub backoff: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            busy_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(100),
        }
    }
}

/// Connection wrapper that retries `execute` on `Error::Busy` for a
/// bounded time, then propagates the error unchanged. Commit and
/// rollback are never retried.
pub struct BusyRetry {
    inner: Box<dyn Connection>,
    options: RetryOptions,
}

impl BusyRetry {
    pub fn new(inner: Box<dyn Connection>, options: RetryOptions) -> Self {
        BusyRetry { inner, options }
    }
}

impl Connection for BusyRetry {
    fn execute(
        &mut self,
        statement: &Statement,
        params: &[Value],
        flags: ExecFlags,
    ) -> Result<Box<dyn Rows>> {
        let mut started: Option<Instant> = None;
        loop {
            match self.inner.execute(statement, params, flags) {
                Err(Error::Busy) => {
                    let begun = *started.get_or_insert_with(Instant::now);
                    if begun.elapsed() >= self.options.busy_timeout {
                        return Err(Error::Busy);
                    }
                    trace!("backend busy, retrying in {:?}", self.options.backoff);
                    thread::sleep(self.options.backoff);
                }
                other => return other,
            }
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// Rewrite a text statement's parameter markers from the engine's
/// canonical form to the backend's native one, leaving text inside
/// single-quoted string literals untouched.
pub fn convert_param_marks(statement: &str, from_mark: &str, to_mark: &str) -> String {
    if from_mark == to_mark || !statement.contains(from_mark) {
        return statement.to_string();
    }
    statement
        .split('\'')
        .enumerate()
        .map(|(i, token)| {
            // Odd chunks sit between quotes.
            if i % 2 == 0 {
                token.replace(from_mark, to_mark)
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("'")
}
