//! The database access capability.
//!
//! The engine does not ship a MySQL client. It consumes a [`Connection`]
//! implementation provided by the embedding process and concerns itself only
//! with transactions, pooling and query generation on top of it.

pub mod pool;
pub mod query;
pub mod transaction;


use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ConnectionParams;
use crate::error::{Error, Result};

/// Metadata of one column of a result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
}

/// One row of a result set: a sequence of nullable byte-strings.
pub type Row = Vec<Option<Vec<u8>>>;

/// A live connection with at most one statement's result pending.
///
/// Statement failures carry the server's error number through
/// [`crate::error::ServerError`] so callers can classify them.
#[auto_impl::auto_impl(&mut, Box)]
pub trait Connection: Send {
    fn execute(&mut self, sql: &str) -> Result<()>;

    fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN")
    }

    fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK")
    }

    /// Whether the last executed statement produced a result set.
    fn has_result(&self) -> bool;

    /// Field metadata of the pending result set (empty otherwise).
    fn fields(&self) -> Vec<Field>;

    /// Fetch the next row of the pending result set.
    fn next_row(&mut self) -> Result<Option<Row>>;

    fn affected_rows(&self) -> u64;

    fn warnings(&self) -> u64;

    fn char_set_name(&self) -> String;

    /// Whether the connection should be discarded instead of pooled.
    fn is_broken(&self) -> bool {
        false
    }
}

/// Factory producing connections for a given service account. Supplied by
/// the embedding process.
pub type Connector =
    Arc<dyn Fn(&ConnectionParams) -> Result<Box<dyn Connection>> + Send + Sync>;

/// Execute a query expected to return a single row and extract the value of
/// its first column. `NULL` maps to `None`.
pub fn select_single_value<C: Connection + ?Sized>(
    conn: &mut C,
    query: &str,
) -> Result<Option<Vec<u8>>> {
    conn.execute(query)?;
    if !conn.has_result() {
        return Err(Error::logic(format!(
            "query does not produce a result set: {query}"
        )));
    }
    let mut value: Option<Option<Vec<u8>>> = None;
    let mut num_rows = 0_usize;
    while let Some(mut row) = conn.next_row()? {
        if num_rows == 0 {
            if row.is_empty() {
                return Err(Error::logic(format!("empty row from query: {query}")));
            }
            value = Some(row.swap_remove(0));
        }
        // The remaining rows must be drained to keep the connection usable.
        num_rows += 1;
    }
    match (num_rows, value) {
        (1, Some(v)) => Ok(v),
        (0, _) => Err(Error::Server(crate::error::ServerError::new(
            0,
            format!("empty result set from query: {query}"),
        ))),
        _ => Err(Error::logic(format!(
            "result set has more than 1 row: {query}"
        ))),
    }
}

/// Like [`select_single_value`] for queries returning one integer.
pub fn select_single_u64<C: Connection + ?Sized>(conn: &mut C, query: &str) -> Result<u64> {
    let value = select_single_value(conn, query)?
        .ok_or_else(|| Error::logic(format!("NULL from query: {query}")))?;
    let text = simdutf8::basic::from_utf8(&value)
        .map_err(|_| Error::logic(format!("non-UTF8 value from query: {query}")))?;
    text.parse::<u64>()
        .map_err(|e| Error::logic(format!("non-numeric value '{text}' from query: {query}: {e}")))
}
