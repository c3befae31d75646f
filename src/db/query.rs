//! Deterministic SQL text generation for the management request types.
//!
//! Identifiers are backtick-quoted, values single-quoted with backslash
//! escaping. Statements that alter a table's schema carry a mutex name (the
//! canonical quoted identifier of the table) so the executor can serialize
//! them against concurrent requests touching the same table.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::catalog::ColumnDef;

/// A generated statement, optionally tied to a named mutex.
#[derive(Debug, Clone)]
pub struct Query {
    pub sql: String,
    pub mutex_name: Option<String>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), mutex_name: None }
    }

    pub fn with_mutex(sql: impl Into<String>, mutex_name: impl Into<String>) -> Self {
        Self { sql: sql.into(), mutex_name: Some(mutex_name.into()) }
    }
}

/// Index flavors accepted by the index-management requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlIndexSpec {
    Default,
    Unique,
    Fulltext,
    Spatial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlIndexKey {
    pub column: String,
    /// Prefix length for string columns, 0 for the whole column.
    #[serde(default)]
    pub length: u32,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
}

fn default_ascending() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlIndexDef {
    pub name: String,
    pub spec: SqlIndexSpec,
    #[serde(default)]
    pub comment: String,
    pub keys: Vec<SqlIndexKey>,
}

/// Quote an identifier, doubling embedded backticks.
pub fn id(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a qualified identifier `db`.`table`. This string doubles as the
/// canonical mutex name of the object.
pub fn id2(database: &str, table: &str) -> String {
    format!("{}.{}", id(database), id(table))
}

/// Quote a string value.
pub fn val(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

pub fn create_database(database: &str, if_not_exists: bool) -> Query {
    let clause = if if_not_exists { "IF NOT EXISTS " } else { "" };
    Query::new(format!("CREATE DATABASE {clause}{}", id(database)))
}

pub fn drop_database(database: &str, if_exists: bool) -> Query {
    let clause = if if_exists { "IF EXISTS " } else { "" };
    Query::new(format!("DROP DATABASE {clause}{}", id(database)))
}

/// Register a database as enabled in the worker bookkeeping schema.
/// REPLACE (not INSERT) keeps the operation idempotent.
pub fn enable_database(database: &str) -> Query {
    Query::new(format!(
        "REPLACE INTO {} ({}) VALUES ({})",
        id2("qservw_worker", "Dbs"),
        id("db"),
        val(database)
    ))
}

/// The two deletions disabling a database in the worker bookkeeping schema,
/// chunks first.
pub fn disable_database(database: &str) -> Vec<Query> {
    let where_clause = format!(" WHERE {}={}", id("db"), val(database));
    vec![
        Query::new(format!("DELETE FROM {}{where_clause}", id2("qservw_worker", "Chunks"))),
        Query::new(format!("DELETE FROM {}{where_clause}", id2("qservw_worker", "Dbs"))),
    ]
}

pub fn grant_access(database: &str, user: &str) -> Query {
    Query::new(format!("GRANT ALL ON {}.* TO {}@'localhost'", id(database), val(user)))
}

#[allow(clippy::too_many_arguments)]
pub fn create_table(
    database: &str,
    table: &str,
    columns: &[ColumnDef],
    engine: &str,
    charset: &str,
    collation: &str,
    comment: &str,
    partition_by_column: Option<&str>,
) -> Query {
    let table_id = id2(database, table);
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {table_id} (");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        let _ = write!(sql, "{} {}", id(&column.name), column.col_type);
    }
    let _ = write!(sql, ") ENGINE={engine}");
    if !charset.is_empty() {
        let _ = write!(sql, " DEFAULT CHARSET={charset}");
    }
    if !collation.is_empty() {
        let _ = write!(sql, " COLLATE={collation}");
    }
    if !comment.is_empty() {
        let _ = write!(sql, " COMMENT={}", val(comment));
    }
    if let Some(column) = partition_by_column {
        // Partitioned ingest tables start with the partition of the default
        // transaction 0.
        let _ = write!(
            sql,
            " PARTITION BY LIST ({}) (PARTITION {} VALUES IN (0))",
            id(column),
            id("p0")
        );
    }
    Query::with_mutex(sql, table_id)
}

pub fn drop_table(database: &str, table: &str, if_exists: bool) -> Query {
    let table_id = id2(database, table);
    let clause = if if_exists { "IF EXISTS " } else { "" };
    Query::with_mutex(format!("DROP TABLE {clause}{table_id}"), table_id)
}

pub fn drop_table_partition(database: &str, table: &str, transaction_id: u32) -> Query {
    let table_id = id2(database, table);
    Query::with_mutex(
        format!(
            "ALTER TABLE {table_id} DROP PARTITION IF EXISTS {}",
            id(&format!("p{transaction_id}"))
        ),
        table_id,
    )
}

pub fn remove_table_partitioning(database: &str, table: &str) -> Query {
    let table_id = id2(database, table);
    Query::with_mutex(format!("ALTER TABLE {table_id} REMOVE PARTITIONING"), table_id)
}

pub fn create_table_index(database: &str, table: &str, index: &SqlIndexDef) -> Query {
    let table_id = id2(database, table);
    let spec = match index.spec {
        SqlIndexSpec::Default => "",
        SqlIndexSpec::Unique => "UNIQUE ",
        SqlIndexSpec::Fulltext => "FULLTEXT ",
        SqlIndexSpec::Spatial => "SPATIAL ",
    };
    let mut sql = format!(
        "CREATE {spec}INDEX IF NOT EXISTS {} ON {table_id} (",
        id(&index.name)
    );
    for (i, key) in index.keys.iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        sql.push_str(&id(&key.column));
        if key.length != 0 {
            let _ = write!(sql, "({})", key.length);
        }
        sql.push_str(if key.ascending { " ASC" } else { " DESC" });
    }
    sql.push(')');
    if !index.comment.is_empty() {
        let _ = write!(sql, " COMMENT {}", val(&index.comment));
    }
    Query::with_mutex(sql, table_id)
}

pub fn drop_table_index(database: &str, table: &str, index_name: &str) -> Query {
    let table_id = id2(database, table);
    Query::with_mutex(
        format!("DROP INDEX IF EXISTS {} ON {table_id}", id(index_name)),
        table_id,
    )
}

pub fn get_table_index(database: &str, table: &str) -> Query {
    Query::new(format!("SHOW INDEXES FROM {}", id2(database, table)))
}

pub fn alter_table(database: &str, table: &str, spec: &str) -> Query {
    let table_id = id2(database, table);
    Query::with_mutex(format!("ALTER TABLE {table_id} {spec}"), table_id)
}

/// Probe for the presence of the transaction-id column, used to decide the
/// shape of the row-stats query.
pub fn row_stats_probe(database: &str, table: &str) -> String {
    format!(
        "SELECT COUNT(*) FROM {} WHERE {}={} AND {}={} AND {}={}",
        id2("information_schema", "COLUMNS"),
        id("TABLE_SCHEMA"),
        val(database),
        id("TABLE_NAME"),
        val(table),
        id("COLUMN_NAME"),
        val(crate::catalog::TRANSACTION_ID_COLUMN)
    )
}

/// Row statistics of a table, grouped by the transaction-id column when the
/// table carries one, with the default transaction 0 injected otherwise.
pub fn row_stats(database: &str, table: &str, has_transaction_column: bool) -> Query {
    let table_id = id2(database, table);
    let trans = id(crate::catalog::TRANSACTION_ID_COLUMN);
    if has_transaction_column {
        Query::new(format!(
            "SELECT {trans},COUNT(*) AS {} FROM {table_id} GROUP BY {trans}",
            id("num_rows")
        ))
    } else {
        Query::new(format!(
            "SELECT 0 AS {trans},COUNT(*) AS {} FROM {table_id}",
            id("num_rows")
        ))
    }
}

/// Append an `INTO OUTFILE` clause. The server writes tab-separated records,
/// which is the staging format of the director-index extraction.
pub fn into_outfile(path: &str) -> String {
    format!(" INTO OUTFILE {}", val(path))
}
