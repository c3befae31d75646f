//! Catalog descriptors consumed from the configuration collaborator.
//!
//! The engine is not the catalog authority. It only needs to know, per
//! database, which tables are partitioned and, for director tables, the
//! primary-key column. The registry is loaded once at startup and swapped
//! wholesale on reconfiguration.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the sub-chunk identifier column of director tables.
pub const SUB_CHUNK_COLUMN: &str = "subChunkId";

/// Name of the super-transaction identifier column of ingested tables.
pub const TRANSACTION_ID_COLUMN: &str = "qserv_trans_id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableInfo {
    pub name: String,
    pub is_partitioned: bool,
    pub is_director: bool,
    /// Column used for routing queries to sub-chunks. Required for directors.
    pub primary_key_column: Option<String>,
    /// Table schema, when one has been loaded into the catalog.
    pub columns: Vec<ColumnDef>,
}

impl TableInfo {
    pub fn column_type(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.col_type.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseInfo {
    pub name: String,
    pub tables: Vec<TableInfo>,
}

impl DatabaseInfo {
    pub fn partitioned_tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.iter().filter(|t| t.is_partitioned)
    }

    pub fn find_table(&self, name: &str) -> Result<&TableInfo> {
        self.tables.iter().find(|t| t.name == name).ok_or_else(|| {
            Error::InvalidParam(format!("no table '{name}' in database '{}'", self.name))
        })
    }
}

/// The in-process view of the catalog, keyed by database name.
#[derive(Debug, Default)]
pub struct DatabaseRegistry {
    databases: RwLock<HashMap<String, DatabaseInfo>>,
}

impl DatabaseRegistry {
    pub fn new(databases: impl IntoIterator<Item = DatabaseInfo>) -> Self {
        Self {
            databases: RwLock::new(
                databases.into_iter().map(|db| (db.name.clone(), db)).collect(),
            ),
        }
    }

    /// Look up a database descriptor. Unknown names are an invalid parameter,
    /// surfaced to the caller before a request is enqueued.
    pub fn database(&self, name: &str) -> Result<DatabaseInfo> {
        self.databases
            .read()
            .map_err(|_| Error::logic("database registry lock poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidParam(format!("unknown database '{name}'")))
    }

    /// Replace the whole registry (reconfiguration).
    pub fn replace(&self, databases: impl IntoIterator<Item = DatabaseInfo>) -> Result<()> {
        let mut guard = self
            .databases
            .write()
            .map_err(|_| Error::logic("database registry lock poisoned"))?;
        *guard = databases.into_iter().map(|db| (db.name.clone(), db)).collect();
        Ok(())
    }
}
