//! Typed request payloads.
//!
//! The controller submits JSON; each request type deserializes into one of
//! the structs below and is validated before anything is enqueued, so a
//! malformed payload is rejected with INVALID_PARAM at the service surface.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::ColumnDef;
use crate::db::query::SqlIndexDef;
use crate::error::{Error, Result};
use crate::proto::SqlRequestType;

/// Upper bound on the echo payload, a plain sanity cap.
const MAX_ECHO_DATA_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoSpec {
    #[serde(default)]
    pub delay_ms: u64,
    pub data: String,
}

impl EchoSpec {
    pub fn validate(&self) -> Result<()> {
        if self.data.len() > MAX_ECHO_DATA_BYTES {
            return Err(Error::InvalidParam(format!(
                "echo data exceeds {MAX_ECHO_DATA_BYTES} bytes"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReplicaSpec {
    pub database: String,
    pub chunk: u32,
    /// Name of the worker holding the source replica.
    pub source_worker: String,
    /// Host of the source worker's file server.
    #[serde(default)]
    pub source_host: String,
    #[serde(default)]
    pub source_port: u16,
    /// Data directory of the source worker, when it is mounted locally
    /// (POSIX technology only).
    #[serde(default)]
    pub source_data_dir: Option<PathBuf>,
}

impl CreateReplicaSpec {
    pub fn validate(&self, local_worker: &str) -> Result<()> {
        if self.source_worker == local_worker {
            return Err(Error::InvalidParam(
                "source and destination workers are the same".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteReplicaSpec {
    pub database: String,
    pub chunk: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindReplicaSpec {
    pub database: String,
    pub chunk: u32,
    /// Compute control sums of the found files (incremental, slower).
    #[serde(default)]
    pub compute_cs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindAllReplicasSpec {
    pub database: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlSpec {
    #[serde(rename = "type")]
    pub kind: Option<SqlRequestType>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    /// Single target table (non-batch table-scope requests).
    pub table: Option<String>,
    /// Target tables of a batch request.
    pub tables: Vec<String>,
    pub batch_mode: bool,
    /// Cap on the number of returned rows per statement, 0 for no cap.
    pub max_rows: u64,
    /// The raw statement of a QUERY request.
    pub query: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub engine: String,
    pub comment: String,
    pub charset_name: String,
    pub collation_name: String,
    pub partition_by_column: Option<String>,
    pub index: Option<SqlIndexDef>,
    pub index_name: Option<String>,
    pub transaction_id: Option<u32>,
    pub alter_spec: Option<String>,
}

impl SqlSpec {
    pub fn request_type(&self) -> Result<SqlRequestType> {
        self.kind
            .ok_or_else(|| Error::InvalidParam("missing SQL request type".to_string()))
    }

    /// Whether this request type operates on individual tables (and hence
    /// supports batch mode).
    pub fn is_table_scope(kind: SqlRequestType) -> bool {
        !matches!(
            kind,
            SqlRequestType::Query
                | SqlRequestType::CreateDatabase
                | SqlRequestType::DropDatabase
                | SqlRequestType::EnableDatabase
                | SqlRequestType::DisableDatabase
                | SqlRequestType::GrantAccess
        )
    }

    pub fn validate(&self) -> Result<()> {
        let kind = self.request_type()?;
        if self.batch_mode {
            if !Self::is_table_scope(kind) {
                return Err(Error::InvalidParam(format!(
                    "request type {} does not support batch mode",
                    kind.as_str()
                )));
            }
            if self.tables.is_empty() {
                return Err(Error::InvalidParam("batch mode requires tables".to_string()));
            }
        } else if Self::is_table_scope(kind) && self.table.is_none() {
            return Err(Error::InvalidParam(format!(
                "request type {} requires a table",
                kind.as_str()
            )));
        } else {
            // Database-scope requests carry everything they need.
        }
        match kind {
            SqlRequestType::Query => {
                if self.query.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::InvalidParam("missing query text".to_string()));
                }
                if self.user.is_none() {
                    return Err(Error::InvalidParam(
                        "QUERY requests require caller credentials".to_string(),
                    ));
                }
            }
            SqlRequestType::GrantAccess => {
                if self.user.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::InvalidParam("missing user to grant access to".to_string()));
                }
            }
            SqlRequestType::CreateTable => {
                if self.columns.is_empty() {
                    return Err(Error::InvalidParam("missing column definitions".to_string()));
                }
                if self.engine.is_empty() {
                    return Err(Error::InvalidParam("missing table engine".to_string()));
                }
            }
            SqlRequestType::CreateTableIndex => {
                let index = self
                    .index
                    .as_ref()
                    .ok_or_else(|| Error::InvalidParam("missing index definition".to_string()))?;
                if index.keys.is_empty() {
                    return Err(Error::InvalidParam("index has no key columns".to_string()));
                }
            }
            SqlRequestType::DropTableIndex => {
                if self.index_name.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::InvalidParam("missing index name".to_string()));
                }
            }
            SqlRequestType::DropTablePartition => {
                if self.transaction_id.is_none() {
                    return Err(Error::InvalidParam("missing transaction id".to_string()));
                }
            }
            SqlRequestType::AlterTable => {
                if self.alter_spec.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::InvalidParam("missing alter specification".to_string()));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectorIndexSpec {
    pub database: String,
    pub director_table: String,
    pub chunk: u32,
    /// Whether the table is partitioned by super-transactions.
    #[serde(default)]
    pub has_transactions: bool,
    #[serde(default)]
    pub transaction_id: u32,
    /// Read offset into the staging file; 0 triggers the table scan.
    #[serde(default)]
    pub offset: u64,
}

/// A submission, tagged by request type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum RequestSpec {
    Echo(EchoSpec),
    CreateReplica(CreateReplicaSpec),
    DeleteReplica(DeleteReplicaSpec),
    FindReplica(FindReplicaSpec),
    FindAllReplicas(FindAllReplicasSpec),
    Sql(SqlSpec),
    DirectorIndex(DirectorIndexSpec),
}

impl RequestSpec {
    /// The request type tag reported to the controller.
    pub fn kind(&self) -> String {
        match self {
            Self::Echo(_) => "TEST_ECHO".to_string(),
            Self::CreateReplica(_) => "REPLICATE".to_string(),
            Self::DeleteReplica(_) => "DELETE".to_string(),
            Self::FindReplica(_) => "FIND".to_string(),
            Self::FindAllReplicas(_) => "FIND-ALL".to_string(),
            Self::Sql(spec) => match spec.kind {
                Some(kind) => format!("SQL:{}", kind.as_str()),
                None => "SQL".to_string(),
            },
            Self::DirectorIndex(_) => "INDEX".to_string(),
        }
    }

    /// The payload echo included in responses.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
