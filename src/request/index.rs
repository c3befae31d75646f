//! Director-index extraction.
//!
//! The director-side SELECT may produce far more data than a response can
//! carry, so it is staged into a server-side TSV file first and the
//! controller fetches it back in size-capped slices. Peak memory stays
//! bounded by the configured record size.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::catalog::{DatabaseInfo, SUB_CHUNK_COLUMN, TRANSACTION_ID_COLUMN, TableInfo};
use crate::context::EngineContext;
use crate::db::query as query_gen;
use crate::db::pool::ConnectionPool;
use crate::db::transaction::TransactionScope;
use crate::error::{Error, Result, ServerErrorKind};
use crate::fsname;
use crate::proto::{Status, StatusExt};

use super::payload::DirectorIndexSpec;
use super::{RequestCore, RequestTask};

pub struct DirectorIndexTask {
    ctx: Arc<EngineContext>,
    spec: DirectorIndexSpec,
    pool: Arc<ConnectionPool>,
    database: DatabaseInfo,
    table: TableInfo,
    tmp_dir: PathBuf,
    file_path: PathBuf,
    data: Vec<u8>,
    file_size: u64,
    error: String,
}

impl DirectorIndexTask {
    pub fn new(
        ctx: Arc<EngineContext>,
        spec: DirectorIndexSpec,
        pool: Arc<ConnectionPool>,
        request_id: &str,
    ) -> Result<Self> {
        let database = ctx.databases.database(&spec.database)?;
        let table = database.find_table(&spec.director_table)?.clone();
        let tmp_dir = ctx
            .config()
            .worker
            .loader_tmp_dir
            .join(fsname::obj2fs(&spec.database)?);
        let partition = if spec.has_transactions {
            format!("-p{}", spec.transaction_id)
        } else {
            String::new()
        };
        let file_path = tmp_dir.join(format!(
            "{}-{}{partition}-{request_id}",
            fsname::obj2fs(&table.name)?,
            spec.chunk
        ));
        Ok(Self {
            ctx,
            spec,
            pool,
            database,
            table,
            tmp_dir,
            file_path,
            data: Vec::new(),
            file_size: 0,
            error: String::new(),
        })
    }

    /// The staging query. Validates the director configuration and injects
    /// the chunk number as a literal column since the chunk-id column is
    /// optional in director tables.
    fn query(&self) -> Result<String> {
        if !self.table.is_director {
            return Err(Error::InvalidParam(format!(
                "table '{}' is not configured as director in database '{}'",
                self.table.name, self.database.name
            )));
        }
        let primary_key = self.table.primary_key_column.clone().unwrap_or_default();
        if primary_key.is_empty() {
            return Err(Error::InvalidParam(format!(
                "director table '{}' has not been properly configured in database '{}'",
                self.table.name, self.database.name
            )));
        }
        if self.table.columns.is_empty() {
            return Err(Error::InvalidParam(format!(
                "no schema found for director table '{}' of database '{}'",
                self.table.name, self.database.name
            )));
        }
        let missing_trans = self.spec.has_transactions
            && self.table.column_type(TRANSACTION_ID_COLUMN).is_none();
        if missing_trans
            || self.table.column_type(&primary_key).is_none()
            || self.table.column_type(SUB_CHUNK_COLUMN).is_none()
        {
            return Err(Error::InvalidParam(format!(
                "column definitions for the identifier or sub-chunk columns are missing \
                 in the schema of director table '{}' of database '{}'",
                self.table.name, self.database.name
            )));
        }

        let chunk_table = query_gen::id2(
            &self.database.name,
            &format!("{}_{}", self.table.name, self.spec.chunk),
        );
        let chunk_literal = self.spec.chunk.to_string();
        let mut sql = String::from("SELECT ");
        if self.spec.has_transactions {
            let _ = write!(sql, "{},", query_gen::id(TRANSACTION_ID_COLUMN));
        }
        let _ = write!(
            sql,
            "{},{chunk_literal},{} FROM {chunk_table}",
            query_gen::id(&primary_key),
            query_gen::id(SUB_CHUNK_COLUMN)
        );
        if self.spec.has_transactions {
            let _ = write!(sql, " PARTITION ({})", query_gen::id(&format!("p{}", self.spec.transaction_id)));
        }
        sql.push_str(" ORDER BY ");
        if self.spec.has_transactions {
            let _ = write!(sql, "{},", query_gen::id(TRANSACTION_ID_COLUMN));
        }
        sql.push_str(&query_gen::id(&primary_key));
        sql.push_str(&query_gen::into_outfile(&self.file_path.to_string_lossy()));
        Ok(sql)
    }

    /// Best-effort removal of the staging file.
    fn remove_file(&self) {
        if let Err(e) = std::fs::remove_file(&self.file_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    file = %self.file_path.display(),
                    "failed to remove the staging file: {e}"
                );
            }
        }
    }

    /// Read one record-sized slice at `offset`. Returns the extended status
    /// of a failure, or `None` on success.
    fn read_file(&mut self, offset: u64) -> Option<StatusExt> {
        let mut file = match File::open(&self.file_path) {
            Ok(file) => file,
            Err(e) => {
                self.error = format!("failed to open file '{}': {e}", self.file_path.display());
                return Some(StatusExt::FileRemoteOpen);
            }
        };
        self.file_size = match file.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                self.error = format!("failed to get file size '{}': {e}", self.file_path.display());
                return Some(StatusExt::FileSize);
            }
        };

        if offset == self.file_size {
            self.data.clear();
            self.remove_file();
            return None;
        }
        if offset > self.file_size {
            self.error = format!(
                "attempted to read the file '{}' at offset {offset} beyond the file size \
                 of {} bytes",
                self.file_path.display(),
                self.file_size
            );
            return Some(StatusExt::InvalidParam);
        }
        if offset != 0 {
            if let Err(e) = file.seek(SeekFrom::Start(offset)) {
                self.error = format!("failed to seek '{}': {e}", self.file_path.display());
                return Some(StatusExt::FileRead);
            }
        }

        let record_size = (self.file_size - offset)
            .min(self.ctx.config().worker.director_index_record_size)
            as usize;
        self.data.resize(record_size, 0);
        if let Err(e) = file.read_exact(&mut self.data) {
            self.error = format!(
                "failed to read {record_size} bytes from '{}' at offset {offset}: {e}",
                self.file_path.display()
            );
            return Some(StatusExt::FileRead);
        }

        // The last record consumes the staging file.
        if offset + record_size as u64 >= self.file_size {
            self.remove_file();
        }
        None
    }

    fn run(&mut self) -> Result<Option<StatusExt>> {
        // Only the first slice (offset 0) scans the table.
        if self.spec.offset == 0 {
            // The staging folder is shared with the database server and must
            // exist before the OUTFILE query runs.
            if let Err(e) = std::fs::create_dir_all(&self.tmp_dir) {
                self.error = format!("failed to create folder '{}': {e}", self.tmp_dir.display());
                return Ok(Some(StatusExt::FolderCreate));
            }
            // A stale file from an earlier attempt would fail the query.
            self.remove_file();

            let sql = self.query()?;
            let mut conn = self.pool.get()?;
            let mut scope = TransactionScope::begin(&mut *conn)?;
            scope.conn().execute(&sql)?;
            scope.commit()?;
        }
        Ok(self.read_file(self.spec.offset))
    }
}

impl RequestTask for DirectorIndexTask {
    fn execute(&mut self, core: &RequestCore) -> Result<bool> {
        debug!(
            id = core.id(),
            database = %self.spec.database,
            table = %self.spec.director_table,
            chunk = self.spec.chunk,
            offset = self.spec.offset,
            "director-index step"
        );
        core.check_if_cancelling()?;

        match self.run() {
            Ok(None) => core.set_status(Status::Success, StatusExt::None)?,
            Ok(Some(ext)) => core.set_status(Status::Failed, ext)?,
            Err(e) => {
                if e.is_cancelled() {
                    return Err(e);
                }
                self.error = e.to_string();
                let ext = match &e {
                    Error::Server(server) => match server.kind() {
                        ServerErrorKind::NoSuchTable => StatusExt::NoSuchTable,
                        ServerErrorKind::NotPartitionedTable => StatusExt::NotPartitionedTable,
                        ServerErrorKind::NoSuchPartition => StatusExt::NoSuchPartition,
                        _ => StatusExt::MysqlError,
                    },
                    Error::InvalidParam(_) => StatusExt::InvalidParam,
                    Error::LargeResult(_) => StatusExt::LargeResult,
                    _ => StatusExt::None,
                };
                core.set_status(Status::Failed, ext)?;
            }
        }
        Ok(true)
    }

    fn result(&self) -> Value {
        json!({
            "error": self.error,
            "data": to_hex(&self.data),
            "total_bytes": self.file_size,
        })
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
