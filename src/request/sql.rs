//! SQL management requests against the worker's database.
//!
//! A request either executes one generated statement sequence inside a
//! single transaction, or (batch mode) iterates over a list of tables with
//! one transaction and one result-set record per table. A closed set of
//! per-table errors is recoverable in batch mode and recorded in the
//! table's result set instead of failing the whole request.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, error};

use crate::context::EngineContext;
use crate::db::query::{self as query_gen, Query};
use crate::db::transaction::TransactionScope;
use crate::db::{Connection, select_single_u64};
use crate::error::{Error, Result, ServerErrorKind};
use crate::proto::{SqlRequestType, Status, StatusExt};

use super::payload::SqlSpec;
use super::{RequestCore, RequestTask};

pub struct SqlTask {
    ctx: Arc<EngineContext>,
    spec: SqlSpec,
    result_sets: Vec<Value>,
}

/// Errors that abort only the affected table of a batch request.
fn recoverable_ext(error: &Error) -> Option<StatusExt> {
    match error.server_kind()? {
        ServerErrorKind::NoSuchTable => Some(StatusExt::NoSuchTable),
        ServerErrorKind::NotPartitionedTable => Some(StatusExt::NotPartitionedTable),
        ServerErrorKind::DuplicateKey => Some(StatusExt::DuplicateKey),
        ServerErrorKind::CantDropKey => Some(StatusExt::CantDropKey),
        _ => None,
    }
}

/// Map a failure to the extended status reported to the controller.
fn failure_ext(error: &Error) -> StatusExt {
    match error {
        Error::Server(server) => match server.kind() {
            ServerErrorKind::NoSuchTable => StatusExt::NoSuchTable,
            ServerErrorKind::NotPartitionedTable => StatusExt::NotPartitionedTable,
            ServerErrorKind::NoSuchPartition => StatusExt::NoSuchPartition,
            ServerErrorKind::DuplicateKey => StatusExt::DuplicateKey,
            ServerErrorKind::CantDropKey => StatusExt::CantDropKey,
            ServerErrorKind::Other => StatusExt::MysqlError,
        },
        Error::InvalidParam(_) => StatusExt::InvalidParam,
        Error::LargeResult(_) => StatusExt::LargeResult,
        _ => StatusExt::OtherException,
    }
}

impl SqlTask {
    pub fn new(ctx: Arc<EngineContext>, spec: SqlSpec) -> Result<Self> {
        // The database must be known before the request is enqueued.
        let _ = ctx.databases.database(&spec.database)?;
        Ok(Self { ctx, spec, result_sets: Vec::new() })
    }

    fn push_result_set(&mut self) -> &mut Value {
        self.result_sets.push(json!({
            "status_ext": StatusExt::MysqlError.code(),
            "status_ext_str": StatusExt::MysqlError.as_str(),
            "char_set_name": "",
            "has_result": 0,
            "fields": [],
            "rows": [],
            "error": "",
        }));
        self.current_result_set()
    }

    fn current_result_set(&mut self) -> &mut Value {
        // push_result_set always runs first, the vector is never empty here.
        let last = self.result_sets.len().saturating_sub(1);
        &mut self.result_sets[last]
    }

    fn connect(&self) -> Result<Box<dyn Connection>> {
        // Arbitrary QUERY statements require caller-supplied credentials;
        // everything else runs under the worker's service account.
        let mut params = self.ctx.config().db_params()?;
        if self.spec.kind == Some(SqlRequestType::Query) {
            if let Some(user) = &self.spec.user {
                params.user = user.clone();
                params.password = self.spec.password.clone();
            }
        }
        (self.ctx.connector)(&params)
    }

    /// The statement sequence of a non-batch request.
    fn queries<C: Connection + ?Sized>(&self, conn: &mut C) -> Result<Vec<Query>> {
        let kind = self.spec.request_type()?;
        let database = &self.spec.database;
        Ok(match kind {
            SqlRequestType::Query => {
                let sql = self
                    .spec
                    .query
                    .clone()
                    .ok_or_else(|| Error::InvalidParam("missing query text".to_string()))?;
                vec![Query::new(sql)]
            }
            SqlRequestType::CreateDatabase => vec![query_gen::create_database(database, true)],
            SqlRequestType::DropDatabase => vec![query_gen::drop_database(database, true)],
            SqlRequestType::EnableDatabase => vec![query_gen::enable_database(database)],
            SqlRequestType::DisableDatabase => query_gen::disable_database(database),
            SqlRequestType::GrantAccess => {
                let user = self
                    .spec
                    .user
                    .clone()
                    .ok_or_else(|| Error::InvalidParam("missing user".to_string()))?;
                vec![query_gen::grant_access(database, &user)]
            }
            _ => {
                let table = self
                    .spec
                    .table
                    .clone()
                    .ok_or_else(|| Error::InvalidParam("missing table".to_string()))?;
                vec![self.generate_query(conn, &table)?]
            }
        })
    }

    /// The statement affecting one table, for the table-scope request types.
    fn generate_query<C: Connection + ?Sized>(&self, conn: &mut C, table: &str) -> Result<Query> {
        let kind = self.spec.request_type()?;
        let database = &self.spec.database;
        match kind {
            SqlRequestType::CreateTable => Ok(query_gen::create_table(
                database,
                table,
                &self.spec.columns,
                &self.spec.engine,
                &self.spec.charset_name,
                &self.spec.collation_name,
                &self.spec.comment,
                self.spec.partition_by_column.as_deref(),
            )),
            SqlRequestType::DropTable => Ok(query_gen::drop_table(database, table, true)),
            SqlRequestType::DropTablePartition => {
                let transaction_id = self
                    .spec
                    .transaction_id
                    .ok_or_else(|| Error::InvalidParam("missing transaction id".to_string()))?;
                Ok(query_gen::drop_table_partition(database, table, transaction_id))
            }
            SqlRequestType::RemoveTablePartitioning => {
                Ok(query_gen::remove_table_partitioning(database, table))
            }
            SqlRequestType::CreateTableIndex => {
                let index = self
                    .spec
                    .index
                    .as_ref()
                    .ok_or_else(|| Error::InvalidParam("missing index definition".to_string()))?;
                Ok(query_gen::create_table_index(database, table, index))
            }
            SqlRequestType::DropTableIndex => {
                let index_name = self
                    .spec
                    .index_name
                    .as_deref()
                    .ok_or_else(|| Error::InvalidParam("missing index name".to_string()))?;
                Ok(query_gen::drop_table_index(database, table, index_name))
            }
            SqlRequestType::GetTableIndex => Ok(query_gen::get_table_index(database, table)),
            SqlRequestType::AlterTable => {
                let spec = self
                    .spec
                    .alter_spec
                    .as_deref()
                    .ok_or_else(|| Error::InvalidParam("missing alter specification".to_string()))?;
                Ok(query_gen::alter_table(database, table, spec))
            }
            SqlRequestType::TableRowStats => {
                // The transaction-id column is optional in legacy catalogs;
                // consult the information schema before shaping the query.
                let count = select_single_u64(conn, &query_gen::row_stats_probe(database, table))?;
                Ok(query_gen::row_stats(database, table, count != 0))
            }
            _ => Err(Error::InvalidParam(format!(
                "not a table-scope request type: {}",
                kind.as_str()
            ))),
        }
    }

    /// Execute one statement, holding its named mutex if it has one.
    fn execute_query<C: Connection + ?Sized>(&self, conn: &mut C, query: &Query) -> Result<()> {
        match &query.mutex_name {
            Some(name) => {
                let mutex = self.ctx.named_mutexes.get(name);
                let _guard = match mutex.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                conn.execute(&query.sql)
            }
            None => conn.execute(&query.sql),
        }
    }

    /// Capture the result set of the last executed statement into the
    /// current record.
    fn extract_result_set<C: Connection + ?Sized>(&mut self, conn: &mut C) -> Result<()> {
        let max_rows = self.spec.max_rows;
        let has_result = conn.has_result();
        let char_set_name = conn.char_set_name();
        let fields = conn.fields();

        let mut rows: Vec<Value> = Vec::new();
        if has_result {
            let mut num_rows: u64 = 0;
            while let Some(row) = conn.next_row()? {
                if max_rows != 0 && num_rows >= max_rows {
                    return Err(Error::LargeResult(format!("max_rows={max_rows} limit exceeded")));
                }
                num_rows += 1;
                let cells: Vec<Value> = row
                    .into_iter()
                    .map(|cell| match cell {
                        Some(bytes) => json!(String::from_utf8_lossy(&bytes).into_owned()),
                        None => Value::Null,
                    })
                    .collect();
                rows.push(Value::Array(cells));
            }
        }

        let result_set = self.current_result_set();
        result_set["status_ext"] = json!(StatusExt::None.code());
        result_set["status_ext_str"] = json!(StatusExt::None.as_str());
        result_set["char_set_name"] = json!(char_set_name);
        result_set["has_result"] = json!(u8::from(has_result));
        if has_result {
            result_set["fields"] = serde_json::to_value(&fields).unwrap_or(Value::Null);
            result_set["rows"] = Value::Array(rows);
        }
        Ok(())
    }

    /// Record a failure into the current result set and finalize the
    /// request status.
    fn report_failure(&mut self, core: &RequestCore, ext: StatusExt, message: &str) -> Result<()> {
        error!(id = core.id(), ext = ext.as_str(), "{message}");
        let result_set = self.current_result_set();
        result_set["status_ext"] = json!(ext.code());
        result_set["status_ext_str"] = json!(ext.as_str());
        result_set["error"] = json!(message);
        core.set_status(Status::Failed, ext)
    }

    fn run_batch(&mut self, core: &RequestCore, conn: &mut Box<dyn Connection>) -> Result<()> {
        let tables = self.spec.tables.clone();
        let mut num_failures = 0_usize;
        for (i, table) in tables.iter().enumerate() {
            if i > 0 {
                self.push_result_set();
            }
            self.current_result_set()["scope"] = json!(table);
            let outcome = self.run_one_table(conn, table);
            if let Err(e) = outcome {
                match recoverable_ext(&e) {
                    Some(ext) => {
                        num_failures += 1;
                        let result_set = self.current_result_set();
                        result_set["status_ext"] = json!(ext.code());
                        result_set["status_ext_str"] = json!(ext.as_str());
                        result_set["error"] = json!(e.to_string());
                    }
                    // Everything else aborts the batch.
                    None => return Err(e),
                }
            }
        }
        if num_failures > 0 {
            core.set_status(Status::Failed, StatusExt::Multiple)
        } else {
            core.set_status(Status::Success, StatusExt::None)
        }
    }

    fn run_one_table(&mut self, conn: &mut Box<dyn Connection>, table: &str) -> Result<()> {
        let mut scope = TransactionScope::begin(conn)?;
        let query = self.generate_query(scope.conn(), table)?;
        self.execute_query(scope.conn(), &query)?;
        self.extract_result_set(scope.conn())?;
        scope.commit()
    }

    fn run_plain(&mut self, core: &RequestCore, conn: &mut Box<dyn Connection>) -> Result<()> {
        let mut scope = TransactionScope::begin(conn)?;
        let queries = self.queries(scope.conn())?;
        for (i, query) in queries.iter().enumerate() {
            if i > 0 {
                self.push_result_set();
            }
            self.execute_query(scope.conn(), query)?;
            self.extract_result_set(scope.conn())?;
        }
        scope.commit()?;
        core.set_status(Status::Success, StatusExt::None)
    }
}

impl RequestTask for SqlTask {
    fn execute(&mut self, core: &RequestCore) -> Result<bool> {
        debug!(id = core.id(), kind = core.kind(), "sql request");
        core.check_if_cancelling()?;

        // The default result-set record exists before any database work so
        // failures always have somewhere to land.
        self.push_result_set();

        let outcome = (|| -> Result<()> {
            let mut conn = self.connect()?;
            if self.spec.batch_mode {
                self.run_batch(core, &mut conn)
            } else {
                self.run_plain(core, &mut conn)
            }
        })();
        if let Err(e) = outcome {
            if e.is_cancelled() {
                return Err(e);
            }
            self.report_failure(core, failure_ext(&e), &e.to_string())?;
        }
        Ok(true)
    }

    fn result(&self) -> Value {
        json!({"result_sets": self.result_sets})
    }
}
