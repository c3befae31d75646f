//! Shared fixtures: a scripted database connection, a small catalog and
//! engine contexts over temporary data directories.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use replica_worker::catalog::{ColumnDef, DatabaseInfo, TableInfo};
use replica_worker::config::{Config, ConnectionParams, Technology};
use replica_worker::context::EngineContext;
use replica_worker::db::{Connection, Connector, Field, Row};
use replica_worker::error::{Error, Result, ServerError};
use replica_worker::processor::Processor;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One catalog database: partitioned tables `Object` (a director) and
/// `Source`, plus the unpartitioned `Filter`.
pub fn test_catalog() -> Vec<DatabaseInfo> {
    vec![DatabaseInfo {
        name: "db1".to_string(),
        tables: vec![
            TableInfo {
                name: "Object".to_string(),
                is_partitioned: true,
                is_director: true,
                primary_key_column: Some("objectId".to_string()),
                columns: vec![
                    ColumnDef { name: "qserv_trans_id".to_string(), col_type: "INT".to_string() },
                    ColumnDef { name: "objectId".to_string(), col_type: "BIGINT".to_string() },
                    ColumnDef { name: "subChunkId".to_string(), col_type: "INT".to_string() },
                ],
            },
            TableInfo {
                name: "Source".to_string(),
                is_partitioned: true,
                ..TableInfo::default()
            },
            TableInfo { name: "Filter".to_string(), ..TableInfo::default() },
        ],
    }]
}

/// What the scripted connection does in response to one statement.
pub enum Reply {
    Ok,
    ResultSet { fields: Vec<Field>, rows: Vec<Row>, charset: String },
    ServerError(u16, String),
}

pub type Script = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

/// A connection driven by a script closure; every statement is logged.
pub struct MockConn {
    script: Script,
    log: Arc<Mutex<Vec<String>>>,
    fields: Vec<Field>,
    rows: VecDeque<Row>,
    charset: String,
    has_result: bool,
}

impl Connection for MockConn {
    fn execute(&mut self, sql: &str) -> Result<()> {
        self.log.lock().expect("log lock").push(sql.to_string());
        self.has_result = false;
        self.fields.clear();
        self.rows.clear();
        match (self.script)(sql) {
            Reply::Ok => Ok(()),
            Reply::ResultSet { fields, rows, charset } => {
                self.fields = fields;
                self.rows = rows.into();
                self.charset = charset;
                self.has_result = true;
                Ok(())
            }
            Reply::ServerError(code, message) => Err(Error::Server(ServerError::new(code, message))),
        }
    }

    fn has_result(&self) -> bool {
        self.has_result
    }

    fn fields(&self) -> Vec<Field> {
        self.fields.clone()
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        Ok(self.rows.pop_front())
    }

    fn affected_rows(&self) -> u64 {
        0
    }

    fn warnings(&self) -> u64 {
        0
    }

    fn char_set_name(&self) -> String {
        self.charset.clone()
    }
}

/// Connector producing scripted connections. Returns the statement log and
/// the users the connector was asked to authenticate as.
pub fn scripted_connector(
    script: Script,
) -> (Connector, Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let users: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log_for_conn = Arc::clone(&log);
    let users_for_conn = Arc::clone(&users);
    let connector: Connector = Arc::new(move |params: &ConnectionParams| {
        users_for_conn.lock().expect("users lock").push(params.user.clone());
        Ok(Box::new(MockConn {
            script: Arc::clone(&script),
            log: Arc::clone(&log_for_conn),
            fields: Vec::new(),
            rows: VecDeque::new(),
            charset: "latin1".to_string(),
            has_result: false,
        }) as Box<dyn Connection>)
    });
    (connector, log, users)
}

/// A connector for tests that never touch the database.
pub fn null_connector() -> Connector {
    Arc::new(|_params: &ConnectionParams| {
        Err(Error::BadConfig("no database in this test".to_string()))
    })
}

/// Engine configuration rooted in a temporary directory.
pub fn test_config(root: &std::path::Path, technology: Technology) -> Config {
    let mut config = Config::default();
    config.worker.data_dir = root.join("data");
    config.worker.loader_tmp_dir = root.join("ingest");
    config.worker.fs_buf_size_bytes = 1024;
    config.worker.num_svc_processing_threads = 2;
    config.worker.technology = technology;
    config.worker.director_index_record_size = 1024;
    config.controller.request_timeout_sec = 600;
    config
}

pub fn test_context(
    root: &std::path::Path,
    technology: Technology,
    connector: Connector,
) -> EngineContext {
    EngineContext::new("worker-A", test_config(root, technology), test_catalog(), connector)
}

/// Poll the tracker until the request reaches a terminal status.
pub fn wait_terminal(processor: &Processor, id: &str, timeout: Duration) -> Value {
    let deadline = Instant::now() + timeout;
    loop {
        let response = processor.track_request(id);
        let status = response["status"].as_u64().unwrap_or(0);
        // SUCCESS, BAD, FAILED, CANCELLED
        if matches!(status, 1 | 5 | 6 | 7) {
            return response;
        }
        assert!(Instant::now() < deadline, "request {id} did not finish: {response}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Dispose a request as soon as its worker thread has parked it in the
/// finished queue.
pub fn dispose_soon(processor: &Processor, id: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !processor.dispose_request(id) {
        assert!(Instant::now() < deadline, "request {id} never reached the finished queue");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn status_str(response: &Value) -> &str {
    response["status_str"].as_str().unwrap_or("")
}

pub fn status_ext_str(response: &Value) -> &str {
    response["status_ext_str"].as_str().unwrap_or("")
}
