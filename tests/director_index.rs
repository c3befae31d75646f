//! Director-index extraction: staging through an OUTFILE, sliced reads,
//! error mapping.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use replica_worker::config::Technology;
use replica_worker::context::EngineContext;
use replica_worker::processor::Processor;
use replica_worker::proto::QueuedRequestHdr;
use replica_worker::request::payload::DirectorIndexSpec;

use common::{
    Reply, dispose_soon, init_logging, scripted_connector, status_ext_str, status_str,
    test_catalog, test_config, wait_terminal,
};

/// A script materializing the OUTFILE with fixed content, as the database
/// server would.
fn outfile_script(content: &'static [u8]) -> common::Script {
    Arc::new(move |sql: &str| {
        if let Some(path) = extract_outfile_path(sql) {
            std::fs::write(path, content).expect("write staging file");
        }
        Reply::Ok
    })
}

fn extract_outfile_path(sql: &str) -> Option<String> {
    let start = sql.find("INTO OUTFILE '")? + "INTO OUTFILE '".len();
    let end = sql[start..].find('\'')? + start;
    Some(sql[start..end].to_string())
}

struct Fixture {
    _dir: tempfile::TempDir,
    tmp_dir: std::path::PathBuf,
    processor: Processor,
    log: Arc<std::sync::Mutex<Vec<String>>>,
}

fn fixture(script: common::Script, record_size: u64) -> Fixture {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let (connector, log, _users) = scripted_connector(script);
    let mut config = test_config(dir.path(), Technology::Test);
    config.worker.director_index_record_size = record_size;
    let ctx = EngineContext::new("worker-A", config, test_catalog(), connector);
    let processor = Processor::new(Arc::new(ctx)).expect("processor");
    processor.run().expect("run");
    let tmp_dir = dir.path().join("ingest").join("db1");
    Fixture { _dir: dir, tmp_dir, processor, log }
}

fn spec(offset: u64) -> DirectorIndexSpec {
    DirectorIndexSpec {
        database: "db1".to_string(),
        director_table: "Object".to_string(),
        chunk: 7,
        has_transactions: false,
        transaction_id: 0,
        offset,
    }
}

fn staged_files(tmp_dir: &std::path::Path) -> usize {
    match std::fs::read_dir(tmp_dir) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[test]
fn an_empty_partition_yields_an_empty_slice() {
    let fixture = fixture(outfile_script(b""), 1024);

    fixture.processor.index(QueuedRequestHdr::new("idx-empty", 0, 0), spec(0));
    let finished = wait_terminal(&fixture.processor, "idx-empty", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS", "{finished}");
    assert_eq!(finished["result"]["total_bytes"], 0);
    assert_eq!(finished["result"]["data"], "");
    // The staging file is removed before returning.
    assert_eq!(staged_files(&fixture.tmp_dir), 0);
    fixture.processor.shutdown();
}

#[test]
fn a_small_index_is_returned_whole() {
    let fixture = fixture(outfile_script(b"1\t7\t3\n2\t7\t5\n"), 1024);

    fixture.processor.index(QueuedRequestHdr::new("idx-whole", 0, 0), spec(0));
    let finished = wait_terminal(&fixture.processor, "idx-whole", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    assert_eq!(finished["result"]["total_bytes"], 12);

    let hex = finished["result"]["data"].as_str().expect("data");
    let decoded: Vec<u8> = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("hex"))
        .collect();
    assert_eq!(decoded, b"1\t7\t3\n2\t7\t5\n");
    assert_eq!(staged_files(&fixture.tmp_dir), 0);

    // The staging query injects the chunk number and orders by the key.
    let log = fixture.log.lock().expect("log");
    let outfile = log.iter().find(|sql| sql.contains("INTO OUTFILE")).expect("query");
    assert!(outfile.starts_with("SELECT `objectId`,7,`subChunkId` FROM `db1`.`Object_7`"));
    assert!(outfile.contains("ORDER BY `objectId`"));
    fixture.processor.shutdown();
}

#[test]
fn slices_are_capped_by_the_record_size() {
    let fixture = fixture(outfile_script(b"0123456789"), 4);

    // The staging file is keyed by the request id; follow-up slices reuse
    // the id after disposing the previous request.
    fixture.processor.index(QueuedRequestHdr::new("idx-sliced", 0, 0), spec(0));
    let finished = wait_terminal(&fixture.processor, "idx-sliced", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    assert_eq!(finished["result"]["total_bytes"], 10);
    assert_eq!(finished["result"]["data"], "30313233");
    // More to read: the staging file must survive.
    assert_eq!(staged_files(&fixture.tmp_dir), 1);
    dispose_soon(&fixture.processor, "idx-sliced");

    // An offset beyond the end is a caller error, and keeps the file.
    fixture.processor.index(QueuedRequestHdr::new("idx-sliced", 0, 0), spec(100));
    let finished = wait_terminal(&fixture.processor, "idx-sliced", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "FAILED");
    assert_eq!(status_ext_str(&finished), "INVALID_PARAM");
    assert_eq!(staged_files(&fixture.tmp_dir), 1);
    dispose_soon(&fixture.processor, "idx-sliced");

    // The middle slice.
    fixture.processor.index(QueuedRequestHdr::new("idx-sliced", 0, 0), spec(4));
    let finished = wait_terminal(&fixture.processor, "idx-sliced", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    assert_eq!(finished["result"]["data"], "34353637");
    assert_eq!(staged_files(&fixture.tmp_dir), 1);
    dispose_soon(&fixture.processor, "idx-sliced");

    // The final slice consumes the staging file.
    fixture.processor.index(QueuedRequestHdr::new("idx-sliced", 0, 0), spec(8));
    let finished = wait_terminal(&fixture.processor, "idx-sliced", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    assert_eq!(finished["result"]["data"], "3839");
    assert_eq!(staged_files(&fixture.tmp_dir), 0);

    fixture.processor.shutdown();
}

#[test]
fn partitioned_extraction_restricts_and_orders_by_transaction() {
    let fixture = fixture(outfile_script(b""), 1024);
    let mut with_transactions = spec(0);
    with_transactions.has_transactions = true;
    with_transactions.transaction_id = 12;

    fixture.processor.index(QueuedRequestHdr::new("idx-part", 0, 0), with_transactions);
    let finished = wait_terminal(&fixture.processor, "idx-part", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");

    let log = fixture.log.lock().expect("log");
    let outfile = log.iter().find(|sql| sql.contains("INTO OUTFILE")).expect("query");
    assert!(outfile.contains("PARTITION (`p12`)"), "{outfile}");
    assert!(outfile.contains("ORDER BY `qserv_trans_id`,`objectId`"), "{outfile}");
    assert!(outfile.starts_with("SELECT `qserv_trans_id`,`objectId`,7,`subChunkId`"));
    fixture.processor.shutdown();
}

#[test]
fn non_director_tables_are_invalid() {
    let fixture = fixture(outfile_script(b""), 1024);
    let mut bad = spec(0);
    bad.director_table = "Source".to_string();

    fixture.processor.index(QueuedRequestHdr::new("idx-nondir", 0, 0), bad);
    let finished = wait_terminal(&fixture.processor, "idx-nondir", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "FAILED");
    assert_eq!(status_ext_str(&finished), "INVALID_PARAM");
    fixture.processor.shutdown();
}

#[test]
fn server_errors_map_to_their_extended_codes() {
    let fixture = fixture(
        Arc::new(|sql: &str| {
            if sql.contains("INTO OUTFILE") {
                Reply::ServerError(1146, "Table 'db1.Object_7' doesn't exist".to_string())
            } else {
                Reply::Ok
            }
        }),
        1024,
    );

    fixture.processor.index(QueuedRequestHdr::new("idx-err", 0, 0), spec(0));
    let finished = wait_terminal(&fixture.processor, "idx-err", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "FAILED");
    assert_eq!(status_ext_str(&finished), "NO_SUCH_TABLE");
    fixture.processor.shutdown();
}
