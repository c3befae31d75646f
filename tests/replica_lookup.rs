//! Replica lookup (single chunk and whole database) and deletion.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use replica_worker::catalog::DatabaseInfo;
use replica_worker::config::Technology;
use replica_worker::fsname;
use replica_worker::processor::Processor;
use replica_worker::proto::QueuedRequestHdr;
use replica_worker::request::payload::{DeleteReplicaSpec, FindAllReplicasSpec, FindReplicaSpec};

use common::{init_logging, null_connector, status_ext_str, status_str, test_catalog, test_context, wait_terminal};

fn database() -> DatabaseInfo {
    test_catalog().remove(0)
}

struct Fixture {
    _dir: tempfile::TempDir,
    data_dir: std::path::PathBuf,
    processor: Processor,
}

fn fixture() -> Fixture {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(dir.path(), Technology::Test, null_connector());
    let data_dir = dir.path().join("data").join("db1");
    fs::create_dir_all(&data_dir).expect("data dir");
    let processor = Processor::new(Arc::new(ctx)).expect("processor");
    processor.run().expect("run");
    Fixture { _dir: dir, data_dir, processor }
}

fn populate_chunk(data_dir: &Path, chunk: u32) -> usize {
    let files = fsname::partitioned_files(&database(), chunk);
    for (i, name) in files.iter().enumerate() {
        fs::write(data_dir.join(name), vec![7_u8; i * 10]).expect("file");
    }
    files.len()
}

#[test]
fn find_grades_a_complete_replica() {
    let fixture = fixture();
    let num_files = populate_chunk(&fixture.data_dir, 11);

    fixture.processor.find_replica(
        QueuedRequestHdr::new("find-11", 0, 0),
        FindReplicaSpec { database: "db1".to_string(), chunk: 11, compute_cs: false },
    );
    let finished = wait_terminal(&fixture.processor, "find-11", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    let info = &finished["result"]["replica_info"];
    assert_eq!(info["status"], "COMPLETE");
    assert_eq!(info["files"].as_array().expect("files").len(), num_files);
    fixture.processor.shutdown();
}

#[test]
fn find_with_checksums_reports_the_byte_sums() {
    let fixture = fixture();
    populate_chunk(&fixture.data_dir, 4);

    fixture.processor.find_replica(
        QueuedRequestHdr::new("find-cs", 0, 0),
        FindReplicaSpec { database: "db1".to_string(), chunk: 4, compute_cs: true },
    );
    let finished = wait_terminal(&fixture.processor, "find-cs", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    let info = &finished["result"]["replica_info"];
    assert_eq!(info["status"], "COMPLETE");
    for file in info["files"].as_array().expect("files") {
        let size = file["size"].as_u64().expect("size");
        // Every populated byte is 7.
        assert_eq!(file["cs"], (size * 7).to_string());
    }
    fixture.processor.shutdown();
}

#[test]
fn find_reports_missing_and_partial_replicas() {
    let fixture = fixture();

    // Nothing on disk at all.
    fixture.processor.find_replica(
        QueuedRequestHdr::new("find-none", 0, 0),
        FindReplicaSpec { database: "db1".to_string(), chunk: 1, compute_cs: false },
    );
    let finished = wait_terminal(&fixture.processor, "find-none", Duration::from_secs(5));
    assert_eq!(finished["result"]["replica_info"]["status"], "NOT_FOUND");

    // A single file of the chunk.
    let name = fsname::partitioned_files(&database(), 2).remove(0);
    fs::write(fixture.data_dir.join(name), b"x").expect("file");
    fixture.processor.find_replica(
        QueuedRequestHdr::new("find-partial", 0, 0),
        FindReplicaSpec { database: "db1".to_string(), chunk: 2, compute_cs: false },
    );
    let finished = wait_terminal(&fixture.processor, "find-partial", Duration::from_secs(5));
    assert_eq!(finished["result"]["replica_info"]["status"], "INCOMPLETE");
    fixture.processor.shutdown();
}

#[test]
fn find_all_groups_by_chunk_and_skips_temporaries() {
    let fixture = fixture();
    populate_chunk(&fixture.data_dir, 10);
    populate_chunk(&fixture.data_dir, 20);
    // An incomplete chunk and noise that scans must ignore.
    let partial = fsname::partitioned_files(&database(), 30).remove(0);
    fs::write(fixture.data_dir.join(partial), b"z").expect("partial");
    fs::write(fixture.data_dir.join("_Object_10.MYD"), b"tmp").expect("temp");
    fs::write(fixture.data_dir.join("README"), b"noise").expect("noise");

    fixture.processor.find_all_replicas(
        QueuedRequestHdr::new("find-all", 0, 0),
        FindAllReplicasSpec { database: "db1".to_string() },
    );
    let finished = wait_terminal(&fixture.processor, "find-all", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");

    let replicas = finished["result"]["replica_info_many"].as_array().expect("replicas");
    assert_eq!(replicas.len(), 3);
    let status_of = |chunk: u64| {
        replicas
            .iter()
            .find(|r| r["chunk"] == chunk)
            .map(|r| r["status"].as_str().expect("status").to_string())
            .expect("replica")
    };
    assert_eq!(status_of(10), "COMPLETE");
    assert_eq!(status_of(20), "COMPLETE");
    assert_eq!(status_of(30), "INCOMPLETE");
    fixture.processor.shutdown();
}

#[test]
fn delete_removes_the_chunk_files() {
    let fixture = fixture();
    populate_chunk(&fixture.data_dir, 15);
    populate_chunk(&fixture.data_dir, 16);

    fixture.processor.delete_replica(
        QueuedRequestHdr::new("delete-15", 0, 0),
        DeleteReplicaSpec { database: "db1".to_string(), chunk: 15 },
    );
    let finished = wait_terminal(&fixture.processor, "delete-15", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    assert_eq!(finished["result"]["replica_info"]["status"], "NOT_FOUND");

    // Chunk 15 is gone, chunk 16 untouched.
    for name in fsname::partitioned_files(&database(), 15) {
        assert!(!fixture.data_dir.join(name).exists());
    }
    for name in fsname::partitioned_files(&database(), 16) {
        assert!(fixture.data_dir.join(name).exists());
    }

    // Deleting a chunk that has no files is still a success.
    fixture.processor.delete_replica(
        QueuedRequestHdr::new("delete-15-again", 0, 0),
        DeleteReplicaSpec { database: "db1".to_string(), chunk: 15 },
    );
    let finished = wait_terminal(&fixture.processor, "delete-15-again", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    fixture.processor.shutdown();
}

#[test]
fn unknown_databases_are_rejected_at_submission() {
    let fixture = fixture();
    let response = fixture.processor.find_replica(
        QueuedRequestHdr::new("find-unknown", 0, 0),
        FindReplicaSpec { database: "nope".to_string(), chunk: 0, compute_cs: false },
    );
    assert_eq!(status_str(&response), "BAD");
    assert_eq!(status_ext_str(&response), "INVALID_PARAM");
    fixture.processor.shutdown();
}
