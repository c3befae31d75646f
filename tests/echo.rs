//! Scheduling and cancellation semantics, exercised through the echo
//! request.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use replica_worker::config::Technology;
use replica_worker::processor::Processor;
use replica_worker::proto::QueuedRequestHdr;
use replica_worker::request::payload::EchoSpec;

use common::{init_logging, null_connector, status_str, test_context, wait_terminal};

fn echo_processor(root: &std::path::Path) -> Processor {
    let ctx = Arc::new(test_context(root, Technology::Test, null_connector()));
    let processor = Processor::new(ctx).expect("processor");
    processor.run().expect("run");
    processor
}

#[test]
fn immediate_echo_succeeds_with_its_payload() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = echo_processor(dir.path());

    let response = processor.echo(
        QueuedRequestHdr::new("echo-1", 0, 0),
        EchoSpec { delay_ms: 0, data: "xyz".to_string() },
    );
    assert_eq!(status_str(&response), "CREATED");

    let finished = wait_terminal(&processor, "echo-1", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    assert_eq!(finished["result"]["data"], "xyz");

    let start = finished["performance"]["start_time"].as_u64().expect("start");
    let finish = finished["performance"]["finish_time"].as_u64().expect("finish");
    assert!(start > 0);
    assert!(start <= finish);

    processor.shutdown();
}

#[test]
fn delayed_echo_takes_at_least_its_delay() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = echo_processor(dir.path());

    let begin = Instant::now();
    processor.echo(
        QueuedRequestHdr::new("echo-delayed", 0, 0),
        EchoSpec { delay_ms: 250, data: "later".to_string() },
    );
    let finished = wait_terminal(&processor, "echo-delayed", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    assert!(begin.elapsed() >= Duration::from_millis(250));

    let start = finished["performance"]["start_time"].as_u64().expect("start");
    let finish = finished["performance"]["finish_time"].as_u64().expect("finish");
    // The delay shows up in the performance counters as well.
    assert!(finish - start >= 250_000);

    processor.shutdown();
}

#[test]
fn cancelling_a_running_echo_terminates_it_quickly() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = echo_processor(dir.path());

    processor.echo(
        QueuedRequestHdr::new("echo-cancel", 0, 0),
        EchoSpec { delay_ms: 10_000, data: "never".to_string() },
    );
    // Let a worker thread pick it up.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let response = processor.track_request("echo-cancel");
        if status_str(&response) == "IN_PROGRESS" {
            break;
        }
        assert!(Instant::now() < deadline, "never started: {response}");
        std::thread::sleep(Duration::from_millis(5));
    }

    let begin = Instant::now();
    let stopping = processor.stop_request("echo-cancel");
    assert!(matches!(status_str(&stopping), "IS_CANCELLING" | "CANCELLED"));

    let finished = wait_terminal(&processor, "echo-cancel", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "CANCELLED");
    assert!(begin.elapsed() <= Duration::from_secs(1));

    processor.shutdown();
}

#[test]
fn cancelling_a_queued_echo_finalizes_it_immediately() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(test_context(dir.path(), Technology::Test, null_connector()));
    let processor = Processor::new(ctx).expect("processor");
    // The service is suspended: the request stays in the input queue.
    processor.echo(
        QueuedRequestHdr::new("echo-queued", 0, 0),
        EchoSpec { delay_ms: 0, data: "still queued".to_string() },
    );
    assert_eq!(processor.num_new_requests(), 1);

    let stopped = processor.stop_request("echo-queued");
    assert_eq!(status_str(&stopped), "CANCELLED");
    assert_eq!(processor.num_new_requests(), 0);
    assert_eq!(processor.num_finished_requests(), 1);
}
