//! Service-level semantics: queue exclusivity, the service state machine,
//! the uniform status/track/stop/dispose surface.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use replica_worker::config::Technology;
use replica_worker::processor::Processor;
use replica_worker::proto::{QueuedRequestHdr, ServiceState};
use replica_worker::request::payload::EchoSpec;

use common::{init_logging, null_connector, status_ext_str, status_str, test_context, wait_terminal};

fn suspended_processor(root: &std::path::Path) -> Processor {
    let ctx = Arc::new(test_context(root, Technology::Test, null_connector()));
    Processor::new(ctx).expect("processor")
}

fn echo(delay_ms: u64) -> EchoSpec {
    EchoSpec { delay_ms, data: "payload".to_string() }
}

#[test]
fn service_state_machine() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = suspended_processor(dir.path());
    assert_eq!(processor.state(), ServiceState::Suspended);

    processor.run().expect("run");
    assert_eq!(processor.state(), ServiceState::Running);
    // run is idempotent while running
    processor.run().expect("run again");
    assert_eq!(processor.state(), ServiceState::Running);

    processor.shutdown();
    assert_eq!(processor.state(), ServiceState::Suspended);

    // The pool can be restarted after a full suspension.
    processor.run().expect("run after stop");
    assert_eq!(processor.state(), ServiceState::Running);
    processor.shutdown();
}

#[test]
fn unknown_ids_are_rejected_as_bad() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = suspended_processor(dir.path());

    for response in [
        processor.request_status("ghost"),
        processor.track_request("ghost"),
        processor.stop_request("ghost"),
    ] {
        assert_eq!(status_str(&response), "BAD");
        assert_eq!(status_ext_str(&response), "INVALID_ID");
    }
    assert!(!processor.dispose_request("ghost"));
}

#[test]
fn duplicate_ids_are_rejected_without_enqueueing() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = suspended_processor(dir.path());

    let first = processor.echo(QueuedRequestHdr::new("dup", 0, 0), echo(0));
    assert_eq!(status_str(&first), "CREATED");
    let second = processor.echo(QueuedRequestHdr::new("dup", 0, 0), echo(0));
    assert_eq!(status_str(&second), "BAD");
    assert_eq!(status_ext_str(&second), "INVALID_PARAM");
    assert_eq!(processor.num_new_requests(), 1);
}

#[test]
fn a_request_is_in_exactly_one_queue() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = suspended_processor(dir.path());

    processor.echo(QueuedRequestHdr::new("excl", 0, 0), echo(200));
    assert_eq!(
        (
            processor.num_new_requests(),
            processor.num_in_progress_requests(),
            processor.num_finished_requests()
        ),
        (1, 0, 0)
    );

    processor.run().expect("run");
    let finished = wait_terminal(&processor, "excl", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    // The move into the finished map may lag the terminal status briefly.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while processor.num_finished_requests() != 1 {
        assert!(std::time::Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        (
            processor.num_new_requests(),
            processor.num_in_progress_requests(),
            processor.num_finished_requests()
        ),
        (0, 0, 1)
    );

    assert!(processor.dispose_request("excl"));
    assert_eq!(processor.num_finished_requests(), 0);
    // Disposal makes the id unknown everywhere.
    assert_eq!(status_str(&processor.track_request("excl")), "BAD");
    processor.shutdown();
}

#[test]
fn terminal_statuses_are_monotonic() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = suspended_processor(dir.path());
    processor.run().expect("run");

    processor.echo(QueuedRequestHdr::new("mono", 0, 0), echo(0));
    let finished = wait_terminal(&processor, "mono", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");

    // Stopping a finished request only reports its terminal status.
    let stopped = processor.stop_request("mono");
    assert_eq!(status_str(&stopped), "SUCCESS");
    let tracked = processor.track_request("mono");
    assert_eq!(status_str(&tracked), "SUCCESS");
    processor.shutdown();
}

#[test]
fn priority_biases_scheduling() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = suspended_processor(dir.path());

    // Enqueue while suspended so priorities decide the full order.
    for (id, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
        processor.echo(QueuedRequestHdr::new(id, priority, 0), echo(0));
    }
    processor.run().expect("run");
    let mut finish_times = Vec::new();
    for id in ["low", "high", "mid"] {
        let finished = wait_terminal(&processor, id, Duration::from_secs(5));
        finish_times.push((
            id,
            finished["performance"]["start_time"].as_u64().expect("start"),
        ));
    }
    processor.shutdown();

    let start_of = |name: &str| {
        finish_times
            .iter()
            .find(|(id, _)| *id == name)
            .map(|(_, t)| *t)
            .expect("request")
    };
    // With two worker threads the two top-priority requests go first.
    assert!(start_of("high") <= start_of("low"));
    assert!(start_of("mid") <= start_of("low"));
}

#[test]
fn drain_cancels_everything() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = suspended_processor(dir.path());
    processor.run().expect("run");

    processor.echo(QueuedRequestHdr::new("drain-1", 0, 0), echo(10_000));
    processor.echo(QueuedRequestHdr::new("drain-2", 0, 0), echo(10_000));
    processor.echo(QueuedRequestHdr::new("drain-3", 0, 0), echo(10_000));
    // Give the two worker threads time to pick two of them up.
    std::thread::sleep(Duration::from_millis(100));

    processor.drain();
    for id in ["drain-1", "drain-2", "drain-3"] {
        let finished = wait_terminal(&processor, id, Duration::from_secs(5));
        assert_eq!(status_str(&finished), "CANCELLED", "{id}");
    }
    processor.shutdown();
}

#[test]
fn snapshot_reports_counters_and_requests() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = suspended_processor(dir.path());
    processor.echo(QueuedRequestHdr::new("snap", 3, 0), echo(0));

    let snapshot = processor.to_json(true);
    assert_eq!(snapshot["service_state_str"], "SUSPENDED");
    assert_eq!(snapshot["num_new_requests"], 1);
    assert_eq!(snapshot["technology"], "TEST");
    assert_eq!(snapshot["new_requests"][0]["id"], "snap");
    assert_eq!(snapshot["new_requests"][0]["priority"], 3);
}

#[test]
fn expired_requests_are_garbage_collected() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let processor = suspended_processor(dir.path());
    processor.run().expect("run");

    // A one-second expiration: long enough to finish, short enough to
    // observe the collection.
    processor.echo(QueuedRequestHdr::new("gc", 0, 1), echo(0));
    let finished = wait_terminal(&processor, "gc", Duration::from_secs(5));
    assert_eq!(status_str(&finished), "SUCCESS");
    assert_eq!(processor.num_finished_requests(), 1);

    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(processor.num_finished_requests(), 0);
    processor.shutdown();
}
