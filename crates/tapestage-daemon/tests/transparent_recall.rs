//! End-to-end transparent recall scenarios.
//!
//! Each test drives the full server (receiver, writer pool, scheduler,
//! executor) over the mock connector, filesystem, and inventory from
//! `common`, and checks the externally observable contract: exactly one
//! response per accepted event, correct final file states, and empty
//! queues afterwards.

mod common;

use std::time::Duration;

use tapestage_core::types::{FileState, FileUid};

use common::{Harness, MockNode, wait_until};

const TAPE_A: &str = "T00001";
const TAPE_B: &str = "T00002";

fn uid(inum: u64) -> FileUid {
    FileUid::new(1, 1, 1, inum)
}

async fn responses_of(harness: &Harness, count: usize) -> Vec<(FileUid, bool)> {
    tokio::time::timeout(
        Duration::from_secs(10),
        harness.connector.wait_responses(count),
    )
    .await
    .expect("responses not delivered in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_migrated_file_recalls_to_resident() {
    let harness = Harness::start(2);
    let file = uid(42);
    let content = vec![0xABu8; 4096];

    harness.fs.add(file, MockNode::migrated(4096, TAPE_A));
    harness.inventory.stage(TAPE_A, file, &content, 100);

    harness.connector.send_recall(file, true).await;

    let responses = responses_of(&harness, 1).await;
    assert_eq!(responses, vec![(file, true)]);

    let node = harness.fs.node(&file).unwrap();
    assert_eq!(node.state, FileState::Resident);
    assert!(node.attrs_removed, "resident file keeps no migration attrs");
    assert_eq!(node.written, content);

    // Round trip leaves no queue state behind.
    wait_until(|| harness.job_count() == 0 && harness.request_count() == 0).await;

    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_tape_events_coalesce_and_follow_start_blocks() {
    let harness = Harness::start(2);
    let late_on_tape = uid(42); // start block 200
    let early_on_tape = uid(43); // start block 50

    harness
        .fs
        .add(late_on_tape, MockNode::migrated(2048, TAPE_A));
    harness
        .fs
        .add(early_on_tape, MockNode::migrated(2048, TAPE_A));
    harness
        .inventory
        .stage(TAPE_A, late_on_tape, &[1u8; 2048], 200);
    harness
        .inventory
        .stage(TAPE_A, early_on_tape, &[2u8; 2048], 50);

    // Keep the drive busy until both events landed in the store, so a
    // single execution serves both jobs.
    harness.inventory.hold(TAPE_A);

    harness.connector.send_recall(late_on_tape, true).await;
    harness.connector.send_recall(early_on_tape, true).await;

    wait_until(|| harness.job_count() == 2 && harness.request_count() == 1).await;
    assert_eq!(
        harness.request_count(),
        1,
        "events on one tape coalesce into one request"
    );

    harness.inventory.unhold(TAPE_A);
    harness.handle.notify_resources_changed();

    let responses = responses_of(&harness, 2).await;
    assert!(responses.iter().all(|(_, success)| *success));

    assert_eq!(
        harness.fs.finish_order(),
        vec![early_on_tape, late_on_tape],
        "files are recalled in ascending start-block order"
    );

    wait_until(|| harness.job_count() == 0 && harness.request_count() == 0).await;

    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn different_tapes_get_independent_requests() {
    let harness = Harness::start(2);
    let on_tape_a = uid(42);
    let on_tape_b = uid(99);

    harness.fs.add(on_tape_a, MockNode::migrated(1024, TAPE_A));
    harness.fs.add(on_tape_b, MockNode::migrated(1024, TAPE_B));
    harness.inventory.stage(TAPE_A, on_tape_a, &[1u8; 1024], 10);
    harness.inventory.stage(TAPE_B, on_tape_b, &[2u8; 1024], 20);

    harness.connector.send_recall(on_tape_a, true).await;
    harness.connector.send_recall(on_tape_b, true).await;

    let responses = responses_of(&harness, 2).await;
    assert!(responses.iter().all(|(_, success)| *success));

    let mut reserved = harness.inventory.reservation_log();
    reserved.sort();
    assert_eq!(
        reserved,
        vec![TAPE_A.to_string(), TAPE_B.to_string()],
        "each tape is scheduled independently"
    );

    wait_until(|| harness.job_count() == 0 && harness.request_count() == 0).await;

    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn already_resident_file_succeeds_without_a_job() {
    let harness = Harness::start(2);
    let file = uid(7);

    harness.fs.add(file, MockNode::resident(512));

    harness.connector.send_recall(file, true).await;

    let responses = responses_of(&harness, 1).await;
    assert_eq!(responses, vec![(file, true)]);

    let node = harness.fs.node(&file).unwrap();
    assert_eq!(
        node.finished,
        vec![FileState::Resident],
        "resident fast path still finalises the file"
    );

    assert_eq!(harness.job_count(), 0, "no job row for a resident file");
    assert_eq!(harness.request_count(), 0);
    assert!(
        harness.inventory.reservation_log().is_empty(),
        "no tape was touched"
    );

    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tape_size_wins_on_mismatch_and_forces_resident() {
    let harness = Harness::start(2);
    let file = uid(42);
    let tape_content = vec![0x5Au8; 8192];

    // File claims 10000 bytes, the tape object holds 8192.
    harness.fs.add(file, MockNode::migrated(10_000, TAPE_A));
    harness.inventory.stage(TAPE_A, file, &tape_content, 100);

    // The event only asks for premigrated.
    harness.connector.send_recall(file, false).await;

    let responses = responses_of(&harness, 1).await;
    assert_eq!(responses, vec![(file, true)]);

    let node = harness.fs.node(&file).unwrap();
    assert_eq!(
        node.state,
        FileState::Resident,
        "mismatched sizes force the file resident"
    );
    assert!(node.attrs_removed);
    assert_eq!(node.written, tape_content, "the tape size is trusted");

    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_byte_file_recalls_without_reading_tape() {
    let harness = Harness::start(2);
    let file = uid(13);

    harness.fs.add(file, MockNode::migrated(0, TAPE_A));
    harness.inventory.stage(TAPE_A, file, &[], 5);

    harness.connector.send_recall(file, true).await;

    let responses = responses_of(&harness, 1).await;
    assert_eq!(responses, vec![(file, true)]);

    let node = harness.fs.node(&file).unwrap();
    assert_eq!(node.state, FileState::Resident);
    assert!(node.written.is_empty());

    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn premigrated_recall_needs_no_copy() {
    let harness = Harness::start(2);
    let file = uid(21);

    harness.fs.add(file, MockNode::premigrated(2048, TAPE_A));
    harness.inventory.add_tape(TAPE_A);

    harness.connector.send_recall(file, true).await;

    let responses = responses_of(&harness, 1).await;
    assert_eq!(responses, vec![(file, true)]);

    let node = harness.fs.node(&file).unwrap();
    assert_eq!(node.state, FileState::Resident);
    assert!(node.attrs_removed);
    assert!(node.written.is_empty(), "data was already on disk");

    harness.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_events_are_dropped_without_response() {
    let harness = Harness::start(2);
    let file = uid(42);

    harness.fs.add(file, MockNode::resident(64));

    harness.connector.send_malformed().await;
    harness.connector.send_recall(file, true).await;

    // Only the valid event is answered.
    let responses = responses_of(&harness, 1).await;
    assert_eq!(responses, vec![(file, true)]);

    let connector = harness.connector.clone();
    harness.finish().await;

    // No further responses appeared during shutdown cleanup.
    assert_eq!(connector.responses().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forced_shutdown_fails_current_job_and_skips_the_rest() {
    let mut harness = Harness::start(2);
    let streaming = uid(42); // start block 50, several chunks long
    let waiting = uid(43); // start block 200, never started

    harness.fs.add(streaming, MockNode::migrated(4096, TAPE_A));
    harness.fs.add(waiting, MockNode::premigrated(1024, TAPE_A));
    harness
        .inventory
        .stage(TAPE_A, streaming, &[7u8; 4096], 50);
    harness
        .inventory
        .stage(TAPE_A, waiting, &[8u8; 1024], 200);

    // Force the shutdown from inside the first chunk written for the
    // streaming file.
    let force = harness.handle.clone();
    harness.fs.set_write_hook(Box::new(move |uid, _offset| {
        if uid.inum == 42 {
            force.request_forced_shutdown();
        }
    }));

    // Hold the tape until both jobs exist so one execution claims both.
    harness.inventory.hold(TAPE_A);
    harness.connector.send_recall(streaming, true).await;
    harness.connector.send_recall(waiting, true).await;
    wait_until(|| harness.job_count() == 2).await;
    harness.inventory.unhold(TAPE_A);
    harness.handle.notify_resources_changed();

    // The streaming job fails; the waiting one is not started.
    let responses = responses_of(&harness, 1).await;
    assert_eq!(responses, vec![(streaming, false)]);

    // Shutdown cleanup answers the job the executor never reached.
    harness.handle.shutdown().await;
    let responses = responses_of(&harness, 2).await;
    assert_eq!(responses[1], (waiting, false));

    tokio::time::timeout(Duration::from_secs(10), &mut harness.server)
        .await
        .expect("server shutdown timed out")
        .expect("server task panicked")
        .expect("server returned an error");

    // The waiting file was never touched.
    let node = harness.fs.node(&waiting).unwrap();
    assert_eq!(node.state, FileState::Premigrated);
    assert!(node.finished.is_empty());

    // Queues were cleared by cleanup.
    assert_eq!(harness.job_count(), 0);
    assert_eq!(harness.request_count(), 0);
}
