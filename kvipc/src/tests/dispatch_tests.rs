//! End-to-end scenarios driving a worker through its channel.

use std::time::Duration;

use crate::channel::Channel;
use crate::engine::{decode_batch, EngineOptions, RangeOptions, READ_BATCH_SIZE};
use crate::message::OpenArgs;
use crate::posix::ShmSegment;
use crate::tests::support::{connect, open_args, start_worker, unique_channel_id};
use crate::worker::{bulk_segment_name, RANGE_QUERY_PATH, READ_BATCH_PATH};
use crate::IpcError;

#[test]
fn crud_lifecycle() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    assert!(client.open(&open_args("t")).unwrap());
    assert!(client.put(b"a", b"1").unwrap());
    assert_eq!(client.count().unwrap(), 1);
    assert_eq!(client.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert!(client.delete(b"a").unwrap());
    assert_eq!(client.get(b"a").unwrap(), None);
    assert!(!client.delete(b"a").unwrap());
    assert_eq!(client.count().unwrap(), 0);
    assert!(client.close().unwrap());

    client.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn operations_before_open_fail_softly() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    assert!(!client.put(b"a", b"1").unwrap());
    assert_eq!(client.get(b"a").unwrap(), None);
    assert!(!client.delete(b"a").unwrap());
    assert!(matches!(client.count(), Err(IpcError::Engine(_))));

    client.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn open_failure_reports_failure_status() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    let args = OpenArgs {
        opts: EngineOptions {
            create_if_missing: false,
            ..EngineOptions::default()
        },
        ..open_args("t")
    };
    assert!(!client.open(&args).unwrap());

    // A later open with workable options still succeeds.
    assert!(client.open(&open_args("t")).unwrap());
    assert!(client.close().unwrap());

    client.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn reference_count_survives_shared_opens() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client_a = connect(worker_id);
    let client_b = connect(worker_id);

    assert!(client_a.open(&open_args("t")).unwrap());
    assert!(client_b.open(&open_args("t")).unwrap());
    assert!(client_a.put(b"shared", b"v").unwrap());

    assert!(client_b.close().unwrap());
    // A still sees the store through the same engine handle.
    assert_eq!(client_a.count().unwrap(), 1);
    assert!(client_a.close().unwrap());

    // The handle stays open across a zero reference count; it is only
    // closed when the worker terminates.
    assert_eq!(client_a.count().unwrap(), 1);

    client_a.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn load_is_applied_in_order() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    assert!(client.open(&open_args("t")).unwrap());
    client.load(b"a", b"1").unwrap();
    client.load(b"b", b"2").unwrap();
    client.load(b"c", b"3").unwrap();
    // Same client, so the count is ordered after every load.
    assert_eq!(client.count().unwrap(), 3);
    assert_eq!(client.get(b"b").unwrap(), Some(b"2".to_vec()));

    client.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn scan_spans_multiple_segments_and_unlinks_on_close() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    assert!(client.open(&open_args("t")).unwrap());
    let total = 10_000u32;
    for i in 0..total {
        let key = format!("key{:05}", i);
        let val = format!("val{:05}", i);
        client.load(key.as_bytes(), val.as_bytes()).unwrap();
    }
    assert_eq!(client.count().unwrap(), total as u64);

    let mut cursor = client.scan();
    let cursor_id = cursor.cursor_id();
    let mut batches = 0usize;
    let mut records = Vec::new();
    while let Some(batch) = cursor.next_batch().unwrap() {
        batches += 1;
        records.extend(decode_batch(batch).unwrap());
    }
    // Records of ~32 bytes against 80 KiB segments: several round trips.
    assert!(batches >= 3, "expected at least 3 segments, got {}", batches);
    assert_eq!(records.len(), total as usize);
    for (i, (key, val)) in records.iter().enumerate() {
        assert_eq!(key, format!("key{:05}", i).as_bytes());
        assert_eq!(val, format!("val{:05}", i).as_bytes());
    }
    // Exhausted scans stay exhausted.
    assert!(cursor.next_batch().unwrap().is_none());

    cursor.close().unwrap();
    let name = bulk_segment_name(READ_BATCH_PATH, std::process::id(), worker_id, cursor_id);
    assert!(
        ShmSegment::open(&name, READ_BATCH_SIZE).is_err(),
        "closing the cursor should unlink its segment"
    );

    client.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn closing_an_unused_cursor_is_fine() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    assert!(client.open(&open_args("t")).unwrap());
    // The worker never saw this cursor; closing it still succeeds.
    let mut cursor = client.scan();
    cursor.close().unwrap();
    cursor.close().unwrap();

    // And a fresh scan afterwards works.
    assert!(client.put(b"a", b"1").unwrap());
    let mut cursor = client.scan();
    let batch = cursor.next_batch().unwrap().unwrap();
    assert_eq!(decode_batch(batch).unwrap().len(), 1);
    cursor.close().unwrap();

    client.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn range_query_batches_until_exhausted() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    assert!(client.open(&open_args("t")).unwrap());
    for i in 1..=9u32 {
        let key = format!("k{}", i);
        let val = format!("{}", i);
        assert!(client.put(key.as_bytes(), val.as_bytes()).unwrap());
    }

    // Records are 19 bytes each; a 40 byte capacity forces two per batch.
    let mut range = client.range_query(RangeOptions {
        start: b"k1".to_vec(),
        limit: b"k5".to_vec(),
        batch_capacity: 40,
        attrs: Vec::new(),
    });
    let cursor_id = range.cursor_id();
    let mut batches = 0usize;
    let mut keys = Vec::new();
    while let Some(batch) = range.next_batch().unwrap() {
        batches += 1;
        for (key, _) in decode_batch(batch).unwrap() {
            keys.push(key);
        }
    }
    assert!(batches >= 2);
    assert_eq!(
        keys,
        vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec(), b"k4".to_vec()]
    );

    range.clear().unwrap();
    // Clearing is fire-and-forget; a response-carrying request from the
    // same client fences it.
    assert_eq!(client.count().unwrap(), 9);
    let name = bulk_segment_name(RANGE_QUERY_PATH, std::process::id(), worker_id, cursor_id);
    assert!(
        ShmSegment::open(&name, 1).is_err(),
        "clearing the session should unlink its segment"
    );

    client.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn empty_range_answers_no_data() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    assert!(client.open(&open_args("t")).unwrap());
    assert!(client.put(b"z", b"1").unwrap());

    let mut range = client.range_query(RangeOptions {
        start: b"a".to_vec(),
        limit: b"b".to_vec(),
        batch_capacity: 4096,
        attrs: Vec::new(),
    });
    assert!(range.next_batch().unwrap().is_none());
    assert!(range.next_batch().unwrap().is_none());
    range.clear().unwrap();

    client.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn oversized_put_fails_without_wedging_the_channel() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    assert!(client.open(&open_args("t")).unwrap());
    let huge = vec![0u8; crate::channel::ARENA_SIZE];
    match client.put(b"big", &huge) {
        Err(IpcError::BufferOverflow { .. }) => {}
        other => panic!("expected overflow, got {:?}", other),
    }

    // The writer mutex was released; the channel still serves.
    assert!(client.put(b"small", b"v").unwrap());
    assert_eq!(client.get(b"small").unwrap(), Some(b"v".to_vec()));

    client.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

#[test]
fn terminate_tears_the_channel_down() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    assert!(client.open(&open_args("t")).unwrap());
    client.terminate().unwrap();
    worker.join().unwrap().unwrap();

    // The segment name is gone once the worker exits.
    assert!(Channel::open(worker_id).is_err());

    // Give stragglers nothing to trip over.
    std::thread::sleep(Duration::from_millis(10));
}
