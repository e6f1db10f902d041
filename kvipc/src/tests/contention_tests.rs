//! Many clients against one worker: slot leasing and request/response
//! matching under contention.

use std::thread;

use crate::tests::support::{connect, open_args, start_worker, unique_channel_id};

/// Two clients hammer the four-slot response pool with reads. Every
/// client must get back exactly the value its own request named.
#[test]
fn concurrent_reads_stay_matched() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);

    let seeder = connect(worker_id);
    assert!(seeder.open(&open_args("t")).unwrap());
    for i in 0..64u32 {
        let key = format!("seed{:02}", i);
        let val = format!("payload-{:02}", i);
        assert!(seeder.put(key.as_bytes(), val.as_bytes()).unwrap());
    }

    let mut clients = Vec::new();
    for _ in 0..2 {
        clients.push(thread::spawn(move || {
            let client = connect(worker_id);
            for round in 0..1_000u32 {
                let i = round % 64;
                let key = format!("seed{:02}", i);
                let expected = format!("payload-{:02}", i);
                let got = client.get(key.as_bytes()).unwrap();
                assert_eq!(got, Some(expected.into_bytes()));
            }
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    seeder.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

/// Writers interleave with readers; each client observes its own writes
/// because nobody else touches its keys.
#[test]
fn private_keys_roundtrip_under_interleaving() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);

    let opener = connect(worker_id);
    assert!(opener.open(&open_args("t")).unwrap());

    let mut clients = Vec::new();
    for t in 0..4u32 {
        clients.push(thread::spawn(move || {
            let client = connect(worker_id);
            for i in 0..250u32 {
                let key = format!("c{}-{:03}", t, i);
                let val = format!("v{}-{:03}", t, i);
                assert!(client.put(key.as_bytes(), val.as_bytes()).unwrap());
                assert_eq!(
                    client.get(key.as_bytes()).unwrap(),
                    Some(val.clone().into_bytes())
                );
            }
        }));
    }
    for client in clients {
        client.join().unwrap();
    }

    assert_eq!(opener.count().unwrap(), 4 * 250);
    opener.terminate().unwrap();
    worker.join().unwrap().unwrap();
}

/// Concurrent scans keep separate worker-side cursors: interleaved batch
/// requests from two cursors never bleed into each other.
#[test]
fn interleaved_scans_resume_independently() {
    let worker_id = unique_channel_id();
    let worker = start_worker(worker_id);
    let client = connect(worker_id);

    assert!(client.open(&open_args("t")).unwrap());
    let total = 4_000u32;
    for i in 0..total {
        let key = format!("key{:04}", i);
        client.load(key.as_bytes(), b"x").unwrap();
    }
    assert_eq!(client.count().unwrap(), total as u64);

    let mut first = client.scan();
    let mut second = client.scan();
    let mut seen_first = Vec::new();
    let mut seen_second = Vec::new();
    loop {
        let mut progressed = false;
        if let Some(batch) = first.next_batch().unwrap() {
            seen_first.extend(crate::engine::decode_batch(batch).unwrap());
            progressed = true;
        }
        if let Some(batch) = second.next_batch().unwrap() {
            seen_second.extend(crate::engine::decode_batch(batch).unwrap());
            progressed = true;
        }
        if !progressed {
            break;
        }
    }
    assert_eq!(seen_first.len(), total as usize);
    assert_eq!(seen_first, seen_second);

    first.close().unwrap();
    second.close().unwrap();
    client.terminate().unwrap();
    worker.join().unwrap().unwrap();
}
