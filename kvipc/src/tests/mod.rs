mod contention_tests;
mod dispatch_tests;

pub(crate) mod support {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    use crate::channel::Channel;
    use crate::engine::{EngineOptions, MemEngine, StorageLayout};
    use crate::message::OpenArgs;
    use crate::worker::{KvWorker, WorkerClient};

    pub(crate) const TEST_DB_ID: u32 = 1;

    /// Channel ids unique across the tests of this process and across
    /// concurrently running test binaries sharing /dev/shm.
    pub(crate) fn unique_channel_id() -> u32 {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        let seq = NEXT.fetch_add(1, Ordering::SeqCst);
        (std::process::id() % 0x3FFF) * 0x10000 + seq
    }

    /// Run a `MemEngine` worker on a fresh channel and wait until it
    /// serves. Process-shared semaphores behave identically in-process,
    /// so a thread stands in for the worker process.
    pub(crate) fn start_worker(worker_id: u32) -> thread::JoinHandle<crate::Result<()>> {
        let _ = env_logger::builder().is_test(true).try_init();
        let channel = Channel::create(worker_id).unwrap();
        let handle = thread::spawn(move || {
            let shutdown = AtomicBool::new(false);
            KvWorker::<MemEngine>::new(worker_id, channel).run(&shutdown)
        });
        let probe = Channel::open(worker_id).unwrap();
        assert!(probe.wait_started(Duration::from_secs(5)).unwrap());
        handle
    }

    pub(crate) fn connect(worker_id: u32) -> WorkerClient {
        WorkerClient::connect(worker_id, TEST_DB_ID).unwrap()
    }

    pub(crate) fn open_args(tag: &str) -> OpenArgs {
        OpenArgs {
            opts: EngineOptions::default(),
            layout: StorageLayout::Row,
            path: format!("/data/{}", tag).into(),
        }
    }
}
