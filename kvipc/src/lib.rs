//! Shared-memory IPC bridge between database backend processes and a
//! key-value storage worker.
//!
//! # Overview
//! The storage engine must not be linked into the many short-lived
//! backend processes of the database: its caches, threads and open
//! stores have to be shared across sessions and isolated from backend
//! crashes. Instead, one long-lived worker process per store hosts the
//! engine, and backends talk to it over a named shared-memory channel.
//!
//! Key components:
//! - [`channel::Channel`]: the shared-memory message channel. One
//!   request arena guarded by a writer/ready/drained semaphore triple,
//!   plus a small pool of response slots that clients lease per request.
//! - [`worker::KvWorker`]: the worker's dispatch loop, generic over the
//!   [`engine::Engine`] it hosts. Owns the engine handle, its reference
//!   count, and the scan cursors and range sessions of every client.
//! - [`worker::WorkerClient`]: the backend-side stub, including
//!   [`worker::ScanCursor`] and [`worker::RangeCursor`] which consume
//!   bulk results through per-cursor side segments.
//! - [`manager::Manager`]: the control process that launches, probes and
//!   reaps workers; [`manager::ManagerClient`] is its stub.
//! - [`posix`]: thin wrappers over named shared memory and
//!   process-shared semaphores, used by everything above.
//!
//! # Concurrency model
//! Everything is multi-process and single-threaded per process. The only
//! suspension points are semaphore waits; there are no in-process
//! thread pools and no timeouts on the request path. Requests from one
//! client are served in the order it sent them; requests from different
//! clients interleave arbitrarily. A client holds its response slot from
//! lease to release, so it always observes the reply to its own request
//! before it can issue the next one.

pub mod channel;
pub mod engine;
pub mod errors;
pub mod manager;
pub mod message;
pub mod posix;
pub mod worker;

pub use errors::{IpcError, Result};

#[cfg(test)]
pub(crate) mod tests;
