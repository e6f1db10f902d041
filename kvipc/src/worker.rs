//! The worker process loop and the client-side stub that talks to it.
//!
//! One worker owns one engine handle and serves every backend of its
//! database over a single channel. Scan cursors and range sessions live
//! here, keyed by `(client pid, cursor id)`: the native iterators behind
//! them cannot cross a process boundary, so only the key travels.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::channel::Channel;
use crate::engine::{BatchRead, Engine, RangeOptions, READ_BATCH_SIZE};
use crate::errors::{IpcError, Result};
use crate::message::{
    BatchState, CursorIdent, Entity, EntityReader, Header, Op, OpenArgs, PutArgs, Status,
};
use crate::posix::{self, ShmSegment};

pub const READ_BATCH_PATH: &str = "/KVReadBatch";
pub const RANGE_QUERY_PATH: &str = "/KVRangeQuery";

/// Deterministic name of the bulk segment for one cursor. Including the
/// client pid keeps concurrent backends apart; stale names from crashed
/// clients are unlinked on every create.
pub fn bulk_segment_name(prefix: &str, pid: u32, worker_id: u32, cursor_id: u64) -> String {
    format!("{}{}{}{}", prefix, pid, worker_id, cursor_id)
}

/// The dispatch loop of one worker process.
pub struct KvWorker<E: Engine> {
    worker_id: u32,
    channel: Channel,
    engine: Option<E>,
    ref_count: u32,
    cursors: HashMap<CursorIdent, E::Cursor>,
    ranges: HashMap<CursorIdent, E::Range>,
}

impl<E: Engine> KvWorker<E> {
    pub fn new(worker_id: u32, channel: Channel) -> KvWorker<E> {
        KvWorker {
            worker_id,
            channel,
            engine: None,
            ref_count: 0,
            cursors: HashMap::new(),
            ranges: HashMap::new(),
        }
    }

    /// Serve requests until a `Terminate` arrives or `shutdown` is set by
    /// a signal handler. Engine failures become `Failure` responses; IPC
    /// failures are fatal and bubble out for the launcher to observe.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        self.channel.notify_started()?;
        log::info!("worker {} serving on {}", self.worker_id, self.channel.name());

        loop {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("worker {} interrupted, shutting down", self.worker_id);
                break;
            }
            let (hdr, body) = match self.channel.recv_request() {
                Ok(request) => request,
                Err(IpcError::Interrupted) => continue,
                Err(IpcError::Protocol(msg)) => {
                    log::warn!("worker {} dropped a malformed request: {}", self.worker_id, msg);
                    continue;
                }
                Err(err) => return Err(err),
            };
            if !self.dispatch(hdr, &body)? {
                break;
            }
        }
        self.teardown();
        Ok(())
    }

    /// Returns `false` when the loop should stop.
    fn dispatch(&mut self, hdr: Header, body: &[u8]) -> Result<bool> {
        log::trace!("worker {} handling {:?}", self.worker_id, hdr.op);
        match hdr.op {
            Op::Dummy => {}
            Op::Open => self.handle_open(&hdr, body)?,
            Op::Close => self.handle_close(&hdr)?,
            Op::Count => self.handle_count(&hdr)?,
            Op::Put => self.handle_put(&hdr, body)?,
            Op::Get => self.handle_get(&hdr, body)?,
            Op::Del => self.handle_delete(&hdr, body)?,
            Op::Load => self.handle_load(body),
            Op::ReadBatch => self.handle_read_batch(&hdr, body)?,
            Op::DelCursor => self.handle_del_cursor(&hdr, body)?,
            Op::RangeQuery => self.handle_range_query(&hdr, body)?,
            Op::ClearRangeQuery => self.handle_clear_range_query(body),
            Op::Terminate => {
                log::info!("worker {} received terminate", self.worker_id);
                return Ok(false);
            }
            Op::Launch => {
                log::warn!("worker {} ignoring manager operation {:?}", self.worker_id, hdr.op);
            }
        }
        Ok(true)
    }

    fn respond(&self, rps_id: u32, status: Status, ety: &dyn Entity) -> Result<()> {
        let mut hdr = Header::response(status, rps_id);
        self.channel.send_response(rps_id, &mut hdr, ety)
    }

    /// Report a request body that did not decode. The requester is
    /// blocked on its slot, so it gets an `Exception` rather than
    /// nothing.
    fn reject(&self, rps_id: u32, err: &IpcError) -> Result<()> {
        log::warn!("worker {} rejecting request: {}", self.worker_id, err);
        self.respond(rps_id, Status::Exception, &())
    }

    fn handle_open(&mut self, hdr: &Header, body: &[u8]) -> Result<()> {
        let args = match OpenArgs::decode(&mut EntityReader::new(body)) {
            Ok(args) => args,
            Err(err) => return self.reject(hdr.rps_id, &err),
        };
        if self.engine.is_none() {
            match E::open(&args.path, &args.opts, args.layout) {
                Ok(engine) => self.engine = Some(engine),
                Err(err) => {
                    log::warn!("worker {} failed to open engine: {}", self.worker_id, err);
                    return self.respond(hdr.rps_id, Status::Failure, &());
                }
            }
        }
        self.ref_count += 1;
        log::debug!("worker {} opened, ref count {}", self.worker_id, self.ref_count);
        self.respond(hdr.rps_id, Status::Success, &())
    }

    fn handle_close(&mut self, hdr: &Header) -> Result<()> {
        if self.ref_count > 0 {
            self.ref_count -= 1;
        }
        // The engine handle stays open across zero references; it is only
        // closed when the worker terminates.
        log::debug!("worker {} closed, ref count {}", self.worker_id, self.ref_count);
        self.respond(hdr.rps_id, Status::Success, &())
    }

    fn handle_count(&self, hdr: &Header) -> Result<()> {
        match &self.engine {
            Some(engine) => self.respond(hdr.rps_id, Status::Success, &engine.count()),
            None => self.respond(hdr.rps_id, Status::Failure, &()),
        }
    }

    fn handle_put(&mut self, hdr: &Header, body: &[u8]) -> Result<()> {
        let (key, val) = match PutArgs::decode(&mut EntityReader::new(body)) {
            Ok(kv) => kv,
            Err(err) => return self.reject(hdr.rps_id, &err),
        };
        let status = match &mut self.engine {
            Some(engine) => {
                if engine.put(key, val) {
                    Status::Success
                } else {
                    Status::Failure
                }
            }
            None => Status::Failure,
        };
        self.respond(hdr.rps_id, status, &())
    }

    fn handle_get(&self, hdr: &Header, body: &[u8]) -> Result<()> {
        match self.engine.as_ref().and_then(|engine| engine.get(body)) {
            Some(val) => self.respond(hdr.rps_id, Status::Success, &val.as_slice()),
            None => self.respond(hdr.rps_id, Status::Failure, &()),
        }
    }

    fn handle_delete(&mut self, hdr: &Header, body: &[u8]) -> Result<()> {
        let status = match &mut self.engine {
            Some(engine) => {
                if engine.delete(body) {
                    Status::Success
                } else {
                    Status::Failure
                }
            }
            None => Status::Failure,
        };
        self.respond(hdr.rps_id, status, &())
    }

    /// Fire-and-forget put used by bulk loading; nothing to answer, so
    /// failures can only be logged.
    fn handle_load(&mut self, body: &[u8]) {
        let (key, val) = match PutArgs::decode(&mut EntityReader::new(body)) {
            Ok(kv) => kv,
            Err(err) => {
                log::warn!("worker {} dropped a malformed load: {}", self.worker_id, err);
                return;
            }
        };
        match &mut self.engine {
            Some(engine) => {
                if !engine.put(key, val) {
                    log::warn!("worker {} load rejected by engine", self.worker_id);
                }
            }
            None => log::warn!("worker {} load before open", self.worker_id),
        }
    }

    fn handle_read_batch(&mut self, hdr: &Header, body: &[u8]) -> Result<()> {
        let ident = match CursorIdent::decode(&mut EntityReader::new(body)) {
            Ok(ident) => ident,
            Err(err) => return self.reject(hdr.rps_id, &err),
        };
        let engine = match &self.engine {
            Some(engine) => engine,
            None => return self.respond(hdr.rps_id, Status::Failure, &()),
        };
        let cursor = self
            .cursors
            .entry(ident)
            .or_insert_with(|| engine.cursor());

        let name = bulk_segment_name(READ_BATCH_PATH, ident.pid, self.worker_id, ident.cursor_id);
        let mut segment = ShmSegment::create(&name, READ_BATCH_SIZE)?;
        let BatchRead { has_more, size } = engine.batch_read(cursor, segment.as_mut_slice());
        drop(segment);

        self.respond(
            hdr.rps_id,
            Status::Success,
            &BatchState {
                next: has_more,
                size,
            },
        )
    }

    fn handle_del_cursor(&mut self, hdr: &Header, body: &[u8]) -> Result<()> {
        let ident = match CursorIdent::decode(&mut EntityReader::new(body)) {
            Ok(ident) => ident,
            Err(err) => return self.reject(hdr.rps_id, &err),
        };
        // Closing an unknown cursor is fine; the client may never have
        // read a batch.
        self.cursors.remove(&ident);
        self.respond(hdr.rps_id, Status::Success, &())
    }

    fn handle_range_query(&mut self, hdr: &Header, body: &[u8]) -> Result<()> {
        let args = match crate::message::RangeArgs::decode(&mut EntityReader::new(body)) {
            Ok(args) => args,
            Err(err) => return self.reject(hdr.rps_id, &err),
        };
        let engine = match &self.engine {
            Some(engine) => engine,
            None => return self.respond(hdr.rps_id, Status::Failure, &()),
        };
        if args.opts.is_none() && !self.ranges.contains_key(&args.ident) {
            return self.reject(
                hdr.rps_id,
                &IpcError::protocol("range resume for an unknown session"),
            );
        }
        let range = match self.ranges.entry(args.ident) {
            Entry::Occupied(entry) => entry.into_mut(),
            // Options travel only on the first call; checked just above.
            Entry::Vacant(entry) => entry.insert(engine.range(args.opts.unwrap_or_default())),
        };

        // Skip empty batches so the client only wakes up for data or for
        // the end of the range.
        let (mut next, mut batch) = engine.range_read(range);
        while next && batch.is_empty() {
            (next, batch) = engine.range_read(range);
        }

        let name = bulk_segment_name(
            RANGE_QUERY_PATH,
            args.ident.pid,
            self.worker_id,
            args.ident.cursor_id,
        );
        let _ = posix::shm_unlink(&name);
        if !batch.is_empty() {
            let mut segment = ShmSegment::create(&name, batch.len())?;
            segment.as_mut_slice().copy_from_slice(&batch);
        }

        self.respond(
            hdr.rps_id,
            Status::Success,
            &BatchState {
                next,
                size: batch.len() as u64,
            },
        )
    }

    fn handle_clear_range_query(&mut self, body: &[u8]) {
        let ident = match CursorIdent::decode(&mut EntityReader::new(body)) {
            Ok(ident) => ident,
            Err(err) => {
                log::warn!("worker {} dropped a malformed clear: {}", self.worker_id, err);
                return;
            }
        };
        self.ranges.remove(&ident);
        let name = bulk_segment_name(RANGE_QUERY_PATH, ident.pid, self.worker_id, ident.cursor_id);
        let _ = posix::shm_unlink(&name);
    }

    /// Reclaim everything a client may have left behind, close the
    /// engine, and tear the channel down.
    fn teardown(&mut self) {
        for slot in self.channel.leaked_slots() {
            log::warn!("worker {} tearing down with slot {} still leased", self.worker_id, slot);
        }
        for (ident, _) in self.cursors.drain() {
            let name =
                bulk_segment_name(READ_BATCH_PATH, ident.pid, self.worker_id, ident.cursor_id);
            let _ = posix::shm_unlink(&name);
            log::debug!("worker {} reclaimed cursor {:?}", self.worker_id, ident);
        }
        for (ident, _) in self.ranges.drain() {
            let name =
                bulk_segment_name(RANGE_QUERY_PATH, ident.pid, self.worker_id, ident.cursor_id);
            let _ = posix::shm_unlink(&name);
            log::debug!("worker {} reclaimed range session {:?}", self.worker_id, ident);
        }
        if let Some(engine) = self.engine.take() {
            log::info!(
                "worker {} closing engine with ref count {}",
                self.worker_id,
                self.ref_count
            );
            drop(engine);
        }
        self.channel.destroy();
    }
}

static NEXT_CURSOR_ID: AtomicU64 = AtomicU64::new(1);

fn allocate_cursor_id() -> u64 {
    NEXT_CURSOR_ID.fetch_add(1, Ordering::Relaxed)
}

fn own_ident() -> CursorIdent {
    CursorIdent {
        pid: std::process::id(),
        cursor_id: allocate_cursor_id(),
    }
}

/// Backend-side stub for one worker.
pub struct WorkerClient {
    worker_id: u32,
    db_id: u32,
    channel: Channel,
}

impl WorkerClient {
    /// Attach to a running worker's channel.
    pub fn connect(worker_id: u32, db_id: u32) -> Result<WorkerClient> {
        Ok(WorkerClient {
            worker_id,
            db_id,
            channel: Channel::open(worker_id)?,
        })
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    fn request(&self, op: Op, ety: &dyn Entity) -> Result<(Header, Vec<u8>)> {
        let mut hdr = Header::request(op, self.worker_id, self.db_id);
        let slot = self.channel.send_request(&mut hdr, ety)?;
        let response = self.channel.recv(slot);
        self.channel.release_slot(slot)?;
        let (hdr, body) = response?;
        if hdr.status == Status::Exception {
            return Err(IpcError::protocol("worker reported an exception"));
        }
        Ok((hdr, body))
    }

    fn notify(&self, op: Op, ety: &dyn Entity) -> Result<()> {
        let mut hdr = Header::request(op, self.worker_id, self.db_id);
        self.channel.send(&mut hdr, ety)
    }

    /// Open the store (or take another reference to it).
    pub fn open(&self, args: &OpenArgs) -> Result<bool> {
        let (hdr, _) = self.request(Op::Open, args)?;
        Ok(hdr.status == Status::Success)
    }

    /// Drop one reference to the store.
    pub fn close(&self) -> Result<bool> {
        let (hdr, _) = self.request(Op::Close, &())?;
        Ok(hdr.status == Status::Success)
    }

    pub fn count(&self) -> Result<u64> {
        let (hdr, body) = self.request(Op::Count, &())?;
        if hdr.status != Status::Success {
            return Err(IpcError::Engine("count on a store that is not open".into()));
        }
        EntityReader::new(&body).pop_u64()
    }

    pub fn put(&self, key: &[u8], val: &[u8]) -> Result<bool> {
        let (hdr, _) = self.request(Op::Put, &PutArgs { key, val })?;
        Ok(hdr.status == Status::Success)
    }

    /// Bulk-load variant of `put`: no response, failures only show up in
    /// the worker log.
    pub fn load(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.notify(Op::Load, &PutArgs { key, val })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (hdr, body) = self.request(Op::Get, &key)?;
        Ok(match hdr.status {
            Status::Success => Some(body),
            _ => None,
        })
    }

    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let (hdr, _) = self.request(Op::Del, &key)?;
        Ok(hdr.status == Status::Success)
    }

    /// Ask the worker to stop. The worker tears its channel down, so this
    /// client is unusable afterwards.
    pub fn terminate(&self) -> Result<()> {
        self.notify(Op::Terminate, &())
    }

    /// Start a forward scan over the whole store.
    pub fn scan(&self) -> ScanCursor<'_> {
        ScanCursor {
            client: self,
            ident: own_ident(),
            segment: None,
            batch_len: 0,
            exhausted: false,
            closed: false,
        }
    }

    /// Start a range query session.
    pub fn range_query(&self, opts: RangeOptions) -> RangeCursor<'_> {
        RangeCursor {
            client: self,
            ident: own_ident(),
            opts: Some(opts),
            segment: None,
            batch_len: 0,
            exhausted: false,
            cleared: false,
        }
    }
}

/// A forward scan. Batches arrive through a fixed-size bulk segment the
/// worker refills on every call; the previous batch is unmapped when the
/// next one is requested.
pub struct ScanCursor<'a> {
    client: &'a WorkerClient,
    ident: CursorIdent,
    segment: Option<ShmSegment>,
    batch_len: usize,
    exhausted: bool,
    closed: bool,
}

impl ScanCursor<'_> {
    pub fn cursor_id(&self) -> u64 {
        self.ident.cursor_id
    }

    fn segment_name(&self) -> String {
        bulk_segment_name(
            READ_BATCH_PATH,
            self.ident.pid,
            self.client.worker_id,
            self.ident.cursor_id,
        )
    }

    /// Fetch the next batch of framed records, or `None` once the scan is
    /// exhausted. Decode with [`crate::engine::decode_batch`].
    pub fn next_batch(&mut self) -> Result<Option<&[u8]>> {
        if self.exhausted || self.closed {
            return Ok(None);
        }
        self.segment = None;

        let (hdr, body) = self.client.request(Op::ReadBatch, &self.ident)?;
        if hdr.status != Status::Success {
            return Err(IpcError::Engine("scan on a store that is not open".into()));
        }
        let state = BatchState::decode(&mut EntityReader::new(&body))?;
        if !state.next {
            self.exhausted = true;
        }
        if state.size == 0 {
            return Ok(None);
        }

        let segment = ShmSegment::open(&self.segment_name(), READ_BATCH_SIZE)?;
        self.batch_len = state.size as usize;
        self.segment = Some(segment);
        Ok(self
            .segment
            .as_ref()
            .map(|segment| &segment.as_slice()[..self.batch_len]))
    }

    /// Drop the worker-side cursor and unlink the bulk segment.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.segment = None;
        let _ = posix::shm_unlink(&self.segment_name());
        let (hdr, _) = self.client.request(Op::DelCursor, &self.ident)?;
        if hdr.status != Status::Success {
            return Err(IpcError::Engine("cursor close rejected".into()));
        }
        Ok(())
    }
}

impl Drop for ScanCursor<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("failed to close cursor {}: {}", self.ident.cursor_id, err);
        }
    }
}

/// A range query. Unlike a forward scan, every batch segment is sized to
/// the exact payload, and the worker owns the segment's name end to end.
pub struct RangeCursor<'a> {
    client: &'a WorkerClient,
    ident: CursorIdent,
    /// Sent with the first request only; the worker keeps the session.
    opts: Option<RangeOptions>,
    segment: Option<ShmSegment>,
    batch_len: usize,
    exhausted: bool,
    cleared: bool,
}

impl RangeCursor<'_> {
    pub fn cursor_id(&self) -> u64 {
        self.ident.cursor_id
    }

    fn segment_name(&self) -> String {
        bulk_segment_name(
            RANGE_QUERY_PATH,
            self.ident.pid,
            self.client.worker_id,
            self.ident.cursor_id,
        )
    }

    pub fn next_batch(&mut self) -> Result<Option<&[u8]>> {
        if self.exhausted || self.cleared {
            return Ok(None);
        }
        self.segment = None;

        let args = crate::message::RangeArgs {
            ident: self.ident,
            opts: self.opts.take(),
        };
        let (hdr, body) = self.client.request(Op::RangeQuery, &args)?;
        if hdr.status != Status::Success {
            return Err(IpcError::Engine(
                "range query on a store that is not open".into(),
            ));
        }
        let state = BatchState::decode(&mut EntityReader::new(&body))?;
        if !state.next {
            self.exhausted = true;
        }
        if state.size == 0 {
            return Ok(None);
        }

        let segment = ShmSegment::open(&self.segment_name(), state.size as usize)?;
        self.batch_len = state.size as usize;
        self.segment = Some(segment);
        Ok(self
            .segment
            .as_ref()
            .map(|segment| &segment.as_slice()[..self.batch_len]))
    }

    /// Drop the worker-side session. The worker unlinks the segment.
    pub fn clear(&mut self) -> Result<()> {
        if self.cleared {
            return Ok(());
        }
        self.cleared = true;
        self.segment = None;
        self.client.notify(
            Op::ClearRangeQuery,
            &crate::message::RangeArgs {
                ident: self.ident,
                opts: None,
            },
        )
    }
}

impl Drop for RangeCursor<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.clear() {
            log::warn!(
                "failed to clear range session {}: {}",
                self.ident.cursor_id,
                err
            );
        }
    }
}
