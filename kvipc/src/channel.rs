//! The shared-memory message channel between one worker and its clients.
//!
//! One named segment carries a single request arena plus a small pool of
//! response slots. Three semaphores guard the arena:
//!
//! ```text
//! client: wait(writer) ; wait(drained) ; write arena ; post(ready) ; post(writer)
//! worker: wait(ready)  ; copy arena   ; post(drained) ; dispatch ...
//! ```
//!
//! `writer` serializes clients against each other, `ready` wakes the
//! worker, and `drained` keeps a second writer from clobbering the arena
//! before the worker has copied it out.
//!
//! Each response slot has its own semaphore pair: `slot_free` is held by
//! the leasing client from lease to release, `slot_ready` signals that the
//! worker has filled the slot. Leasing happens while the client still
//! holds the writer mutex, so the request header can carry the slot id
//! and every concurrent writer sees the slot busy.

use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::errors::{IpcError, Result};
use crate::message::{Entity, EntityWriter, Header, MSG_HEADER_SIZE};
use crate::posix;

/// Number of response slots per channel.
pub const RESPONSE_SLOT_COUNT: usize = 4;

/// Capacity of the request arena, header included.
pub const ARENA_SIZE: usize = 64 * 1024;

/// Capacity of one response slot, header included.
pub const SLOT_SIZE: usize = 64 * 1024;

const CHANNEL_PATH: &str = "/KVChannel";

#[repr(C)]
struct ChannelShm {
    writer: libc::sem_t,
    ready: libc::sem_t,
    drained: libc::sem_t,
    /// Posted once by the worker after setup; the launcher waits on it.
    started: libc::sem_t,
    slot_free: [libc::sem_t; RESPONSE_SLOT_COUNT],
    slot_ready: [libc::sem_t; RESPONSE_SLOT_COUNT],
    leased: [AtomicU8; RESPONSE_SLOT_COUNT],
    arena: [u8; ARENA_SIZE],
    slots: [[u8; SLOT_SIZE]; RESPONSE_SLOT_COUNT],
}

const CHANNEL_SHM_SIZE: usize = std::mem::size_of::<ChannelShm>();

fn channel_name(id: u32) -> String {
    format!("{}{}", CHANNEL_PATH, id)
}

/// One endpoint of a worker channel.
///
/// Creating initializes the semaphores; opening attaches to an existing
/// segment. Dropping only unmaps; [`Channel::destroy`] is the explicit
/// teardown run by whoever owns the channel's end of life.
pub struct Channel {
    shm: *mut ChannelShm,
    name: String,
    destroyed: bool,
}

// SAFETY: all access to the mapped region goes through the semaphore
// protocol above; the pointer itself is stable until unmap.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    /// Create the channel segment for a worker, replacing any stale one.
    pub fn create(id: u32) -> Result<Channel> {
        let name = channel_name(id);
        let _ = posix::shm_unlink(&name);
        let fd = posix::shm_open(&name, libc::O_CREAT | libc::O_RDWR | libc::O_EXCL)?;
        if let Err(err) = posix::ftruncate(fd, CHANNEL_SHM_SIZE) {
            let _ = posix::close(fd);
            let _ = posix::shm_unlink(&name);
            return Err(err);
        }
        let shm = match posix::map(fd, CHANNEL_SHM_SIZE) {
            Ok(ptr) => ptr as *mut ChannelShm,
            Err(err) => {
                let _ = posix::close(fd);
                let _ = posix::shm_unlink(&name);
                return Err(err);
            }
        };
        posix::close(fd)?;

        // SAFETY: freshly truncated shared memory, mapped above; each
        // semaphore is initialized exactly once.
        unsafe {
            posix::sem_init(ptr::addr_of_mut!((*shm).writer), 1)?;
            posix::sem_init(ptr::addr_of_mut!((*shm).ready), 0)?;
            posix::sem_init(ptr::addr_of_mut!((*shm).drained), 1)?;
            posix::sem_init(ptr::addr_of_mut!((*shm).started), 0)?;
            for k in 0..RESPONSE_SLOT_COUNT {
                posix::sem_init(ptr::addr_of_mut!((*shm).slot_free[k]), 1)?;
                posix::sem_init(ptr::addr_of_mut!((*shm).slot_ready[k]), 0)?;
            }
        }
        Ok(Channel {
            shm,
            name,
            destroyed: false,
        })
    }

    /// Attach to a channel created by the peer.
    pub fn open(id: u32) -> Result<Channel> {
        let name = channel_name(id);
        let fd = posix::shm_open(&name, libc::O_RDWR)?;
        let shm = match posix::map(fd, CHANNEL_SHM_SIZE) {
            Ok(ptr) => ptr as *mut ChannelShm,
            Err(err) => {
                let _ = posix::close(fd);
                return Err(err);
            }
        };
        posix::close(fd)?;
        Ok(Channel {
            shm,
            name,
            destroyed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // Semaphore addresses are stable for the lifetime of the mapping.

    fn writer_sem(&self) -> *mut libc::sem_t {
        unsafe { ptr::addr_of_mut!((*self.shm).writer) }
    }

    fn ready_sem(&self) -> *mut libc::sem_t {
        unsafe { ptr::addr_of_mut!((*self.shm).ready) }
    }

    fn drained_sem(&self) -> *mut libc::sem_t {
        unsafe { ptr::addr_of_mut!((*self.shm).drained) }
    }

    fn started_sem(&self) -> *mut libc::sem_t {
        unsafe { ptr::addr_of_mut!((*self.shm).started) }
    }

    fn slot_free_sem(&self, k: usize) -> *mut libc::sem_t {
        unsafe { ptr::addr_of_mut!((*self.shm).slot_free[k]) }
    }

    fn slot_ready_sem(&self, k: usize) -> *mut libc::sem_t {
        unsafe { ptr::addr_of_mut!((*self.shm).slot_ready[k]) }
    }

    fn leased_flag(&self, k: usize) -> &AtomicU8 {
        // SAFETY: the flags are plain atomics inside the live mapping.
        unsafe { &(*self.shm).leased[k] }
    }

    /// Wait on a semaphore, retrying signal interruptions.
    fn wait(&self, sem: *mut libc::sem_t) -> Result<()> {
        loop {
            // SAFETY: sem points into the live mapping.
            match unsafe { posix::sem_wait(sem) } {
                Err(IpcError::Interrupted) => continue,
                other => return other,
            }
        }
    }

    /// Exclusive view of the request arena. Only valid while the caller
    /// holds the access right granted by the protocol (the writer mutex
    /// for clients, the ready/drained window for the worker).
    #[allow(clippy::mut_from_ref)]
    unsafe fn arena(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(ptr::addr_of_mut!((*self.shm).arena) as *mut u8, ARENA_SIZE)
    }

    /// Exclusive view of one response slot; same protocol caveat.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot(&self, k: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            ptr::addr_of_mut!((*self.shm).slots[k]) as *mut u8,
            SLOT_SIZE,
        )
    }

    fn check_size(need: u64, capacity: usize) -> Result<()> {
        if need > capacity as u64 {
            return Err(IpcError::BufferOverflow {
                need,
                capacity: capacity as u64,
            });
        }
        Ok(())
    }

    /// Send a request that expects no reply. No slot is leased.
    pub fn send(&self, hdr: &mut Header, ety: &dyn Entity) -> Result<()> {
        self.send_inner(hdr, ety, false).map(|_| ())
    }

    /// Send a request and lease the response slot its reply will arrive
    /// on. The caller must [`Channel::recv`] and then
    /// [`Channel::release_slot`] the returned slot.
    pub fn send_request(&self, hdr: &mut Header, ety: &dyn Entity) -> Result<u32> {
        self.send_inner(hdr, ety, true).map(|slot| {
            debug_assert!(slot.is_some());
            slot.unwrap_or(0)
        })
    }

    fn send_inner(&self, hdr: &mut Header, ety: &dyn Entity, lease: bool) -> Result<Option<u32>> {
        let ety_size = ety.size();
        Self::check_size(MSG_HEADER_SIZE as u64 + ety_size, ARENA_SIZE)?;
        hdr.ety_size = ety_size;

        self.wait(self.writer_sem())?;
        let result = self.write_request(hdr, ety, lease);
        // The writer mutex is released on every path, including failures.
        // SAFETY: semaphore inside the live mapping.
        let released = unsafe { posix::sem_post(self.writer_sem()) };
        match (result, released) {
            (Ok(slot), Ok(())) => Ok(slot),
            (Err(err), _) => Err(err),
            (Ok(slot), Err(err)) => {
                if let Some(slot) = slot {
                    let _ = self.release_slot(slot);
                }
                Err(err)
            }
        }
    }

    /// Runs under the writer mutex.
    fn write_request(&self, hdr: &mut Header, ety: &dyn Entity, lease: bool) -> Result<Option<u32>> {
        self.wait(self.drained_sem())?;

        let slot = if lease {
            match self.lease_slot() {
                Ok(slot) => {
                    hdr.rps_id = slot;
                    Some(slot)
                }
                Err(err) => {
                    // Nothing was written; reopen the arena.
                    // SAFETY: semaphore inside the live mapping.
                    let _ = unsafe { posix::sem_post(self.drained_sem()) };
                    return Err(err);
                }
            }
        } else {
            None
        };

        // SAFETY: we hold the writer mutex and have consumed `drained`,
        // so the arena is exclusively ours until `ready` is posted.
        unsafe {
            let arena = self.arena();
            let mut hbuf = [0u8; MSG_HEADER_SIZE];
            hdr.encode(&mut hbuf);
            arena[..MSG_HEADER_SIZE].copy_from_slice(&hbuf);
            let mut w =
                EntityWriter::new(&mut arena[MSG_HEADER_SIZE..MSG_HEADER_SIZE + hdr.ety_size as usize]);
            ety.write(&mut w);
            posix::sem_post(self.ready_sem())?;
        }
        Ok(slot)
    }

    /// Scan the slot pool until one can be leased. The scan is unfair;
    /// under saturation, starvation is bounded only by arrival order.
    fn lease_slot(&self) -> Result<u32> {
        loop {
            for k in 0..RESPONSE_SLOT_COUNT {
                // SAFETY: semaphore inside the live mapping.
                if unsafe { posix::sem_trywait(self.slot_free_sem(k))? } {
                    self.leased_flag(k).store(1, Ordering::Relaxed);
                    return Ok(k as u32);
                }
            }
            std::thread::yield_now();
        }
    }

    /// Wait for and copy out the response on a leased slot. Releasing is
    /// separate so callers can finish consuming a large payload before
    /// the next writer is admitted to the slot.
    pub fn recv(&self, slot: u32) -> Result<(Header, Vec<u8>)> {
        let k = slot as usize;
        if k >= RESPONSE_SLOT_COUNT {
            return Err(IpcError::protocol(format!("response slot {} out of range", slot)));
        }
        self.wait(self.slot_ready_sem(k))?;
        // SAFETY: between `slot_ready` and `release_slot` the lessee is
        // the only reader of this slot.
        let (hdr, body) = unsafe {
            let buf = self.slot(k);
            let mut hbuf = [0u8; MSG_HEADER_SIZE];
            hbuf.copy_from_slice(&buf[..MSG_HEADER_SIZE]);
            let hdr = Header::decode(&hbuf)?;
            if MSG_HEADER_SIZE as u64 + hdr.ety_size > SLOT_SIZE as u64 {
                return Err(IpcError::protocol(format!(
                    "response entity of {} bytes exceeds slot",
                    hdr.ety_size
                )));
            }
            let body = buf[MSG_HEADER_SIZE..MSG_HEADER_SIZE + hdr.ety_size as usize].to_vec();
            (hdr, body)
        };
        Ok((hdr, body))
    }

    /// Return a leased slot to the pool.
    pub fn release_slot(&self, slot: u32) -> Result<()> {
        let k = slot as usize;
        if k >= RESPONSE_SLOT_COUNT {
            return Err(IpcError::protocol(format!("response slot {} out of range", slot)));
        }
        self.leased_flag(k).store(0, Ordering::Relaxed);
        // SAFETY: semaphore inside the live mapping.
        unsafe { posix::sem_post(self.slot_free_sem(k)) }
    }

    /// Worker side: block for the next request, copy it out of the arena
    /// and reopen the arena for the next writer.
    ///
    /// A signal interruption while idle surfaces as
    /// [`IpcError::Interrupted`] so the loop can observe shutdown flags.
    pub fn recv_request(&self) -> Result<(Header, Vec<u8>)> {
        // SAFETY: semaphore inside the live mapping.
        unsafe { posix::sem_wait(self.ready_sem())? };
        self.drain_request()
    }

    /// Like [`Channel::recv_request`] with an upper bound on the wait.
    /// Returns `Ok(None)` on timeout; used by the manager's probe tick.
    pub fn recv_request_timeout(&self, timeout: Duration) -> Result<Option<(Header, Vec<u8>)>> {
        // SAFETY: semaphore inside the live mapping.
        if !unsafe { posix::sem_timedwait(self.ready_sem(), timeout)? } {
            return Ok(None);
        }
        self.drain_request().map(Some)
    }

    fn drain_request(&self) -> Result<(Header, Vec<u8>)> {
        // Copy everything out before posting `drained`: the arena may be
        // overwritten the instant the next writer gets in. The header is
        // decoded after the post so a malformed request cannot wedge the
        // arena.
        let mut hbuf = [0u8; MSG_HEADER_SIZE];
        let (raw_size, body) = {
            // SAFETY: `ready` was consumed and `drained` not yet posted,
            // so the worker owns the arena in this window.
            let arena = unsafe { self.arena() };
            hbuf.copy_from_slice(&arena[..MSG_HEADER_SIZE]);
            let raw_size = u64::from_ne_bytes(hbuf[20..28].try_into().unwrap());
            let clamped = raw_size.min((ARENA_SIZE - MSG_HEADER_SIZE) as u64) as usize;
            (
                raw_size,
                arena[MSG_HEADER_SIZE..MSG_HEADER_SIZE + clamped].to_vec(),
            )
        };
        // SAFETY: semaphore inside the live mapping.
        unsafe { posix::sem_post(self.drained_sem())? };

        let hdr = Header::decode(&hbuf)?;
        if raw_size as usize != body.len() {
            return Err(IpcError::protocol(format!(
                "request entity of {} bytes exceeds arena",
                raw_size
            )));
        }
        Ok((hdr, body))
    }

    /// Worker side: fill a response slot and signal its lessee.
    pub fn send_response(&self, slot: u32, hdr: &mut Header, ety: &dyn Entity) -> Result<()> {
        let k = slot as usize;
        if k >= RESPONSE_SLOT_COUNT {
            return Err(IpcError::protocol(format!("response slot {} out of range", slot)));
        }
        let ety_size = ety.size();
        Self::check_size(MSG_HEADER_SIZE as u64 + ety_size, SLOT_SIZE)?;
        hdr.ety_size = ety_size;
        hdr.rps_id = slot;

        // SAFETY: the lessee holds `slot_free[k]` and is blocked on
        // `slot_ready[k]`, so the worker owns the slot bytes here.
        unsafe {
            let buf = self.slot(k);
            let mut hbuf = [0u8; MSG_HEADER_SIZE];
            hdr.encode(&mut hbuf);
            buf[..MSG_HEADER_SIZE].copy_from_slice(&hbuf);
            let mut w =
                EntityWriter::new(&mut buf[MSG_HEADER_SIZE..MSG_HEADER_SIZE + ety_size as usize]);
            ety.write(&mut w);
            posix::sem_post(self.slot_ready_sem(k))
        }
    }

    /// Worker side: announce that setup finished and the loop is about to
    /// start serving.
    pub fn notify_started(&self) -> Result<()> {
        // SAFETY: semaphore inside the live mapping.
        unsafe { posix::sem_post(self.started_sem()) }
    }

    /// Launcher side: wait for the worker's ready announcement.
    /// Returns `false` on timeout.
    pub fn wait_started(&self, timeout: Duration) -> Result<bool> {
        // SAFETY: semaphore inside the live mapping.
        unsafe { posix::sem_timedwait(self.started_sem(), timeout) }
    }

    /// Slots currently marked leased. A non-empty answer at teardown
    /// means a client died holding its lease.
    pub fn leaked_slots(&self) -> Vec<u32> {
        (0..RESPONSE_SLOT_COUNT)
            .filter(|&k| self.leased_flag(k).load(Ordering::Relaxed) != 0)
            .map(|k| k as u32)
            .collect()
    }

    /// Full teardown: destroy the semaphores, unmap and unlink. Run by
    /// the worker on normal exit.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        // SAFETY: teardown runs once, after the serving loop stopped; any
        // client still blocked on these semaphores is already lost.
        unsafe {
            let report = |res: Result<()>| {
                if let Err(err) = res {
                    log::warn!("channel {} teardown: {}", self.name, err);
                }
            };
            report(posix::sem_destroy(self.writer_sem()));
            report(posix::sem_destroy(self.ready_sem()));
            report(posix::sem_destroy(self.drained_sem()));
            report(posix::sem_destroy(self.started_sem()));
            for k in 0..RESPONSE_SLOT_COUNT {
                report(posix::sem_destroy(self.slot_free_sem(k)));
                report(posix::sem_destroy(self.slot_ready_sem(k)));
            }
            report(posix::unmap(self.shm as *mut u8, CHANNEL_SHM_SIZE));
        }
        if let Err(err) = posix::shm_unlink(&self.name) {
            log::warn!("channel {} teardown: {}", self.name, err);
        }
        self.destroyed = true;
    }

    /// Remove the channel name without touching the semaphores. Used by
    /// the manager when reaping a worker that died and cannot clean up.
    pub fn unlink(&self) -> Result<()> {
        posix::shm_unlink(&self.name)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.destroyed {
            if let Err(err) = posix::unmap(self.shm as *mut u8, CHANNEL_SHM_SIZE) {
                log::warn!("failed to unmap channel {}: {}", self.name, err);
            }
        }
    }
}
