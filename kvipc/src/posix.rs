//! Thin wrappers over POSIX named shared memory and process-shared
//! semaphores.
//!
//! Every function either succeeds or returns an [`IpcError`] carrying the
//! failing call and `errno`. The only deliberate exception is `sem_wait`,
//! which reports [`IpcError::Interrupted`] on `EINTR` so callers can decide
//! whether to retry or to observe a shutdown flag first.
//!
//! Naming is flat: callers build names from a per-component prefix plus
//! numeric ids, e.g. `/KVChannel7`.

use std::ffi::CString;
use std::time::Duration;

use crate::errors::{IpcError, Result};

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| IpcError::protocol(format!("bad shm name {:?}", name)))
}

/// `shm_open` with the given open flags. The descriptor is only needed to
/// establish the mapping; callers close it with [`close`] right after
/// [`map`].
pub fn shm_open(name: &str, oflag: libc::c_int) -> Result<libc::c_int> {
    let cname = c_name(name)?;
    let fd = unsafe { libc::shm_open(cname.as_ptr(), oflag, 0o600 as libc::mode_t) };
    if fd == -1 {
        return Err(IpcError::system("shm_open"));
    }
    Ok(fd)
}

pub fn shm_unlink(name: &str) -> Result<()> {
    let cname = c_name(name)?;
    if unsafe { libc::shm_unlink(cname.as_ptr()) } == -1 {
        return Err(IpcError::system("shm_unlink"));
    }
    Ok(())
}

pub fn ftruncate(fd: libc::c_int, len: usize) -> Result<()> {
    if unsafe { libc::ftruncate(fd, len as libc::off_t) } == -1 {
        return Err(IpcError::system("ftruncate"));
    }
    Ok(())
}

pub fn map(fd: libc::c_int, len: usize) -> Result<*mut u8> {
    // SAFETY: mapping a shared descriptor we just opened; MAP_SHARED makes
    // stores visible to the peer processes.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(IpcError::system("mmap"));
    }
    Ok(ptr as *mut u8)
}

pub fn unmap(ptr: *mut u8, len: usize) -> Result<()> {
    if unsafe { libc::munmap(ptr as *mut libc::c_void, len) } == -1 {
        return Err(IpcError::system("munmap"));
    }
    Ok(())
}

pub fn close(fd: libc::c_int) -> Result<()> {
    if unsafe { libc::close(fd) } == -1 {
        return Err(IpcError::system("close"));
    }
    Ok(())
}

/// Initialize a process-shared semaphore living inside a mapped region.
///
/// # Safety
/// `sem` must point into a live `MAP_SHARED` mapping large enough for a
/// `sem_t`, and the memory must not be initialized twice.
pub unsafe fn sem_init(sem: *mut libc::sem_t, value: u32) -> Result<()> {
    if libc::sem_init(sem, 1, value) == -1 {
        return Err(IpcError::system("sem_init"));
    }
    Ok(())
}

/// # Safety
/// `sem` must point to a semaphore previously set up with [`sem_init`] and
/// no other process may be blocked on it.
pub unsafe fn sem_destroy(sem: *mut libc::sem_t) -> Result<()> {
    if libc::sem_destroy(sem) == -1 {
        return Err(IpcError::system("sem_destroy"));
    }
    Ok(())
}

/// # Safety
/// `sem` must point to an initialized process-shared semaphore.
pub unsafe fn sem_post(sem: *mut libc::sem_t) -> Result<()> {
    if libc::sem_post(sem) == -1 {
        return Err(IpcError::system("sem_post"));
    }
    Ok(())
}

/// Block until the semaphore can be decremented. `EINTR` is surfaced as
/// [`IpcError::Interrupted`]; callers retry.
///
/// # Safety
/// `sem` must point to an initialized process-shared semaphore.
pub unsafe fn sem_wait(sem: *mut libc::sem_t) -> Result<()> {
    if libc::sem_wait(sem) == -1 {
        if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            return Err(IpcError::Interrupted);
        }
        return Err(IpcError::system("sem_wait"));
    }
    Ok(())
}

/// Try to decrement without blocking. Returns `false` when the semaphore
/// was already at zero.
///
/// # Safety
/// `sem` must point to an initialized process-shared semaphore.
pub unsafe fn sem_trywait(sem: *mut libc::sem_t) -> Result<bool> {
    if libc::sem_trywait(sem) == -1 {
        let errno = std::io::Error::last_os_error().raw_os_error();
        if errno == Some(libc::EAGAIN) || errno == Some(libc::EINTR) {
            return Ok(false);
        }
        return Err(IpcError::system("sem_trywait"));
    }
    Ok(true)
}

/// Wait with an upper bound. Returns `false` on timeout.
///
/// # Safety
/// `sem` must point to an initialized process-shared semaphore.
pub unsafe fn sem_timedwait(sem: *mut libc::sem_t, timeout: Duration) -> Result<bool> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) == -1 {
        return Err(IpcError::system("clock_gettime"));
    }
    let mut abs = libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t,
        tv_nsec: now.tv_nsec + timeout.subsec_nanos() as libc::c_long,
    };
    if abs.tv_nsec >= 1_000_000_000 {
        abs.tv_sec += 1;
        abs.tv_nsec -= 1_000_000_000;
    }
    loop {
        if libc::sem_timedwait(sem, &abs) == 0 {
            return Ok(true);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ETIMEDOUT) => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => return Err(IpcError::system("sem_timedwait")),
        }
    }
}

/// A named shared-memory segment mapped into this process.
///
/// Used for the bulk scan batches that do not fit a response slot. The
/// mapping is released on drop; unlinking the name is a separate, explicit
/// step because creator and consumer run in different processes.
pub struct ShmSegment {
    name: String,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the segment is a plain byte region; concurrent access is
// serialized by the channel protocol, never by this type.
unsafe impl Send for ShmSegment {}

impl ShmSegment {
    /// Create (or replace) the segment and size it to `len`.
    ///
    /// A stale segment left behind by a crashed peer is unlinked first, so
    /// creation never fails with `EEXIST`.
    pub fn create(name: &str, len: usize) -> Result<ShmSegment> {
        let _ = shm_unlink(name);
        let fd = shm_open(name, libc::O_CREAT | libc::O_RDWR | libc::O_EXCL)?;
        if let Err(err) = ftruncate(fd, len) {
            let _ = close(fd);
            let _ = shm_unlink(name);
            return Err(err);
        }
        Self::finish(name, fd, len)
    }

    /// Map an existing segment created by the peer.
    pub fn open(name: &str, len: usize) -> Result<ShmSegment> {
        let fd = shm_open(name, libc::O_RDWR)?;
        Self::finish(name, fd, len)
    }

    fn finish(name: &str, fd: libc::c_int, len: usize) -> Result<ShmSegment> {
        let ptr = match map(fd, len) {
            Ok(ptr) => ptr,
            Err(err) => {
                let _ = close(fd);
                return Err(err);
            }
        };
        close(fd)?;
        Ok(ShmSegment {
            name: name.to_owned(),
            ptr,
            len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is valid for `len` bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is valid for `len` bytes until drop, and the
        // channel protocol grants the holder exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Remove the name. Existing mappings stay usable until unmapped.
    pub fn unlink(&self) -> Result<()> {
        shm_unlink(&self.name)
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if let Err(err) = unmap(self.ptr, self.len) {
            log::warn!("failed to unmap segment {}: {}", self.name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(0);
        format!(
            "/kvipc-posix-{}-{}-{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn segment_roundtrip() {
        let name = unique_name("rt");
        let mut seg = ShmSegment::create(&name, 4096).unwrap();
        seg.as_mut_slice()[..5].copy_from_slice(b"hello");

        let peer = ShmSegment::open(&name, 4096).unwrap();
        assert_eq!(&peer.as_slice()[..5], b"hello");

        seg.unlink().unwrap();
        assert!(ShmSegment::open(&name, 4096).is_err());
    }

    #[test]
    fn create_replaces_stale_segment() {
        let name = unique_name("stale");
        let mut stale = ShmSegment::create(&name, 64).unwrap();
        stale.as_mut_slice()[0] = 0xAA;
        drop(stale);

        let fresh = ShmSegment::create(&name, 64).unwrap();
        assert_eq!(fresh.as_slice()[0], 0);
        fresh.unlink().unwrap();
    }

    #[test]
    fn semaphore_counts() {
        let name = unique_name("sem");
        let mut seg = ShmSegment::create(&name, std::mem::size_of::<libc::sem_t>()).unwrap();
        let sem = seg.as_mut_slice().as_mut_ptr() as *mut libc::sem_t;

        unsafe {
            sem_init(sem, 1).unwrap();
            assert!(sem_trywait(sem).unwrap());
            assert!(!sem_trywait(sem).unwrap());
            sem_post(sem).unwrap();
            assert!(sem_timedwait(sem, std::time::Duration::from_millis(50)).unwrap());
            assert!(!sem_timedwait(sem, std::time::Duration::from_millis(50)).unwrap());
            sem_destroy(sem).unwrap();
        }
        seg.unlink().unwrap();
    }
}
