// Shared mappings: the named cell every task polls, and the anonymous stop
// flag the coordinator hands to the writer. Both survive fork() because they
// are MAP_SHARED; children inherit the mapping instead of reopening it.

use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::debug;

use crate::cell::AtomicWord;
use crate::error::{Error, Result};

/// Name of the shared memory object used by the driver.
pub const CELL_NAME: &str = "/read_contention_cell";

const CELL_SIZE: usize = size_of::<AtomicU64>();

/// One `AtomicU64` in a named POSIX shared memory object.
pub struct ShmCell {
    name: String,
    c_name: CString,
    _fd: OwnedFd,
    map: *mut libc::c_void,
    mapped: bool,
}

// SAFETY: the mapping only ever holds an AtomicU64 and is accessed through
// atomic operations.
unsafe impl Send for ShmCell {}
unsafe impl Sync for ShmCell {}

impl ShmCell {
    /// Create (or truncate) the object, size it for one word, map it and
    /// store zero.
    pub fn create(name: &str) -> Result<Self> {
        let c_name = CString::new(name)
            .map_err(|_| Error::invalid("shared memory name", "contains a NUL byte"))?;

        // O_TRUNC drops whatever a crashed earlier run left behind.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC,
                0o666,
            )
        };
        if fd < 0 {
            return Err(Error::shm("shm_open", name));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), CELL_SIZE as libc::off_t) } != 0 {
            let err = Error::shm("ftruncate", name);
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(err);
        }

        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                CELL_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            let err = Error::shm("mmap", name);
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(err);
        }

        let cell = ShmCell {
            name: name.to_string(),
            c_name,
            _fd: fd,
            map,
            mapped: true,
        };
        cell.store(0);
        debug!(name, size = CELL_SIZE, "shared cell created");
        Ok(cell)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn word(&self) -> &AtomicU64 {
        // mmap returns page-aligned memory, so the cast is aligned.
        unsafe { &*(self.map as *const AtomicU64) }
    }

    /// Unmap and unlink the object.
    pub fn destroy(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;

        if unsafe { libc::munmap(self.map, CELL_SIZE) } != 0 {
            return Err(Error::shm("munmap", &self.name));
        }
        if unsafe { libc::shm_unlink(self.c_name.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            // Someone else already unlinked this name; the mapping is gone
            // either way.
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Shm {
                    op: "shm_unlink",
                    name: self.name.clone(),
                    source: err,
                });
            }
        }
        debug!(name = %self.name, "shared cell destroyed");
        Ok(())
    }
}

impl AtomicWord for ShmCell {
    #[inline]
    fn store(&self, value: u64) {
        self.word().store(value, Ordering::SeqCst);
    }

    #[inline]
    fn load(&self) -> u64 {
        self.word().load(Ordering::SeqCst)
    }
}

impl Drop for ShmCell {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// A boolean in an anonymous `MAP_SHARED` page, visible across `fork()`.
pub struct StopFlag {
    map: *mut libc::c_void,
}

impl StopFlag {
    pub fn new() -> Result<Self> {
        // MAP_ANONYMOUS memory is zeroed, so the flag starts lowered.
        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size_of::<AtomicBool>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(Error::shm("mmap", "<anonymous stop flag>"));
        }
        Ok(StopFlag { map })
    }

    pub fn flag(&self) -> &AtomicBool {
        unsafe { &*(self.map as *const AtomicBool) }
    }

    pub fn raise(&self) {
        self.flag().store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.flag().load(Ordering::SeqCst)
    }
}

impl Drop for StopFlag {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map, size_of::<AtomicBool>());
        }
    }
}
