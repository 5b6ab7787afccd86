//! The executable memory adapters and methods are installed into.
//!
//! A [CodeRegion] is a single `mmap`ed block which is filled from its start. Nothing installed
//! in it is freed individually: code, once installed, stays at a fixed address until the whole
//! region is unmapped when it is dropped. Keeping everything in one block of less than 2GiB
//! means any two pieces of installed code are within range of a relative branch.

use crate::patch;
use libc::{MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, mmap, munmap};
use parking_lot::Mutex;
use std::{ffi::c_void, io};
use thiserror::Error;

/// The largest region we can create while guaranteeing relative branches can span it.
pub const MAX_REGION_SIZE: usize = i32::MAX as usize;

#[derive(Debug, Error)]
pub enum CodeRegionError {
    #[error("code region of {0} bytes is too big")]
    TooBig(usize),
    #[error("unable to map code region: {0}")]
    Map(io::Error),
    #[error("code region exhausted: {wanted} bytes wanted, {left} left")]
    Exhausted { wanted: usize, left: usize },
}

/// A pointer which we promise is safe to share between threads.
#[derive(Debug)]
struct SyncSafePtr(*mut u8);
unsafe impl Send for SyncSafePtr {}
unsafe impl Sync for SyncSafePtr {}

/// A block of executable memory. Dropping a region unmaps it: no thread may be executing, or
/// about to return to, code installed in it by then.
#[derive(Debug)]
pub struct CodeRegion {
    /// A pointer to the beginning of the `mmap`ed buffer.
    buf: SyncSafePtr,
    /// How many bytes have we allocated to the buffer?
    len: usize,
    /// How many bytes from the start of the buffer are in use?
    used: Mutex<usize>,
}

impl CodeRegion {
    /// Create a new code region at least `len` bytes big.
    pub fn new(len: usize) -> Result<Self, CodeRegionError> {
        let len = len.next_multiple_of(patch::page_size());
        if len > MAX_REGION_SIZE {
            return Err(CodeRegionError::TooBig(len));
        }
        let buf = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                PROT_READ | PROT_EXEC,
                MAP_ANON | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if buf == MAP_FAILED {
            return Err(CodeRegionError::Map(io::Error::last_os_error()));
        }
        Ok(Self {
            buf: SyncSafePtr(buf as *mut u8),
            len,
            used: Mutex::new(0),
        })
    }

    /// The address of the start of the region.
    pub fn start(&self) -> usize {
        self.buf.0 as usize
    }

    /// Return the size of this region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// How many bytes of the region are in use?
    pub fn used(&self) -> usize {
        *self.used.lock()
    }

    /// Does `addr` lie within the region?
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.start() + self.len
    }

    /// Reserve `len` bytes at an `align`ed address, call `f` with that address, and copy the
    /// `len` bytes it returns to the reserved space. Returns the address the code was installed
    /// at.
    ///
    /// # Panics
    ///
    /// If `f` returns a number of bytes other than `len`.
    pub fn install_with<F>(&self, len: usize, align: usize, f: F) -> Result<usize, CodeRegionError>
    where
        F: FnOnce(usize) -> Vec<u8>,
    {
        let addr = {
            let mut used = self.used.lock();
            let off = used.next_multiple_of(align);
            if off + len > self.len {
                return Err(CodeRegionError::Exhausted {
                    wanted: len,
                    left: self.len - *used,
                });
            }
            *used = off + len;
            self.start() + off
        };
        // No other thread can observe the space we reserved until we return its address.
        let code = f(addr);
        assert_eq!(code.len(), len);
        unsafe { patch::write_code(addr, &code) };
        Ok(addr)
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        let rtn = unsafe { munmap(self.buf.0 as *mut c_void, self.len) };
        debug_assert_eq!(rtn, 0);
    }
}
