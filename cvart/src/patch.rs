//! Patching of live machine code.
//!
//! Code which may be executing on another thread is only ever changed by writing a single aligned
//! 8 byte word, so a concurrent reader sees either the old or the new instruction bytes, never a
//! mix. Relative branches are only patchable if their 4 byte displacement lies within one such
//! word.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::{ptr, sync::atomic::fence};
use thiserror::Error;

/// The opcode of `call rel32`.
pub const CALL_OPCODE: u8 = 0xE8;
/// The opcode of `jmp rel32`.
pub const JMP_OPCODE: u8 = 0xE9;
/// The size of `call rel32` and `jmp rel32`.
pub const REL32_INSN_SIZE: usize = 5;

const WORD_SIZE: usize = 8;

/// Serialises all writes to code.
static LK_PATCH: Mutex<()> = Mutex::new(());

/// The size of a page of memory.
pub(crate) fn page_size() -> usize {
    usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) }).unwrap()
}

#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("displacement of branch at {0:#x} spans an 8 byte boundary")]
    NotPatchable(usize),
    #[error("{target:#x} is out of range of a branch at {site:#x}")]
    OutOfRange { site: usize, target: usize },
    #[error("expected a relative call or jump at {site:#x} but found opcode {opcode:#04x}")]
    UnexpectedOpcode { site: usize, opcode: u8 },
}

/// Can the displacement of a 5 byte relative branch at `site` be written atomically?
pub fn is_patchable(site: usize) -> bool {
    (site + 1) / WORD_SIZE == (site + REL32_INSN_SIZE - 1) / WORD_SIZE
}

/// The displacement a relative branch at `site` needs to reach `target`.
pub fn rel32(site: usize, target: usize) -> Result<i32, PatchError> {
    let next = (site + REL32_INSN_SIZE) as i128;
    i32::try_from(target as i128 - next).map_err(|_| PatchError::OutOfRange { site, target })
}

/// Run `f` with the pages spanning `[low, high)` writeable.
///
/// # Safety
///
/// `[low, high)` must lie within a mapping created for code and `LK_PATCH` must be held.
unsafe fn with_writeable<F: FnOnce()>(low: usize, high: usize, f: F) {
    // `mprotect` requires a page-aligned address.
    let page_sz = page_size();
    let low = (low / page_sz) * page_sz;
    let len = high - low;
    if unsafe {
        libc::mprotect(
            low as *mut libc::c_void,
            len,
            libc::PROT_EXEC | libc::PROT_READ | libc::PROT_WRITE,
        )
    } != 0
    {
        panic!("Unable to make code writeable at {low:#x}");
    }
    f();
    // Ensure that the compiler doesn't remove any of the writes in `f`, and that other threads
    // using `LK_PATCH` have the same view of memory. Threads which don't take the lock may go
    // arbitrarily long without observing the writes.
    fence(std::sync::atomic::Ordering::Release);
    if unsafe {
        libc::mprotect(
            low as *mut libc::c_void,
            len,
            libc::PROT_EXEC | libc::PROT_READ,
        )
    } != 0
    {
        panic!("Unable to make code executable at {low:#x}");
    }
}

/// Copy `bytes` to `addr`. The caller must ensure no thread can be executing the code being
/// overwritten.
///
/// # Safety
///
/// `addr..addr + bytes.len()` must lie within a mapping created for code.
pub(crate) unsafe fn write_code(addr: usize, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let _lock = LK_PATCH.lock();
    unsafe {
        with_writeable(addr, addr + bytes.len(), || {
            ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len())
        });
    }
}

/// Write each `(addr, val)` pair in `patches` as a single aligned 8 byte store. `LK_PATCH` must
/// be held.
///
/// # Safety
///
/// Every address must lie within a mapping created for code.
unsafe fn patch_words(patches: &[(usize, u64)]) {
    if patches.is_empty() {
        return;
    }
    let low = patches.iter().map(|(x, _)| *x).min().unwrap();
    let high = patches.iter().map(|(x, _)| *x + WORD_SIZE).max().unwrap();
    unsafe {
        with_writeable(low, high, || {
            for (tgt, val) in patches {
                // The target address must be 8-byte aligned so that we do a single write. By
                // definition, this means that we also cannot span a cache-line.
                assert!(tgt.is_multiple_of(WORD_SIZE));
                ptr::write_volatile(*tgt as *mut u64, *val);
            }
        });
    }
}

/// Repoint the relative branch at `site` to `target`, returning the old target. `LK_PATCH` must
/// be held.
///
/// # Safety
///
/// `site` must be the address of a relative call or jump in a mapping created for code.
unsafe fn set_target(site: usize, target: usize) -> Result<usize, PatchError> {
    let opcode = unsafe { *(site as *const u8) };
    if opcode != CALL_OPCODE && opcode != JMP_OPCODE {
        return Err(PatchError::UnexpectedOpcode { site, opcode });
    }
    if !is_patchable(site) {
        return Err(PatchError::NotPatchable(site));
    }
    let disp = rel32(site, target)?;
    let word_addr = (site + 1) & !(WORD_SIZE - 1);
    let mut word = [0; WORD_SIZE];
    LittleEndian::write_u64(&mut word, unsafe { ptr::read_volatile(word_addr as *const u64) });
    let off = site + 1 - word_addr;
    let old = LittleEndian::read_i32(&word[off..off + 4]);
    LittleEndian::write_i32(&mut word[off..off + 4], disp);
    unsafe { patch_words(&[(word_addr, LittleEndian::read_u64(&word))]) };
    Ok(branch_target(site, old))
}

fn branch_target(site: usize, disp: i32) -> usize {
    (site + REL32_INSN_SIZE).wrapping_add_signed(disp as isize)
}

/// Make the instruction at `site` a relative call to `target`. If `site` is already a relative
/// call only its displacement is written, so this is safe to do while other threads may be
/// executing the call. Otherwise no thread may be executing the code at `site`.
///
/// # Safety
///
/// `site` must be the address of a relative call or jump in a mapping created for code.
pub unsafe fn link(site: usize, target: usize) -> Result<(), PatchError> {
    rel32(site, target)?;
    if !is_patchable(site) {
        return Err(PatchError::NotPatchable(site));
    }
    let _lock = LK_PATCH.lock();
    let opcode = unsafe { *(site as *const u8) };
    match opcode {
        CALL_OPCODE => (),
        JMP_OPCODE => unsafe {
            with_writeable(site, site + 1, || {
                ptr::write_volatile(site as *mut u8, CALL_OPCODE)
            })
        },
        _ => return Err(PatchError::UnexpectedOpcode { site, opcode }),
    }
    unsafe { set_target(site, target) }.map(|_| ())
}

/// Atomically repoint the relative call or jump at `site` to `target` without changing its
/// opcode, returning the old target. This is safe to do while other threads are executing the
/// branch: they will reach either the old or the new target.
///
/// # Safety
///
/// `site` must be the address of a relative call or jump in a mapping created for code.
pub unsafe fn repoint(site: usize, target: usize) -> Result<usize, PatchError> {
    let _lock = LK_PATCH.lock();
    unsafe { set_target(site, target) }
}

/// As [repoint], for callers which have no way of recovering from a failed patch.
///
/// # Panics
///
/// If `site` is not a patchable relative branch, or `target` is out of its range.
///
/// # Safety
///
/// `site` must be the address of a relative call or jump in a mapping created for code.
pub unsafe fn patch_displacement_only(site: usize, target: usize) -> usize {
    match unsafe { repoint(site, target) } {
        Ok(old) => old,
        Err(e) => panic!("{e}"),
    }
}

/// The target of the relative call or jump at `site`, or `None` if there isn't one.
///
/// # Safety
///
/// `site..site + 5` must be readable.
pub unsafe fn read_target(site: usize) -> Option<usize> {
    let mut insn = [0; REL32_INSN_SIZE];
    unsafe { ptr::copy_nonoverlapping(site as *const u8, insn.as_mut_ptr(), REL32_INSN_SIZE) };
    match insn[0] {
        CALL_OPCODE | JMP_OPCODE => Some(branch_target(site, LittleEndian::read_i32(&insn[1..]))),
        _ => None,
    }
}
