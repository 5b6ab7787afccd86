//! Stack walking through adapter frames.
//!
//! Adapter frames have no frame metadata of their own: everything a stack walker, debugger or
//! garbage collector needs to know about one is derived from the [GeneratedAdapter] and the
//! position of the thread within it. None of this is used when executing adapters.

use crate::{adapter::GeneratedAdapter, kind::WORD_BYTES};
use cvarefmap::ReferenceMapPreparer;
use std::{ptr, sync::Arc};
use thiserror::Error;

mod x64;

#[derive(Debug, Error, PartialEq)]
pub enum WalkError {
    #[error("{0:#x} is not in adapter code")]
    NotAdapterCode(usize),
    #[error("caller frame stopped at offset {pos} rather than the stop point {stop_pos}")]
    NotAtStopPoint { pos: usize, stop_pos: usize },
    #[error("unexpected byte {byte:#04x} at adapter offset {pos}")]
    DecodeMismatch { pos: usize, byte: u8 },
    #[error("unable to read memory at {0:#x}")]
    Memory(usize),
}

/// The registers of one frame of a thread's stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Cursor {
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
    /// Is this the frame the thread is executing in? If not, the thread is stopped in a call made
    /// from this frame.
    pub top_frame: bool,
}

/// Read access to the memory of the thread being walked.
pub trait MemoryReader {
    fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> Result<(), WalkError>;

    fn read_word(&self, addr: usize) -> Result<u64, WalkError> {
        let mut buf = [0; WORD_BYTES];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Reads the memory of the current process.
pub struct LocalMemory(());

impl LocalMemory {
    /// # Safety
    ///
    /// Every address read through the returned value must be readable.
    pub unsafe fn new() -> Self {
        Self(())
    }
}

impl MemoryReader for LocalMemory {
    fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> Result<(), WalkError> {
        if addr == 0 {
            return Err(WalkError::Memory(addr));
        }
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }
}

/// Copies of regions of another thread's (or process's) memory, as taken by an inspector.
#[derive(Default)]
pub struct SnapshotMemory {
    regions: Vec<(usize, Vec<u8>)>,
}

impl SnapshotMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the memory at `base` held `bytes`.
    pub fn add_region(&mut self, base: usize, bytes: Vec<u8>) {
        self.regions.push((base, bytes));
    }
}

impl MemoryReader for SnapshotMemory {
    fn read_bytes(&self, addr: usize, buf: &mut [u8]) -> Result<(), WalkError> {
        for (base, bytes) in &self.regions {
            if addr >= *base && addr + buf.len() <= base + bytes.len() {
                let off = addr - base;
                buf.copy_from_slice(&bytes[off..off + buf.len()]);
                return Ok(());
            }
        }
        Err(WalkError::Memory(addr))
    }
}

/// How much of an adapter's frame is on the stack, relative to the current stack pointer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct FrameState {
    /// The offset of the return address into the adapter's caller.
    pub(crate) ra_offset: usize,
    /// The offset of the caller's saved frame pointer, if it has been saved.
    pub(crate) saved_fp_offset: Option<usize>,
}

fn frame_state(
    adapter: &GeneratedAdapter,
    code_start: usize,
    cursor: &Cursor,
) -> Result<FrameState, WalkError> {
    let pos = cursor
        .ip
        .checked_sub(code_start)
        .filter(|x| *x < adapter.code().len())
        .ok_or(WalkError::NotAdapterCode(cursor.ip))?;
    x64::frame_state(adapter, pos, cursor.top_frame)
}

/// Compute the cursor of the frame which called `adapter`, installed at `code_start`, given the
/// cursor of the adapter's frame.
pub fn walk_through_adapter(
    adapter: &GeneratedAdapter,
    code_start: usize,
    cursor: &Cursor,
    mem: &dyn MemoryReader,
) -> Result<Cursor, WalkError> {
    let st = frame_state(adapter, code_start, cursor)?;
    let ip = usize::try_from(mem.read_word(cursor.sp + st.ra_offset)?)
        .map_err(|_| WalkError::Memory(cursor.sp + st.ra_offset))?;
    let fp = match st.saved_fp_offset {
        Some(off) => usize::try_from(mem.read_word(cursor.sp + off)?)
            .map_err(|_| WalkError::Memory(cursor.sp + off))?,
        None => cursor.fp,
    };
    Ok(Cursor {
        ip,
        sp: cursor.sp + st.ra_offset + WORD_BYTES,
        fp,
        top_frame: false,
    })
}

/// One word of an adapter frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameSlot {
    pub addr: usize,
    pub name: String,
    pub value: u64,
}

/// A description of an adapter's frame for debuggers and logs.
#[derive(Clone, Debug)]
pub struct FrameDescription {
    pub adapter: Arc<GeneratedAdapter>,
    /// The address of the lowest word of the frame.
    pub frame_base: usize,
    pub return_address_slot: usize,
    pub saved_fp_slot: Option<usize>,
    pub caller: Cursor,
    /// Every word from `frame_base` to `return_address_slot` inclusive.
    pub slots: Vec<FrameSlot>,
}

pub fn describe_adapter_frame(
    adapter: &Arc<GeneratedAdapter>,
    code_start: usize,
    cursor: &Cursor,
    mem: &dyn MemoryReader,
) -> Result<FrameDescription, WalkError> {
    let st = frame_state(adapter, code_start, cursor)?;
    let caller = walk_through_adapter(adapter, code_start, cursor, mem)?;
    // Slot names are relative to the fully established frame.
    let nominal = adapter.layout().return_address_offset() - st.ra_offset;
    let mut slots = Vec::with_capacity(st.ra_offset / WORD_BYTES + 1);
    for off in (0..=st.ra_offset).step_by(WORD_BYTES) {
        let addr = cursor.sp + off;
        slots.push(FrameSlot {
            addr,
            name: adapter.layout().slot_name(nominal + off),
            value: mem.read_word(addr)?,
        });
    }
    Ok(FrameDescription {
        adapter: Arc::clone(adapter),
        frame_base: cursor.sp,
        return_address_slot: cursor.sp + st.ra_offset,
        saved_fp_slot: st.saved_fp_offset.map(|x| cursor.sp + x),
        caller,
        slots,
    })
}

/// Tell `preparer` which slots of the frame of `adapter`, stopped in its call to the callee
/// body, hold references.
pub fn prepare_reference_map(
    adapter: &GeneratedAdapter,
    code_start: usize,
    cursor: &Cursor,
    preparer: &mut dyn ReferenceMapPreparer,
) -> Result<(), WalkError> {
    let pos = cursor.ip.wrapping_sub(code_start);
    if pos != adapter.stop_pos() {
        return Err(WalkError::NotAtStopPoint {
            pos,
            stop_pos: adapter.stop_pos(),
        });
    }
    let base = preparer.bit_index(cursor.sp);
    adapter.refmap().apply(base, preparer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::Direction,
        compile::{AdapterCodeGenerator, x64::X64AdapterGenerator},
        kind::Signature,
    };
    use cvarefmap::StackBitmap;
    use zydis::{Decoder, VisibleOperands};

    const CODE_START: usize = 0x10_0000;
    const CALLER_IP: u64 = 0x20_1234;
    const CALLER_FP: u64 = 0x7000_0100;
    const BODY: u64 = 0x30_0010;

    fn generate(direction: Direction, sig: &str) -> Arc<GeneratedAdapter> {
        Arc::new(
            X64AdapterGenerator::new()
                .generate(direction, &sig.parse::<Signature>().unwrap())
                .unwrap(),
        )
    }

    /// The offsets of the start of each instruction in `adapter`.
    fn boundaries(adapter: &GeneratedAdapter) -> Vec<usize> {
        Decoder::new64()
            .decode_all::<VisibleOperands>(adapter.code(), 0)
            .map(|x| usize::try_from(x.unwrap().0).unwrap())
            .collect()
    }

    /// Simulate the stack pointer of a thread executing `adapter` up to offset `pos`, starting
    /// from `sp0` on entry. Returns the stack pointer and a snapshot of the stack.
    fn simulate(adapter: &GeneratedAdapter, sp0: usize, pos: usize) -> (usize, SnapshotMemory) {
        let layout = adapter.layout();
        let f = layout.total_size();
        let stop_sp = sp0 + WORD_BYTES - f;
        let callee_pops = match adapter.direction() {
            Direction::OptimizedToBaseline => layout.stack_arg_size(),
            Direction::BaselineToOptimized => 0,
        };
        let sp = if pos < adapter.frame_pos() {
            sp0
        } else if pos < adapter.stop_pos() {
            stop_sp
        } else {
            // Step through the teardown from the stop point.
            let mut sp = stop_sp + callee_pops;
            let mut p = adapter.stop_pos();
            for (off, raw) in Decoder::new64()
                .decode_all::<VisibleOperands>(adapter.code(), 0)
                .map(|x| x.unwrap())
                .map(|(ip, raw, _)| (usize::try_from(ip).unwrap(), raw.to_vec()))
            {
                if off < adapter.stop_pos() || off >= pos {
                    continue;
                }
                match raw[..] {
                    // leave
                    [0xC9] => sp = sp0,
                    // add rsp, imm
                    [0x48, 0x83, 0xC4, imm] => sp += usize::from(imm),
                    [0x48, 0x81, 0xC4, a, b, c, d] => {
                        sp += usize::try_from(u32::from_le_bytes([a, b, c, d])).unwrap()
                    }
                    _ => panic!("{raw:x?}"),
                }
                p = off + raw.len();
            }
            assert_eq!(p, pos);
            sp
        };

        // Lay out a plausible stack from the lowest possible stack pointer up to the caller's
        // frame.
        let low = stop_sp;
        let mut words = vec![0u64; (sp0 - low) / WORD_BYTES + 4];
        let mut set = |addr: usize, v: u64| words[(addr - low) / WORD_BYTES] = v;
        set(sp0, BODY);
        set(sp0 + WORD_BYTES, CALLER_IP);
        if let Some(off) = layout.saved_fp_offset() {
            set(stop_sp + off, CALLER_FP);
        }
        let mut mem = SnapshotMemory::new();
        mem.add_region(
            low,
            words.iter().flat_map(|x| x.to_le_bytes()).collect::<Vec<_>>(),
        );
        (sp, mem)
    }

    #[test]
    fn stop_point() {
        for (direction, sig) in [
            (Direction::BaselineToOptimized, "(IR)R"),
            (Direction::BaselineToOptimized, "(JJJJJJJJDR)V"),
            (Direction::OptimizedToBaseline, "(IR)R"),
            (Direction::OptimizedToBaseline, "(JJJJJJJJJI)V"),
        ] {
            let a = generate(direction, sig);
            let sp0 = 0x7fff_1000;
            let (sp, mem) = simulate(&a, sp0, a.stop_pos());
            let cursor = Cursor {
                ip: CODE_START + a.stop_pos(),
                sp,
                fp: 0,
                top_frame: false,
            };
            let caller = walk_through_adapter(&a, CODE_START, &cursor, &mem).unwrap();
            assert_eq!(caller.sp, sp + a.layout().total_size() + WORD_BYTES);
            assert_eq!(caller.ip, usize::try_from(CALLER_IP).unwrap());
            assert!(!caller.top_frame);
            match direction {
                Direction::BaselineToOptimized => {
                    assert_eq!(caller.fp, usize::try_from(CALLER_FP).unwrap())
                }
                Direction::OptimizedToBaseline => assert_eq!(caller.fp, 0),
            }
        }
    }

    #[test]
    fn every_instruction() {
        for (direction, sig) in [
            (Direction::BaselineToOptimized, "(IR)R"),
            (Direction::BaselineToOptimized, "(FJJJJJJJR)D"),
            (Direction::OptimizedToBaseline, "(ZBSCIJ)V"),
            (Direction::OptimizedToBaseline, "(RJJJJJJJI)R"),
        ] {
            let a = generate(direction, sig);
            let sp0 = 0x7fff_1000;
            for pos in boundaries(&a) {
                let (sp, mem) = simulate(&a, sp0, pos);
                let cursor = Cursor {
                    ip: CODE_START + pos,
                    sp,
                    fp: 0x42,
                    top_frame: true,
                };
                let caller = walk_through_adapter(&a, CODE_START, &cursor, &mem)
                    .unwrap_or_else(|e| panic!("{} at {pos}: {e}", a.description()));
                assert_eq!(caller.ip, usize::try_from(CALLER_IP).unwrap(), "{pos}");
                assert_eq!(caller.sp, sp0 + 2 * WORD_BYTES, "{pos}");
                let fp_saved = direction == Direction::BaselineToOptimized
                    && pos >= a.frame_pos()
                    && pos <= a.stop_pos();
                let fp = if fp_saved {
                    usize::try_from(CALLER_FP).unwrap()
                } else {
                    0x42
                };
                assert_eq!(caller.fp, fp, "{pos}");
            }
        }
    }

    #[test]
    fn not_at_stop_point() {
        let a = generate(Direction::BaselineToOptimized, "(IR)R");
        let cursor = Cursor {
            ip: CODE_START + a.frame_pos(),
            sp: 0x7fff_0000,
            fp: 0,
            top_frame: false,
        };
        assert_eq!(
            walk_through_adapter(&a, CODE_START, &cursor, &SnapshotMemory::new()),
            Err(WalkError::NotAtStopPoint {
                pos: a.frame_pos(),
                stop_pos: a.stop_pos()
            })
        );
        let cursor = Cursor {
            ip: CODE_START - 1,
            ..cursor
        };
        assert_eq!(
            walk_through_adapter(&a, CODE_START, &cursor, &SnapshotMemory::new()),
            Err(WalkError::NotAdapterCode(CODE_START - 1))
        );
    }

    #[test]
    fn mid_instruction() {
        let a = generate(Direction::BaselineToOptimized, "(IR)R");
        // The second byte of the `add rsp, 8` after `leave`.
        let pos = a.stop_pos() + 2;
        let byte = a.code()[pos];
        let cursor = Cursor {
            ip: CODE_START + pos,
            sp: 0x7fff_0000,
            fp: 0,
            top_frame: true,
        };
        assert_eq!(
            walk_through_adapter(&a, CODE_START, &cursor, &SnapshotMemory::new()),
            Err(WalkError::DecodeMismatch { pos, byte })
        );
    }

    #[test]
    fn describe() {
        let a = generate(Direction::OptimizedToBaseline, "(JJJJJJJ)V");
        let sp0 = 0x7fff_1000;
        let (sp, mem) = simulate(&a, sp0, a.stop_pos());
        let cursor = Cursor {
            ip: CODE_START + a.stop_pos(),
            sp,
            fp: 0,
            top_frame: false,
        };
        let d = describe_adapter_frame(&a, CODE_START, &cursor, &mem).unwrap();
        let f = a.layout().total_size();
        assert_eq!(d.frame_base, sp);
        assert_eq!(d.return_address_slot, sp + f);
        assert_eq!(d.saved_fp_slot, None);
        assert_eq!(d.slots.len(), f / WORD_BYTES + 1);
        assert_eq!(d.slots[0].name, "stack arg 0");
        let last = &d.slots[d.slots.len() - 1];
        assert_eq!(last.name, "return address");
        assert_eq!(last.value, CALLER_IP);
        let body = &d.slots[d.slots.len() - 2];
        assert_eq!(body.name, "prologue return");
        assert_eq!(body.value, BODY);
    }

    #[test]
    fn references() {
        // The fourth and fifth arguments are optimized stack arguments.
        let a = generate(
            Direction::BaselineToOptimized,
            "(JJJJJJLjava/lang/Object;ILjava/lang/String;)V",
        );
        let sp = 0x7fff_0000;
        let cursor = Cursor {
            ip: CODE_START + a.stop_pos(),
            sp,
            fp: 0,
            top_frame: false,
        };
        let mut bm = StackBitmap::new(sp - 4 * WORD_BYTES, 64);
        prepare_reference_map(&a, CODE_START, &cursor, &mut bm).unwrap();
        assert_eq!(
            bm.iter_set().collect::<Vec<_>>(),
            [sp, sp + 2 * WORD_BYTES]
        );
        let cursor = Cursor {
            ip: CODE_START,
            ..cursor
        };
        assert!(prepare_reference_map(&a, CODE_START, &cursor, &mut bm).is_err());
    }
}
