//! Work out how much of an x64 adapter's frame exists at an arbitrary instruction.
//!
//! Adapters only ever change the stack pointer with a handful of instructions, so rather than
//! keeping per-instruction metadata we decode the instruction the thread is about to execute.

use super::{FrameState, WalkError};
use crate::{adapter::GeneratedAdapter, kind::WORD_BYTES};

const ENTER: u8 = 0xC8;
const LEAVE: u8 = 0xC9;
const RET_IMM16: u8 = 0xC2;
const RET: u8 = 0xC3;
const REX_W: u8 = 0x48;
/// `add/sub r/m64, imm8`.
const ALU_IMM8: u8 = 0x83;
/// `add/sub r/m64, imm32`.
const ALU_IMM32: u8 = 0x81;
/// ModRM for `sub rsp, imm`.
const MODRM_SUB_RSP: u8 = 0xEC;
/// ModRM for `add rsp, imm`.
const MODRM_ADD_RSP: u8 = 0xC4;

/// The state of `adapter`'s frame when the thread is about to execute the instruction at offset
/// `pos`. If `top_frame` is false, the thread must be stopped in a call from the adapter.
pub(super) fn frame_state(
    adapter: &GeneratedAdapter,
    pos: usize,
    top_frame: bool,
) -> Result<FrameState, WalkError> {
    let layout = adapter.layout();
    let established = FrameState {
        ra_offset: layout.return_address_offset(),
        saved_fp_offset: layout.saved_fp_offset(),
    };
    if !top_frame {
        if pos != adapter.stop_pos() {
            return Err(WalkError::NotAtStopPoint {
                pos,
                stop_pos: adapter.stop_pos(),
            });
        }
        return Ok(established);
    }
    // Nothing has been pushed: the body address is on top of the return address.
    let entry = FrameState {
        ra_offset: WORD_BYTES,
        saved_fp_offset: None,
    };
    if pos == 0 {
        return Ok(entry);
    }
    if pos >= adapter.frame_pos() && pos < adapter.stop_pos() {
        return Ok(established);
    }

    let code = adapter.code();
    let byte = |i: usize| code.get(pos + i).copied();
    let mismatch = WalkError::DecodeMismatch {
        pos,
        byte: byte(0).unwrap_or(0),
    };
    match byte(0) {
        Some(ENTER) => Ok(entry),
        // `leave` is the first instruction after the call: the frame is still intact.
        Some(LEAVE) => Ok(established),
        Some(RET_IMM16) | Some(RET) => Ok(FrameState {
            ra_offset: 0,
            saved_fp_offset: None,
        }),
        Some(REX_W) => {
            let imm = match byte(1) {
                Some(ALU_IMM8) => byte(3).map(|x| i64::from(x as i8)),
                Some(ALU_IMM32) => code
                    .get(pos + 3..pos + 7)
                    .map(|x| i64::from(i32::from_le_bytes([x[0], x[1], x[2], x[3]]))),
                _ => None,
            };
            match (byte(2), imm) {
                (Some(MODRM_SUB_RSP), Some(_)) => Ok(entry),
                // Whatever remains of the frame below the return address is about to be popped.
                (Some(MODRM_ADD_RSP), Some(imm)) => Ok(FrameState {
                    ra_offset: usize::try_from(imm).map_err(|_| mismatch)?,
                    saved_fp_offset: None,
                }),
                _ => Err(mismatch),
            }
        }
        _ => Err(mismatch),
    }
}
