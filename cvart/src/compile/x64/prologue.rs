//! Method prologues and forwarding stubs.
//!
//! Every compiled method starts with a fixed 16 byte prologue providing one entry point per
//! convention:
//!
//! ```text
//!   +0  baseline entry:  jmp body  |  call <B2O adapter>
//!   +8  optimized entry: jmp body  |  call <O2B adapter>
//!   +16 body
//! ```
//!
//! The entry point for the convention the method was compiled with jumps straight to the body.
//! The other entry point calls an adapter: the call's return address falls through NOPs (and,
//! for the baseline entry, the optimized entry's jump) to the body, so the adapter can call the
//! return address to reach the body. Both relative branches have their displacements within one
//! aligned 8 byte word, so they can be atomically repointed.

use super::{REG64_BYTESIZE, push_nops};
use crate::{
    abi::Convention,
    compile::Prologue,
    patch::{CALL_OPCODE, JMP_OPCODE, REL32_INSN_SIZE, rel32},
};
use dynasmrt::{DynasmApi, VecAssembler, dynasm, x64::X64Relocation};

/// The offset of the entry point used by baseline callers.
pub const BASELINE_ENTRY: usize = 0;
/// The offset of the entry point used by optimized callers.
pub const OPTIMIZED_ENTRY: usize = REG64_BYTESIZE;
/// The offset of the method body.
pub const BODY_OFFSET: usize = 2 * REG64_BYTESIZE;

/// `lea rsp, [rsp + 8]` followed by `jmp rel32`.
pub(super) const FORWARDING_STUB_SIZE: usize = 5 + REL32_INSN_SIZE;

static_assertions::const_assert!(OPTIMIZED_ENTRY - BASELINE_ENTRY >= REL32_INSN_SIZE);

/// Push a relative branch at offset `from` of `buf` targeting offset `to`.
fn push_rel32(buf: &mut Vec<u8>, opcode: u8, to: usize) {
    let from = buf.len();
    // The prologue is far smaller than the range of a rel32.
    let disp = i32::try_from(to as isize - (from + REL32_INSN_SIZE) as isize).unwrap();
    buf.push(opcode);
    buf.extend(disp.to_le_bytes());
}

pub(super) fn emit(callee: Convention, adapted: bool) -> Prologue {
    let mut buf = Vec::with_capacity(BODY_OFFSET);
    let mut adapter_call = None;
    for (entry, conv) in [
        (BASELINE_ENTRY, Convention::Baseline),
        (OPTIMIZED_ENTRY, Convention::Optimized),
    ] {
        debug_assert_eq!(buf.len(), entry);
        if adapted && conv != callee {
            adapter_call = Some(entry);
            // Until linked, the call targets the instruction after it.
            push_rel32(&mut buf, CALL_OPCODE, entry + REL32_INSN_SIZE);
        } else {
            push_rel32(&mut buf, JMP_OPCODE, BODY_OFFSET);
        }
        let pad = entry + REG64_BYTESIZE - buf.len();
        push_nops(&mut buf, pad);
    }
    Prologue {
        code: buf,
        adapter_call,
    }
}

pub(super) fn forwarding_stub(addr: usize, target: usize) -> Option<Vec<u8>> {
    let mut asm = VecAssembler::<X64Relocation>::new(addr);
    // The call that reached this stub pushed a return address the target must not see.
    dynasm!(asm; lea rsp, [rsp + 8]);
    let jmp = addr + asm.offset().0;
    let disp = rel32(jmp, target).ok()?;
    asm.push(JMP_OPCODE);
    asm.extend(disp.to_le_bytes());
    let code = asm.finalize().ok()?;
    debug_assert_eq!(code.len(), FORWARDING_STUB_SIZE);
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compile::x64::disasm::match_asm, patch::is_patchable};

    #[test]
    fn optimized_method() {
        let p = emit(Convention::Optimized, true);
        assert_eq!(p.code.len(), BODY_OFFSET);
        assert_eq!(p.adapter_call, Some(BASELINE_ENTRY));
        assert_eq!(p.code[BASELINE_ENTRY], CALL_OPCODE);
        assert_eq!(p.code[OPTIMIZED_ENTRY], JMP_OPCODE);
        // The unlinked call targets the NOPs after it; the jump targets the body.
        assert_eq!(&p.code[1..5], &0i32.to_le_bytes());
        assert_eq!(&p.code[9..13], &3i32.to_le_bytes());
        match_asm(
            &p.code,
            "
            call ...
            nop ...
            jmp ...
            nop ...
        ",
        );
    }

    #[test]
    fn baseline_method() {
        let p = emit(Convention::Baseline, true);
        assert_eq!(p.adapter_call, Some(OPTIMIZED_ENTRY));
        assert_eq!(p.code[BASELINE_ENTRY], JMP_OPCODE);
        assert_eq!(p.code[OPTIMIZED_ENTRY], CALL_OPCODE);
        assert_eq!(&p.code[1..5], &11i32.to_le_bytes());
        assert_eq!(&p.code[9..13], &0i32.to_le_bytes());
        match_asm(
            &p.code,
            "
            jmp ...
            nop ...
            call ...
            nop ...
        ",
        );
    }

    #[test]
    fn unadapted_method() {
        for conv in [Convention::Baseline, Convention::Optimized] {
            let p = emit(conv, false);
            assert_eq!(p.adapter_call, None);
            assert_eq!(p.code[BASELINE_ENTRY], JMP_OPCODE);
            assert_eq!(p.code[OPTIMIZED_ENTRY], JMP_OPCODE);
        }
    }

    #[test]
    fn entries_are_patchable() {
        // Methods are loaded at 16 byte aligned addresses.
        for base in [0x1000, 0x7fff_0010] {
            assert!(is_patchable(base + BASELINE_ENTRY));
            assert!(is_patchable(base + OPTIMIZED_ENTRY));
        }
    }

    #[test]
    fn stub() {
        let s = forwarding_stub(0x1000, 0x2010).unwrap();
        assert_eq!(s.len(), FORWARDING_STUB_SIZE);
        assert_eq!(s[5], JMP_OPCODE);
        assert_eq!(&s[6..10], &0x1006i32.to_le_bytes());
        match_asm(
            &s,
            "
            lea rsp, [rsp+0x08]
            jmp ...
        ",
        );
        assert!(forwarding_stub(0x1000, 0x1000 + (1 << 32)).is_none());
    }
}
