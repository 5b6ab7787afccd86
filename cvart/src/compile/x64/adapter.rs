//! Generate the machine code for an adapter.
//!
//! On entry to an adapter, `[rsp]` holds the address of the callee's body (pushed by the call in
//! the callee's prologue) and `[rsp + 8]` holds the return address into the adapter's caller. The
//! adapter builds a frame, moves each argument from where the source convention put it to where
//! the destination convention expects it, calls the body, and then returns to the caller on the
//! body's behalf.

use super::{BODY_REG, REG64_BYTESIZE, SCRATCH_REG, gp_reg_name};
use crate::{
    abi::{self, AbiDescriptor, ArgIdx, TargetLocation},
    adapter::{Direction, GeneratedAdapter},
    compile::CompilationError,
    frame::FrameLayout,
    kind::{Kind, MAX_ADAPTER_ARGS, Signature},
};
use cvarefmap::RefMapBuilder;
use dynasmrt::{DynasmApi, VecAssembler, dynasm, x64::X64Relocation};
use std::collections::BTreeMap;
use typed_index_collections::TiVec;

/// `enter imm16, imm8`.
const ENTER: u8 = 0xC8;
/// `ret imm16`.
const RET_IMM16: u8 = 0xC2;

pub(super) struct Assemble<'a> {
    asm: VecAssembler<X64Relocation>,
    direction: Direction,
    sig: &'a Signature,
    src: &'a AbiDescriptor,
    dst: &'a AbiDescriptor,
    /// Comments to be shown when disassembling the adapter.
    comments: BTreeMap<usize, Vec<String>>,
}

impl<'a> Assemble<'a> {
    pub(super) fn new(
        direction: Direction,
        sig: &'a Signature,
        src: &'a AbiDescriptor,
        dst: &'a AbiDescriptor,
    ) -> Self {
        Self {
            asm: VecAssembler::new(0),
            direction,
            sig,
            src,
            dst,
            comments: BTreeMap::new(),
        }
    }

    /// Add a comment to the instruction about to be emitted.
    fn comment(&mut self, line: String) {
        self.comments
            .entry(self.asm.offset().0)
            .or_default()
            .push(line);
    }

    pub(super) fn codegen(mut self) -> Result<GeneratedAdapter, CompilationError> {
        if self.sig.args().len() > MAX_ADAPTER_ARGS {
            return Err(CompilationError::LimitExceeded(format!(
                "{} has more than {MAX_ADAPTER_ARGS} arguments",
                self.sig
            )));
        }
        let src_locs = abi::locations(self.sig, self.src);
        let dst_locs = abi::locations(self.sig, self.dst);
        let src_slots = abi::stack_arg_slots(self.sig, self.src, &src_locs);
        let dst_slots = abi::stack_arg_slots(self.sig, self.dst, &dst_locs);
        let layout = FrameLayout::new(self.direction, dst_slots * self.dst.slot_size, self.dst);
        let frame_size = layout.total_size();
        // A caller which keeps its own convention's alignment must leave the callee body with the
        // alignment the destination convention requires.
        debug_assert_eq!(
            (self.src.call_sp_bias + self.src.stack_align - REG64_BYTESIZE) % self.src.stack_align,
            (self.dst.call_sp_bias + frame_size) % self.dst.stack_align
        );

        self.comment(format!("{}-Adapter{}", self.direction, self.sig));
        self.comment("callee body address".to_owned());
        dynasm!(self.asm; mov Rq(BODY_REG), QWORD [rsp]);

        self.comment(format!("adapter frame: {frame_size} bytes"));
        match self.direction {
            Direction::BaselineToOptimized => {
                // `enter` pushes the caller's frame pointer on top of the body address.
                let explicit = u16::try_from(frame_size - 2 * REG64_BYTESIZE).map_err(|_| {
                    CompilationError::LimitExceeded(format!("adapter frame of {frame_size} bytes"))
                })?;
                let [lo, hi] = explicit.to_le_bytes();
                self.asm.extend([ENTER, lo, hi, 0]);
            }
            Direction::OptimizedToBaseline => {
                let explicit = i32::try_from(frame_size - REG64_BYTESIZE).map_err(|_| {
                    CompilationError::LimitExceeded(format!("adapter frame of {frame_size} bytes"))
                })?;
                dynasm!(self.asm; sub rsp, DWORD explicit);
            }
        }
        let frame_pos = self.asm.offset().0;

        // Incoming stack arguments are above the return address into the caller.
        let src_base = frame_size + REG64_BYTESIZE;
        let mut refmap = RefMapBuilder::new(layout.refmap_slots());
        for i in (0..self.sig.args().len()).rev() {
            let idx = ArgIdx::new(i)?;
            let kind = abi::arg_kind(self.sig, idx);
            let src = src_locs[idx];
            let dst = dst_locs[idx];
            let src_off = self.stack_offset(self.src, &src_locs, src_slots, idx, kind, src_base);
            let dst_off = self.stack_offset(self.dst, &dst_locs, dst_slots, idx, kind, 0);
            self.comment(format!(
                "arg {i} ({kind:?}): {} -> {}",
                self.loc_name(self.src, src, src_off),
                self.loc_name(self.dst, dst, dst_off)
            ));
            self.adapt_argument(kind, src, dst, src_off, dst_off)?;
            if let Some(off) = dst_off.filter(|_| kind.is_reference()) {
                refmap.set(off / REG64_BYTESIZE);
            }
        }

        self.comment("stop point".to_owned());
        let call_pos = self.asm.offset().0;
        dynasm!(self.asm; call rax);
        let call_size = self.asm.offset().0 - call_pos;

        match self.direction {
            Direction::BaselineToOptimized => {
                let popped = if self.src.callee_pops {
                    src_slots * self.src.slot_size
                } else {
                    0
                };
                let popped = u16::try_from(popped).map_err(|_| {
                    CompilationError::LimitExceeded(format!("{popped} bytes of arguments"))
                })?;
                let [lo, hi] = popped.to_le_bytes();
                // `leave` restores the stack pointer to the slot holding the body address: the
                // return address into the baseline caller is one slot higher up.
                self.comment("return to baseline caller".to_owned());
                dynasm!(self.asm
                    ; leave
                    ; add rsp, 8
                );
                self.asm.extend([RET_IMM16, lo, hi]);
            }
            Direction::OptimizedToBaseline => {
                // Skip whatever the callee didn't pop: any padding and the body address.
                let popped = if self.dst.callee_pops {
                    layout.stack_arg_size()
                } else {
                    0
                };
                let adjust = i32::try_from(frame_size - popped).map_err(|_| {
                    CompilationError::LimitExceeded(format!("adapter frame of {frame_size} bytes"))
                })?;
                self.comment("return to optimized caller".to_owned());
                dynasm!(self.asm
                    ; add rsp, DWORD adjust
                    ; ret
                );
            }
        }

        let code = self
            .asm
            .finalize()
            .map_err(|e| CompilationError::InternalError(format!("{e:?}")))?;
        Ok(GeneratedAdapter {
            direction: self.direction,
            sig: self.sig.clone(),
            code: code.into_boxed_slice(),
            layout,
            call_pos,
            call_size,
            frame_pos,
            refmap: refmap.build(),
            comments: self.comments,
        })
    }

    /// If argument `idx` is on the stack under `abi`, return its offset from the adapter's stack
    /// pointer at the stop point.
    fn stack_offset(
        &self,
        abi: &AbiDescriptor,
        locs: &TiVec<ArgIdx, TargetLocation>,
        total_slots: usize,
        idx: ArgIdx,
        kind: Kind,
        base: usize,
    ) -> Option<usize> {
        match locs[idx] {
            TargetLocation::StackSlot(s) => {
                Some(base + abi.stack_offset(total_slots, s, kind.stack_slots(abi.slot_size)))
            }
            _ => None,
        }
    }

    fn loc_name(&self, abi: &AbiDescriptor, loc: TargetLocation, off: Option<usize>) -> String {
        match (loc, off) {
            (TargetLocation::IntegerRegister(r), _) => gp_reg_name(abi.int_regs[r]).to_owned(),
            (TargetLocation::FloatingPointRegister(r), _) => format!("xmm{}", abi.float_regs[r]),
            (TargetLocation::StackSlot(_), Some(off)) => format!("[rsp+{off:#x}]"),
            (TargetLocation::StackSlot(s), None) => format!("stack slot {s}"),
        }
    }

    /// Move one argument of kind `kind` from `src` to `dst`. Stack locations are at the offsets
    /// `src_off` and `dst_off` respectively.
    fn adapt_argument(
        &mut self,
        kind: Kind,
        src: TargetLocation,
        dst: TargetLocation,
        src_off: Option<usize>,
        dst_off: Option<usize>,
    ) -> Result<(), CompilationError> {
        let offset = |off: Option<usize>| {
            off.and_then(|x| i32::try_from(x).ok()).ok_or_else(|| {
                CompilationError::LimitExceeded(format!("stack offset {off:?}"))
            })
        };
        match (src, dst) {
            (TargetLocation::StackSlot(_), TargetLocation::IntegerRegister(r)) => {
                let off = offset(src_off)?;
                let reg = self.dst.int_regs[r];
                match kind {
                    Kind::Byte => dynasm!(self.asm; movsx Rq(reg), BYTE [rsp + off]),
                    Kind::Short => dynasm!(self.asm; movsx Rq(reg), WORD [rsp + off]),
                    Kind::Boolean => dynasm!(self.asm; movzx Rq(reg), BYTE [rsp + off]),
                    Kind::Char => dynasm!(self.asm; movzx Rq(reg), WORD [rsp + off]),
                    Kind::Int => dynasm!(self.asm; movsxd Rq(reg), DWORD [rsp + off]),
                    Kind::Long | Kind::Word | Kind::Reference => {
                        dynasm!(self.asm; mov Rq(reg), QWORD [rsp + off])
                    }
                    Kind::Float | Kind::Double => return Err(unadaptable(kind, src, dst)),
                }
            }
            (TargetLocation::StackSlot(_), TargetLocation::FloatingPointRegister(r)) => {
                let off = offset(src_off)?;
                let reg = self.dst.float_regs[r];
                match kind {
                    Kind::Float => dynasm!(self.asm; movss Rx(reg), [rsp + off]),
                    Kind::Double => dynasm!(self.asm; movsd Rx(reg), [rsp + off]),
                    _ => return Err(unadaptable(kind, src, dst)),
                }
            }
            (TargetLocation::IntegerRegister(r), TargetLocation::StackSlot(_)) => {
                let off = offset(dst_off)?;
                let reg = self.src.int_regs[r];
                match kind {
                    Kind::Long | Kind::Word | Kind::Reference => {
                        dynasm!(self.asm; mov QWORD [rsp + off], Rq(reg))
                    }
                    Kind::Float | Kind::Double => return Err(unadaptable(kind, src, dst)),
                    _ => dynasm!(self.asm; mov DWORD [rsp + off], Rd(reg)),
                }
            }
            (TargetLocation::FloatingPointRegister(r), TargetLocation::StackSlot(_)) => {
                let off = offset(dst_off)?;
                let reg = self.src.float_regs[r];
                match kind {
                    Kind::Float => dynasm!(self.asm; movss [rsp + off], Rx(reg)),
                    Kind::Double => dynasm!(self.asm; movsd [rsp + off], Rx(reg)),
                    _ => return Err(unadaptable(kind, src, dst)),
                }
            }
            (TargetLocation::StackSlot(_), TargetLocation::StackSlot(_)) => {
                let src_off = offset(src_off)?;
                let dst_off = offset(dst_off)?;
                if kind.is_wide() {
                    dynasm!(self.asm
                        ; mov Rq(SCRATCH_REG), QWORD [rsp + src_off]
                        ; mov QWORD [rsp + dst_off], Rq(SCRATCH_REG)
                    );
                } else {
                    dynasm!(self.asm
                        ; mov Rd(SCRATCH_REG), DWORD [rsp + src_off]
                        ; mov DWORD [rsp + dst_off], Rd(SCRATCH_REG)
                    );
                }
            }
            _ => return Err(unadaptable(kind, src, dst)),
        }
        Ok(())
    }
}

fn unadaptable(kind: Kind, src: TargetLocation, dst: TargetLocation) -> CompilationError {
    CompilationError::InternalError(format!(
        "unadaptable parameter location for {kind:?}: {src:?} -> {dst:?}"
    ))
}

#[cfg(test)]
mod tests {
    use crate::{
        adapter::{Direction, GeneratedAdapter},
        compile::{AdapterCodeGenerator, CompilationError, x64::X64AdapterGenerator},
        kind::{Kind, MAX_ADAPTER_ARGS, Signature},
    };
    use fm::FMBuilder;
    use regex::Regex;
    use std::sync::LazyLock;

    static CALL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^call ").unwrap());
    static RET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^ret\b").unwrap());

    fn generate(direction: Direction, sig: &str) -> GeneratedAdapter {
        X64AdapterGenerator::new()
            .generate(direction, &sig.parse::<Signature>().unwrap())
            .unwrap()
    }

    /// Test helper to use `fm` to match a disassembled adapter.
    fn match_asm(adapter: &GeneratedAdapter, ptn: &str) {
        let dis = adapter.disassemble(0, false).unwrap();
        // The disassembler alternates between upper- and lowercase hex, so lowercase both pattern
        // and text.
        let ptn = ptn.to_lowercase();
        let fmm = FMBuilder::new(&ptn).unwrap().build().unwrap();
        if let Err(e) = fmm.matches(&dis.to_lowercase()) {
            panic!("{e}\n{dis}");
        }
    }

    #[test]
    fn int_ref_to_ref() {
        let a = generate(Direction::BaselineToOptimized, "(IR)R");
        assert_eq!(a.layout().total_size(), 16);
        assert!(a.refmap().iter().next().is_none());
        let dis = a.disassemble(0, false).unwrap();
        assert_eq!(CALL_RE.find_iter(&dis).count(), 1);
        assert_eq!(RET_RE.find_iter(&dis).count(), 1);
        match_asm(
            &a,
            "
            ; BASELINE2OPT-Adapter(IR)R
            ; callee body address
            mov rax, [rsp]
            ; adapter frame: 16 bytes
            enter ...
            ; arg 1 (Reference): [rsp+0x18] -> rsi
            mov rsi, [rsp+0x18]
            ; arg 0 (Int): [rsp+0x20] -> rdi
            movsxd rdi, dword ptr [rsp+0x20]
            ; stop point
            call rax
            ; return to baseline caller
            leave
            add rsp, 0x08
            ret 0x10
        ",
        );
    }

    #[test]
    fn baseline_to_optimized_widths() {
        let a = generate(Direction::BaselineToOptimized, "(BZSCJFDW)V");
        match_asm(
            &a,
            "
            ...
            ; arg 7 (Word): ...
            mov r9, [rsp+...
            ; arg 6 (Double): ...
            movsd xmm1, ...
            ; arg 5 (Float): ...
            movss xmm0, ...
            ; arg 4 (Long): ...
            mov r8, ...
            ; arg 3 (Char): ...
            movzx rcx, word ptr ...
            ; arg 2 (Short): ...
            movsx rdx, word ptr ...
            ; arg 1 (Boolean): ...
            movzx rsi, byte ptr ...
            ; arg 0 (Byte): ...
            movsx rdi, byte ptr ...
            ...
        ",
        );
        assert_eq!(a.layout().total_size(), 16);
    }

    #[test]
    fn baseline_to_optimized_spills() {
        // Seven integer arguments: the last spills to the optimized stack.
        let a = generate(Direction::BaselineToOptimized, "(IIIIIIJ)V");
        assert_eq!(a.layout().stack_arg_size(), 8);
        assert_eq!(a.layout().total_size(), 32);
        match_asm(
            &a,
            "
            ...
            enter ...
            ; arg 6 (Long): [rsp+0x28] -> [rsp+0x0]
            mov r11, [rsp+0x28]
            mov [rsp...
            ...
            ret 0x38
        ",
        );
    }

    #[test]
    fn optimized_to_baseline() {
        let a = generate(Direction::OptimizedToBaseline, "(IDR)I");
        // Three baseline slots plus the body address, rounded up to 16 bytes.
        assert_eq!(a.layout().total_size(), 32);
        // The reference is the last argument, so it's in the lowest baseline slot.
        assert_eq!(a.refmap().iter().collect::<Vec<_>>(), vec![0]);
        match_asm(
            &a,
            "
            ; OPT2BASELINE-Adapter(IDR)I
            ; callee body address
            mov rax, [rsp]
            ; adapter frame: 32 bytes
            sub rsp, 0x18
            ; arg 2 (Reference): rsi -> [rsp+0x0]
            mov [rsp...
            ; arg 1 (Double): xmm0 -> [rsp+0x8]
            movsd ...
            ; arg 0 (Int): rdi -> [rsp+0x10]
            mov [rsp+0x10], edi
            ; stop point
            call rax
            ; return to optimized caller
            add rsp, 0x08
            ret
        ",
        );
    }

    #[test]
    fn optimized_to_baseline_padding_and_spills() {
        // Eight references: two arrive on the optimized stack, and the frame has one word of
        // padding.
        let a = generate(Direction::OptimizedToBaseline, "(RRRRRRRR)V");
        assert_eq!(a.layout().stack_arg_size(), 64);
        assert_eq!(a.layout().total_size(), 80);
        assert_eq!(a.refmap().count_ones(), 8);
        assert_eq!(a.refmap().len(), 10);
        match_asm(
            &a,
            "
            ...
            sub rsp, 0x48
            ; arg 7 (Reference): [rsp+0x60] -> [rsp+0x0]
            mov r11, [rsp+0x60]
            mov [rsp...
            ; arg 6 (Reference): [rsp+0x58] -> [rsp+0x8]
            ...
            call rax
            ; return to optimized caller
            add rsp, 0x10
            ret
        ",
        );
    }

    #[test]
    fn refmap_soundness() {
        // Only references that end up in destination stack slots are recorded.
        let a = generate(Direction::BaselineToOptimized, "(RRRRRRIRJR)V");
        assert_eq!(a.layout().stack_arg_size(), 32);
        assert_eq!(a.refmap().iter().collect::<Vec<_>>(), vec![1, 3]);
        let a = generate(Direction::BaselineToOptimized, "(RRRRRR)V");
        assert_eq!(a.refmap().count_ones(), 0);
    }

    #[test]
    fn frames_are_aligned() {
        let cg = X64AdapterGenerator::new();
        for sig in [
            "()V", "(I)V", "(J)J", "(R)R", "(IIIIII)V", "(IIIIIII)V", "(IIIIIIII)V", "(DDDDDDDDD)D",
            "(FFFFFFFFFF)V", "(RJRJRJRJRJRJ)R", "(BZSCIJFDWR)V",
        ] {
            let sig = sig.parse::<Signature>().unwrap();
            for d in [Direction::BaselineToOptimized, Direction::OptimizedToBaseline] {
                let a = cg.generate(d, &sig).unwrap();
                assert_eq!(a.layout().total_size() % 16, 0, "{a}");
                assert!(a.refmap().len() <= a.layout().total_size() / 8, "{a}");
                assert_eq!(a.code()[a.call_pos()..a.stop_pos()], [0xFF, 0xD0]);
            }
        }
    }

    #[test]
    fn external_refmap() {
        // Every argument lands on the baseline stack, so all 40 are recorded in a map too big to
        // store inline.
        let sig = Signature::new(vec![Kind::Reference; 40], None);
        let a = X64AdapterGenerator::new()
            .generate(Direction::OptimizedToBaseline, &sig)
            .unwrap();
        assert_eq!(a.layout().total_size(), 336);
        let m = a.refmap();
        assert!(!m.is_inline());
        assert_eq!(m.len(), 42);
        assert_eq!(m.count_ones(), 40);
        assert_eq!(m.iter().collect::<Vec<_>>(), (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn too_many_args() {
        let cg = X64AdapterGenerator::new();
        let sig = Signature::new(vec![Kind::Int; MAX_ADAPTER_ARGS + 1], None);
        assert!(matches!(
            cg.generate(Direction::BaselineToOptimized, &sig),
            Err(CompilationError::LimitExceeded(_))
        ));
        let sig = Signature::new(vec![Kind::Long; MAX_ADAPTER_ARGS], None);
        let a = cg.generate(Direction::OptimizedToBaseline, &sig).unwrap();
        assert_eq!(a.layout().stack_arg_size(), MAX_ADAPTER_ARGS * 8);
    }
}
