//! The x64 adapter generator.
//!
//! The baseline convention passes every argument on the stack, pushed in order by the caller and
//! popped by the callee. The optimized convention follows the SysV x64 ABI's register assignment
//! and stack alignment, with the caller popping stack arguments.
//!
//! Two registers are reserved for adapters and must never be used to pass arguments: `rax` holds
//! the address of the callee's body, and `r11` is used to copy values from one stack slot to
//! another.

use super::{AdapterCodeGenerator, CompilationError, Prologue};
use crate::{
    abi::{AbiDescriptor, Convention, StackArgOrder},
    adapter::{Direction, GeneratedAdapter},
    kind::Signature,
};

mod adapter;
pub(crate) mod disasm;
mod prologue;

pub use prologue::{BASELINE_ENTRY, BODY_OFFSET, OPTIMIZED_ENTRY};

/// The x64 SysV ABI requires a 16-byte aligned stack prior to any call.
const SYSV_CALL_STACK_ALIGN: usize = 16;

/// The size of a 64-bit register in bytes.
const REG64_BYTESIZE: usize = 8;

/// The scratch register holding the address of the callee body.
const BODY_REG: u8 = 0;
/// The scratch register used for stack to stack copies.
const SCRATCH_REG: u8 = 11;

pub static BASELINE_ABI: AbiDescriptor = AbiDescriptor {
    convention: Convention::Baseline,
    int_regs: &[],
    float_regs: &[],
    slot_size: REG64_BYTESIZE,
    stack_align: SYSV_CALL_STACK_ALIGN,
    // A baseline callee's return address is pushed to an aligned slot.
    call_sp_bias: REG64_BYTESIZE,
    stack_order: StackArgOrder::CallerPushed,
    saves_frame_pointer: false,
    callee_pops: true,
};

pub static OPTIMIZED_ABI: AbiDescriptor = AbiDescriptor {
    convention: Convention::Optimized,
    // rdi, rsi, rdx, rcx, r8, r9
    int_regs: &[7, 6, 2, 1, 8, 9],
    // xmm0..xmm7
    float_regs: &[0, 1, 2, 3, 4, 5, 6, 7],
    slot_size: REG64_BYTESIZE,
    stack_align: SYSV_CALL_STACK_ALIGN,
    call_sp_bias: 0,
    stack_order: StackArgOrder::Ascending,
    saves_frame_pointer: true,
    callee_pops: false,
};

static_assertions::const_assert!(SYSV_CALL_STACK_ALIGN % REG64_BYTESIZE == 0);

/// The names of the general purpose registers, indexed by register number.
const GP_REG_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

fn gp_reg_name(reg: u8) -> &'static str {
    GP_REG_NAMES[usize::from(reg)]
}

/// Push `n` bytes of NOP-equivalent instructions. This may or may not be literal `NOP`s: higher
/// values will lead to different sequences. In all cases, the generated code will have no runtime
/// effect.
fn push_nops(asm: &mut impl Extend<u8>, mut n: usize) {
    // From https://en.wikipedia.org/wiki/NOP_(code)
    while n > 0 {
        match n {
            1 => asm.extend([0x90]),
            2 => asm.extend([0x66, 0x90]),
            3 => asm.extend([0x0F, 0x1F, 0x00]),
            4 => asm.extend([0x0F, 0x1F, 0x40, 0x00]),
            5 => asm.extend([0x0F, 0x1F, 0x44, 0x00, 0x00]),
            6 => asm.extend([0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00]),
            7 => asm.extend([0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00]),
            8 => asm.extend([0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]),
            _ => {
                asm.extend([0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]);
                n -= 9;
                continue;
            }
        }
        break;
    }
}

/// Generates adapters between the x64 baseline and optimized conventions.
pub struct X64AdapterGenerator;

impl X64AdapterGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl AdapterCodeGenerator for X64AdapterGenerator {
    fn abi(&self, conv: Convention) -> &AbiDescriptor {
        match conv {
            Convention::Baseline => &BASELINE_ABI,
            Convention::Optimized => &OPTIMIZED_ABI,
        }
    }

    fn generate(
        &self,
        direction: Direction,
        sig: &Signature,
    ) -> Result<GeneratedAdapter, CompilationError> {
        adapter::Assemble::new(
            direction,
            sig,
            self.abi(direction.source()),
            self.abi(direction.destination()),
        )
        .codegen()
    }

    fn prologue(&self, callee: Convention, adapted: bool) -> Prologue {
        prologue::emit(callee, adapted)
    }

    fn forwarding_stub(&self, addr: usize, target: usize) -> Option<Vec<u8>> {
        prologue::forwarding_stub(addr, target)
    }

    fn forwarding_stub_size(&self) -> usize {
        prologue::FORWARDING_STUB_SIZE
    }
}
