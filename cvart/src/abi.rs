//! Calling-convention descriptions and the mapping from a signature's arguments to the locations
//! a convention assigns them.

use crate::{
    compile::CompilationError,
    kind::{Kind, MAX_ADAPTER_ARGS, Signature},
};
use strum::Display;
use typed_index_collections::TiVec;

/// The two calling conventions an adapter bridges.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum Convention {
    /// Every argument is pushed on the stack by the caller and popped by the callee.
    #[strum(to_string = "baseline")]
    Baseline,
    /// Arguments are passed in registers where possible, spilling onto the stack. The caller pops
    /// any stack arguments.
    #[strum(to_string = "optimized")]
    Optimized,
}

/// How a convention lays out the arguments that don't fit in registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackArgOrder {
    /// The first stack argument is at the lowest address.
    Ascending,
    /// Arguments are pushed in order, so the first is at the highest address.
    CallerPushed,
}

/// The location of one argument under a given convention.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TargetLocation {
    /// An index into [AbiDescriptor::int_regs].
    IntegerRegister(usize),
    /// An index into [AbiDescriptor::float_regs].
    FloatingPointRegister(usize),
    /// A stack slot index, counting from the first stack argument slot.
    StackSlot(usize),
}

/// The index of an argument within a [Signature].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ArgIdx(u8);

impl ArgIdx {
    pub fn new(v: usize) -> Result<Self, CompilationError> {
        u8::try_from(v)
            .ok()
            .filter(|x| usize::from(*x) < MAX_ADAPTER_ARGS)
            .map(Self)
            .ok_or_else(|| CompilationError::LimitExceeded("Argument index overflowed".into()))
    }
}

impl From<usize> for ArgIdx {
    /// Required for TiVec. **DO NOT USE INTERNALLY as this can `panic`!** Instead, use
    /// [Self::new].
    fn from(v: usize) -> Self {
        Self::new(v).unwrap()
    }
}

impl From<ArgIdx> for usize {
    // Required for TiVec.
    fn from(v: ArgIdx) -> Self {
        usize::from(v.0)
    }
}

/// The parts of a calling convention that adapters need to know about.
#[derive(Debug)]
pub struct AbiDescriptor {
    pub convention: Convention,
    /// Integer argument registers, in assignment order, as machine register numbers.
    pub int_regs: &'static [u8],
    /// Floating point argument registers, in assignment order, as machine register numbers.
    pub float_regs: &'static [u8],
    /// The size of a stack argument slot in bytes.
    pub slot_size: usize,
    /// The alignment, in bytes, the stack must have at a call.
    pub stack_align: usize,
    /// The value of `sp % stack_align` immediately before a call instruction.
    pub call_sp_bias: usize,
    pub stack_order: StackArgOrder,
    /// Does an adapter entering this convention save the caller's frame pointer?
    pub saves_frame_pointer: bool,
    /// Does the callee pop its own stack arguments?
    pub callee_pops: bool,
}

impl AbiDescriptor {
    /// The offset, relative to the stack pointer at the call, of the argument in stack slot
    /// `slot` occupying `nslots` slots, when `total_slots` slots are passed on the stack.
    pub fn stack_offset(&self, total_slots: usize, slot: usize, nslots: usize) -> usize {
        debug_assert!(slot + nslots <= total_slots);
        match self.stack_order {
            StackArgOrder::Ascending => slot * self.slot_size,
            StackArgOrder::CallerPushed => (total_slots - slot - nslots) * self.slot_size,
        }
    }
}

/// Assign each argument of `sig` a location under `abi`. Integer-like and floating point
/// arguments consume their own register classes independently: once a class is exhausted,
/// further arguments of that class take consecutive stack slots.
pub fn locations(sig: &Signature, abi: &AbiDescriptor) -> TiVec<ArgIdx, TargetLocation> {
    let mut next_int = 0;
    let mut next_float = 0;
    let mut next_slot = 0;
    let mut locs = TiVec::with_capacity(sig.args().len());
    for k in sig.args() {
        let loc = if k.is_float() && next_float < abi.float_regs.len() {
            next_float += 1;
            TargetLocation::FloatingPointRegister(next_float - 1)
        } else if !k.is_float() && next_int < abi.int_regs.len() {
            next_int += 1;
            TargetLocation::IntegerRegister(next_int - 1)
        } else {
            next_slot += k.stack_slots(abi.slot_size);
            TargetLocation::StackSlot(next_slot - k.stack_slots(abi.slot_size))
        };
        locs.push(loc);
    }
    locs
}

/// The number of stack slots used by the arguments in `locs`.
pub fn stack_arg_slots(
    sig: &Signature,
    abi: &AbiDescriptor,
    locs: &TiVec<ArgIdx, TargetLocation>,
) -> usize {
    sig.args()
        .iter()
        .zip(locs.iter())
        .filter_map(|(k, l)| match l {
            TargetLocation::StackSlot(s) => Some(s + k.stack_slots(abi.slot_size)),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

/// The number of bytes of stack arguments `sig` needs under `abi`.
pub fn stack_arg_size(sig: &Signature, abi: &AbiDescriptor) -> usize {
    stack_arg_slots(sig, abi, &locations(sig, abi)) * abi.slot_size
}

/// The kind of the argument at `idx`.
pub(crate) fn arg_kind(sig: &Signature, idx: ArgIdx) -> Kind {
    sig.args()[usize::from(idx)]
}

#[cfg(test)]
mod tests {
    use super::*;

    static TWO_REGS: AbiDescriptor = AbiDescriptor {
        convention: Convention::Optimized,
        int_regs: &[7, 6],
        float_regs: &[0],
        slot_size: 8,
        stack_align: 16,
        call_sp_bias: 0,
        stack_order: StackArgOrder::Ascending,
        saves_frame_pointer: true,
        callee_pops: false,
    };

    static ALL_STACK: AbiDescriptor = AbiDescriptor {
        convention: Convention::Baseline,
        int_regs: &[],
        float_regs: &[],
        slot_size: 8,
        stack_align: 16,
        call_sp_bias: 8,
        stack_order: StackArgOrder::CallerPushed,
        saves_frame_pointer: false,
        callee_pops: true,
    };

    #[test]
    fn register_classes_are_independent() {
        let sig = "(IDJFRD)V".parse::<Signature>().unwrap();
        let locs = locations(&sig, &TWO_REGS);
        assert_eq!(
            locs.iter().copied().collect::<Vec<_>>(),
            vec![
                TargetLocation::IntegerRegister(0),
                TargetLocation::FloatingPointRegister(0),
                TargetLocation::IntegerRegister(1),
                TargetLocation::StackSlot(0),
                TargetLocation::StackSlot(1),
                TargetLocation::StackSlot(2),
            ]
        );
        assert_eq!(stack_arg_slots(&sig, &TWO_REGS, &locs), 3);
        assert_eq!(stack_arg_size(&sig, &TWO_REGS), 24);
        assert_eq!(arg_kind(&sig, ArgIdx::new(4).unwrap()), Kind::Reference);
        // Locations are a pure function of their inputs.
        assert_eq!(locs, locations(&sig, &TWO_REGS));
    }

    #[test]
    fn all_stack() {
        let sig = "(IJR)V".parse::<Signature>().unwrap();
        let locs = locations(&sig, &ALL_STACK);
        assert_eq!(
            locs.iter().copied().collect::<Vec<_>>(),
            vec![
                TargetLocation::StackSlot(0),
                TargetLocation::StackSlot(1),
                TargetLocation::StackSlot(2),
            ]
        );
        assert_eq!(stack_arg_size(&sig, &ALL_STACK), 24);
        // The first argument is pushed first, so it ends up deepest.
        assert_eq!(ALL_STACK.stack_offset(3, 0, 1), 16);
        assert_eq!(ALL_STACK.stack_offset(3, 2, 1), 0);
        assert_eq!(TWO_REGS.stack_offset(3, 0, 1), 0);
        assert_eq!(TWO_REGS.stack_offset(3, 2, 1), 16);
        assert_eq!(stack_arg_size(&"()V".parse().unwrap(), &ALL_STACK), 0);
    }

    #[test]
    fn arg_idx_bounds() {
        assert!(ArgIdx::new(MAX_ADAPTER_ARGS - 1).is_ok());
        assert!(ArgIdx::new(MAX_ADAPTER_ARGS).is_err());
        assert_eq!(usize::from(ArgIdx::from(3)), 3);
    }
}
