//! The layout of an adapter's frame.
//!
//! Offsets are relative to the adapter's stack pointer at its call into the callee body (the
//! "stop point"). From the top of the frame downwards, a frame contains:
//!
//! ```text
//!   total_size      : return address into the adapter's caller (not part of the frame)
//!   total_size - 8  : the callee body address pushed by the method prologue's call
//!   total_size - 16 : the caller's frame pointer (only if the destination saves one)
//!   ...             : alignment padding
//!   0               : the outgoing stack arguments
//! ```

use crate::{
    abi::{AbiDescriptor, StackArgOrder},
    adapter::Direction,
    kind::WORD_BYTES,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameLayout {
    direction: Direction,
    /// The size of the frame, excluding the caller's return address.
    total_size: usize,
    /// How many bytes of outgoing stack arguments are at the bottom of the frame?
    stack_arg_size: usize,
    /// The destination convention's layout of the outgoing stack arguments.
    stack_order: StackArgOrder,
    saves_frame_pointer: bool,
}

impl FrameLayout {
    /// Lay out the frame of a `direction` adapter which must pass `stack_arg_size` bytes of
    /// arguments on the stack to a callee using the convention `dst`.
    pub fn new(direction: Direction, stack_arg_size: usize, dst: &AbiDescriptor) -> Self {
        let fp_slot = if dst.saves_frame_pointer {
            WORD_BYTES
        } else {
            0
        };
        let total_size = (stack_arg_size + fp_slot + WORD_BYTES).next_multiple_of(dst.stack_align);
        Self {
            direction,
            total_size,
            stack_arg_size,
            stack_order: dst.stack_order,
            saves_frame_pointer: dst.saves_frame_pointer,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn stack_arg_size(&self) -> usize {
        self.stack_arg_size
    }

    /// The offset of the slot holding the return address into the adapter's caller.
    pub fn return_address_offset(&self) -> usize {
        self.total_size
    }

    /// The offset of the slot holding the callee body's address.
    pub fn body_address_offset(&self) -> usize {
        self.total_size - WORD_BYTES
    }

    /// The offset of the slot holding the caller's frame pointer, if this frame saves it.
    pub fn saved_fp_offset(&self) -> Option<usize> {
        self.saves_frame_pointer
            .then(|| self.total_size - 2 * WORD_BYTES)
    }

    /// How many slots does this frame's reference map cover?
    pub fn refmap_slots(&self) -> usize {
        self.total_size / WORD_BYTES
    }

    /// A human readable name for the slot at `off`, for debuggers and logs.
    pub fn slot_name(&self, off: usize) -> String {
        if off == self.return_address_offset() {
            "return address".to_owned()
        } else if off > self.return_address_offset() {
            "caller frame".to_owned()
        } else if off == self.body_address_offset() {
            "prologue return".to_owned()
        } else if Some(off) == self.saved_fp_offset() {
            "caller's FP".to_owned()
        } else if off < self.stack_arg_size {
            let slot = match self.stack_order {
                StackArgOrder::Ascending => off / WORD_BYTES,
                StackArgOrder::CallerPushed => (self.stack_arg_size - off) / WORD_BYTES - 1,
            };
            format!("stack arg {slot}")
        } else {
            "alignment pad".to_owned()
        }
    }
}
