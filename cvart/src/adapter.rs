//! Generated adapters.

use crate::{
    abi::Convention,
    compile::x64::disasm::AsmPrinter,
    frame::FrameLayout,
    kind::Signature,
};
use cvarefmap::RefMap;
use std::{collections::BTreeMap, error::Error, fmt};
use strum::Display;

/// Which way an adapter translates a call.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum Direction {
    /// A baseline caller calling an optimized callee.
    #[strum(to_string = "BASELINE2OPT")]
    BaselineToOptimized,
    /// An optimized caller calling a baseline callee.
    #[strum(to_string = "OPT2BASELINE")]
    OptimizedToBaseline,
}

impl Direction {
    /// The convention arguments arrive in.
    pub fn source(self) -> Convention {
        match self {
            Direction::BaselineToOptimized => Convention::Baseline,
            Direction::OptimizedToBaseline => Convention::Optimized,
        }
    }

    /// The convention arguments leave in.
    pub fn destination(self) -> Convention {
        match self {
            Direction::BaselineToOptimized => Convention::Optimized,
            Direction::OptimizedToBaseline => Convention::Baseline,
        }
    }

    /// The direction of the adapter that callers need to reach a method compiled with
    /// convention `callee`.
    pub fn entering(callee: Convention) -> Self {
        match callee {
            Convention::Optimized => Direction::BaselineToOptimized,
            Convention::Baseline => Direction::OptimizedToBaseline,
        }
    }
}

/// The machine code for one adapter, and everything a stack walker needs to know about it. Once
/// created, an adapter is never mutated.
#[derive(Debug)]
pub struct GeneratedAdapter {
    pub(crate) direction: Direction,
    pub(crate) sig: Signature,
    pub(crate) code: Box<[u8]>,
    pub(crate) layout: FrameLayout,
    /// The offset of the call into the callee body.
    pub(crate) call_pos: usize,
    /// The size in bytes of the call instruction at `call_pos`.
    pub(crate) call_size: usize,
    /// The offset of the first instruction executed with the frame fully established.
    pub(crate) frame_pos: usize,
    pub(crate) refmap: RefMap,
    /// Comments to be shown when disassembling the adapter.
    pub(crate) comments: BTreeMap<usize, Vec<String>>,
}

impl GeneratedAdapter {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn sig(&self) -> &Signature {
        &self.sig
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn call_pos(&self) -> usize {
        self.call_pos
    }

    pub fn call_size(&self) -> usize {
        self.call_size
    }

    /// The offset of the instruction the callee body returns to: the adapter's only stop point.
    pub fn stop_pos(&self) -> usize {
        self.call_pos + self.call_size
    }

    pub fn frame_pos(&self) -> usize {
        self.frame_pos
    }

    pub fn refmap(&self) -> &RefMap {
        &self.refmap
    }

    /// A name for this adapter, unique per direction and signature.
    pub fn description(&self) -> String {
        format!("{}-Adapter{}", self.direction, self.sig)
    }

    /// Disassemble this adapter as if it were loaded at `base`. If `with_addrs` is true, each
    /// instruction is prefixed with its address and offset.
    pub fn disassemble(&self, base: usize, with_addrs: bool) -> Result<String, Box<dyn Error>> {
        AsmPrinter::new(&self.code, &self.comments, base, with_addrs).to_string()
    }
}

impl fmt::Display for GeneratedAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [frame={}, call={}+{}, refmap={:?}]",
            self.description(),
            self.layout.total_size(),
            self.call_pos,
            self.call_size,
            self.refmap
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions() {
        for d in [Direction::BaselineToOptimized, Direction::OptimizedToBaseline] {
            assert_ne!(d.source(), d.destination());
            assert_eq!(Direction::entering(d.destination()), d);
        }
        assert_eq!(Direction::BaselineToOptimized.to_string(), "BASELINE2OPT");
    }
}
