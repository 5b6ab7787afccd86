//! Compiled methods installed in a code region.

use crate::{
    abi::Convention,
    compile::x64::{BASELINE_ENTRY, BODY_OFFSET, OPTIMIZED_ENTRY},
    kind::Signature,
};

/// Does a method with signature `sig` need an adapter to be called from the other convention?
/// With no arguments there is nothing to translate: both conventions return in `rax`/`xmm0`.
pub fn needs_adapter(sig: &Signature) -> bool {
    !sig.args().is_empty()
}

/// A method installed at a fixed address, with one entry point per convention.
#[derive(Clone, Debug)]
pub struct CompiledMethod {
    pub(crate) convention: Convention,
    pub(crate) sig: Signature,
    /// The address of the method's prologue.
    pub(crate) addr: usize,
    /// The size of the prologue and body in bytes.
    pub(crate) len: usize,
}

impl CompiledMethod {
    /// The convention the method's body was compiled with.
    pub fn convention(&self) -> Convention {
        self.convention
    }

    pub fn sig(&self) -> &Signature {
        &self.sig
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn baseline_entry(&self) -> usize {
        self.addr + BASELINE_ENTRY
    }

    pub fn optimized_entry(&self) -> usize {
        self.addr + OPTIMIZED_ENTRY
    }

    /// The entry point used by callers with convention `conv`.
    pub fn entry(&self, conv: Convention) -> usize {
        match conv {
            Convention::Baseline => self.baseline_entry(),
            Convention::Optimized => self.optimized_entry(),
        }
    }

    pub fn body(&self) -> usize {
        self.addr + BODY_OFFSET
    }

    /// The address of the call to this method's adapter, if it needs one.
    pub fn adapter_site(&self) -> Option<usize> {
        if !needs_adapter(&self.sig) {
            return None;
        }
        Some(match self.convention {
            Convention::Optimized => self.baseline_entry(),
            Convention::Baseline => self.optimized_entry(),
        })
    }
}
