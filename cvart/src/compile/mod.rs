//! Adapter code generation.

use crate::{
    abi::{AbiDescriptor, Convention},
    adapter::{Direction, GeneratedAdapter},
    kind::Signature,
};
use std::error::Error;
use thiserror::Error;

pub mod x64;

/// A failure to generate an adapter. Nothing is published when generation fails.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("General error: {0}")]
    /// Generation failed for reasons that might be of interest to a programmer embedding adapters
    /// in a VM but not to the end user running a program on that VM.
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong when generating an adapter that is probably the result of a bug.
    InternalError(String),
    #[error("Limit exceeded: {0}")]
    /// A limit was exceeded (e.g. a signature with too many arguments, or a frame too big to be
    /// allocated with a single instruction).
    LimitExceeded(String),
    #[error("Resource exhausted: {0:}")]
    /// Generation failed because an external resource was exhausted: the end user running the VM
    /// probably wants to be informed of this.
    ResourceExhausted(Box<dyn Error + Send + Sync>),
}

/// The fixed entry sequence at the start of every compiled method.
#[derive(Debug)]
pub struct Prologue {
    pub code: Vec<u8>,
    /// The offset of the call to the method's adapter, if it has one. Until linked, this call
    /// targets the instruction after it.
    pub adapter_call: Option<usize>,
}

/// The trait every architecture's adapter generator must implement.
pub trait AdapterCodeGenerator: Send + Sync {
    /// The calling convention `conv` on this architecture.
    fn abi(&self, conv: Convention) -> &AbiDescriptor;

    /// Generate an adapter translating calls with signature `sig` in `direction`.
    fn generate(
        &self,
        direction: Direction,
        sig: &Signature,
    ) -> Result<GeneratedAdapter, CompilationError>;

    /// Emit the prologue of a method compiled with convention `callee`. If `adapted` is true, the
    /// entry point for the other convention calls an adapter.
    fn prologue(&self, callee: Convention, adapted: bool) -> Prologue;

    /// Emit a stub, to be loaded at `addr`, which discards the return address pushed by a call
    /// and then jumps to `target`. Returns `None` if `target` is out of range of `addr`.
    fn forwarding_stub(&self, addr: usize, target: usize) -> Option<Vec<u8>>;

    /// The size in bytes of a forwarding stub.
    fn forwarding_stub_size(&self) -> usize;
}

/// Return the adapter generator for the architecture we are running on.
pub fn default_generator() -> Result<Box<dyn AdapterCodeGenerator>, Box<dyn Error>> {
    #[cfg(target_arch = "x86_64")]
    {
        return Ok(Box::new(x64::X64AdapterGenerator::new()));
    }

    #[allow(unreachable_code)]
    {
        Err("No adapter generator supported on this platform".into())
    }
}
