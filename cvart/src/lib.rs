//! Calling-convention adapters for a two-tier JIT on x64.
//!
//! Methods are compiled with either a "baseline" convention (every argument on the stack, popped
//! by the callee) or an "optimized" convention (SysV-style registers, stack arguments popped by
//! the caller). Every compiled method can be entered with either convention: calls made with the
//! convention the method wasn't compiled with go through an adapter which moves the arguments
//! into place, calls the method's body, and cleans up the stack as the caller expects.
//!
//! [registry::AdapterRegistry] is the entry point: it generates adapters on first use, installs
//! methods and adapters into executable memory, links and repoints call sites, and lets stack
//! walkers see through adapter frames.

#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

pub mod abi;
pub mod adapter;
pub mod codebuf;
pub mod compile;
pub mod frame;
pub mod kind;
mod log;
pub mod method;
pub mod patch;
pub mod registry;
pub mod walk;

pub use self::{
    abi::Convention,
    adapter::{Direction, GeneratedAdapter},
    kind::{Kind, Signature},
    method::CompiledMethod,
    registry::{AdapterRegistry, RegistryBuilder},
};
