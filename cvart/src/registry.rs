//! The process-wide registry of adapters.
//!
//! Adapters are generated on first use, on whichever thread first needs them. Generation happens
//! without holding any lock: if two threads race to generate the same adapter, the first to
//! publish wins and the other's adapter is discarded, so every caller sees the same adapter.

use crate::{
    abi::Convention,
    adapter::{Direction, GeneratedAdapter},
    codebuf::{CodeRegion, CodeRegionError},
    compile::{AdapterCodeGenerator, CompilationError, default_generator},
    kind::Signature,
    log::{
        AsmFormat, Log, Verbosity, log_asm, should_log_asm,
        stats::{Stats, TimingState},
    },
    method::{CompiledMethod, needs_adapter},
    patch::{self, CALL_OPCODE, JMP_OPCODE},
    walk::{self, Cursor, FrameDescription, MemoryReader, WalkError},
};
use cvarefmap::ReferenceMapPreparer;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap},
    env,
    error::Error,
    sync::Arc,
};

/// The default size of the code region in bytes.
pub const DEFAULT_CODE_REGION_SIZE: usize = 16 * 1024 * 1024;

/// Installed code is aligned to this many bytes. Method prologues rely on this to make their
/// branches patchable.
const CODE_ALIGN: usize = 16;

type AdapterKey = (Direction, Signature);

/// Configure and create an [AdapterRegistry].
pub struct RegistryBuilder {
    code_region_size: Option<usize>,
    generator: Option<Box<dyn AdapterCodeGenerator>>,
}

impl RegistryBuilder {
    /// Create a registry builder with default parameters.
    pub fn new() -> Self {
        Self {
            code_region_size: None,
            generator: None,
        }
    }

    /// Change the size of the code region adapters and methods are installed into. If not set,
    /// the size is read from `CVA_CODE_REGION_SIZE`, falling back to
    /// [DEFAULT_CODE_REGION_SIZE].
    pub fn code_region_size(mut self, code_region_size: usize) -> Self {
        self.code_region_size = Some(code_region_size);
        self
    }

    /// Use `generator` rather than the generator for the current architecture.
    pub fn generator(mut self, generator: Box<dyn AdapterCodeGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Consume the `RegistryBuilder` and create an [AdapterRegistry].
    pub fn build(self) -> Result<AdapterRegistry, Box<dyn Error>> {
        let size = match self.code_region_size {
            Some(x) => x,
            None => match env::var("CVA_CODE_REGION_SIZE") {
                Ok(s) => s
                    .parse::<usize>()
                    .map_err(|e| format!("Invalid CVA_CODE_REGION_SIZE '{s}': {e}"))?,
                Err(_) => DEFAULT_CODE_REGION_SIZE,
            },
        };
        let cg = match self.generator {
            Some(x) => x,
            None => default_generator()?,
        };
        Ok(AdapterRegistry {
            cg,
            adapters: RwLock::new(HashMap::new()),
            installed: Mutex::new(HashMap::new()),
            by_addr: RwLock::new(BTreeMap::new()),
            region: CodeRegion::new(size)?,
            log: Log::new()?,
            stats: Stats::new(),
        })
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapters and methods for one VM. Dropping the registry unmaps all code installed through it.
pub struct AdapterRegistry {
    cg: Box<dyn AdapterCodeGenerator>,
    /// Every published adapter. Once published, an adapter is never replaced or removed.
    adapters: RwLock<HashMap<AdapterKey, Arc<GeneratedAdapter>>>,
    /// The address each installed adapter was installed at.
    installed: Mutex<HashMap<AdapterKey, usize>>,
    /// Installed adapters by address, for stack walkers.
    by_addr: RwLock<BTreeMap<usize, Arc<GeneratedAdapter>>>,
    region: CodeRegion,
    log: Log,
    stats: Stats,
}

impl AdapterRegistry {
    /// The code region adapters and methods are installed into.
    pub fn region(&self) -> &CodeRegion {
        &self.region
    }

    /// Return the adapter translating calls with signature `sig` in `direction`, generating it
    /// if no thread has done so yet.
    pub fn get_or_create_adapter(
        &self,
        direction: Direction,
        sig: &Signature,
    ) -> Result<Arc<GeneratedAdapter>, CompilationError> {
        let key = (direction, sig.clone());
        if let Some(a) = self.adapters.read().get(&key) {
            self.stats.adapter_cache_hit();
            return Ok(Arc::clone(a));
        }

        self.stats.timing_state(TimingState::Generating);
        let r = self.cg.generate(direction, sig);
        self.stats.timing_state(TimingState::None);
        let adapter = match r {
            Ok(x) => Arc::new(x),
            Err(e) => {
                self.log.log(
                    Verbosity::Warning,
                    &format!("generating {direction}-Adapter{sig} failed: {e}"),
                );
                return Err(e);
            }
        };
        self.stats.adapter_generated();

        let mut lk = self.adapters.write();
        let published = Arc::clone(lk.entry(key).or_insert_with(|| Arc::clone(&adapter)));
        drop(lk);
        if Arc::ptr_eq(&published, &adapter) {
            self.log.log(Verbosity::AdapterEvent, &format!("generated {adapter}"));
            if should_log_asm(AsmFormat::Asm) {
                match adapter.disassemble(0, false) {
                    Ok(s) => log_asm(&format!("--- Begin asm ---\n{s}\n--- End asm ---\n")),
                    Err(e) => log_asm(&format!("unable to disassemble adapter: {e}\n")),
                }
            }
        }
        Ok(published)
    }

    /// Copy `adapter` into the code region, returning its address. Installing the same adapter
    /// more than once returns the same address.
    pub fn install(&self, adapter: &Arc<GeneratedAdapter>) -> Result<usize, CompilationError> {
        let key = (adapter.direction(), adapter.sig().clone());
        let mut installed = self.installed.lock();
        if let Some(addr) = installed.get(&key) {
            return Ok(*addr);
        }
        let code = adapter.code();
        let addr = self
            .region
            .install_with(code.len(), CODE_ALIGN, |_| code.to_vec())
            .map_err(resource_exhausted)?;
        installed.insert(key, addr);
        self.by_addr.write().insert(addr, Arc::clone(adapter));
        drop(installed);
        self.stats.adapter_installed();
        self.log.log(
            Verbosity::AdapterEvent,
            &format!("installed {} at {addr:#x}", adapter.description()),
        );
        if should_log_asm(AsmFormat::AsmFull) {
            match adapter.disassemble(addr, true) {
                Ok(s) => log_asm(&format!("--- Begin asm ---\n{s}\n--- End asm ---\n")),
                Err(e) => log_asm(&format!("unable to disassemble adapter: {e}\n")),
            }
        }
        Ok(addr)
    }

    /// Install a method whose body `body` was compiled with convention `convention`, giving it a
    /// prologue with entry points for both conventions. If the method needs an adapter, it is
    /// generated, installed and linked before this returns.
    pub fn install_method(
        &self,
        convention: Convention,
        sig: &Signature,
        body: &[u8],
    ) -> Result<CompiledMethod, CompilationError> {
        let adapter = if needs_adapter(sig) {
            Some(self.get_or_create_adapter(Direction::entering(convention), sig)?)
        } else {
            None
        };
        self.stats.timing_state(TimingState::Installing);
        let prologue = self.cg.prologue(convention, adapter.is_some());
        let mut code = prologue.code;
        code.extend_from_slice(body);
        let r = self
            .region
            .install_with(code.len(), CODE_ALIGN, |_| code.clone());
        self.stats.timing_state(TimingState::None);
        let addr = r.map_err(resource_exhausted)?;
        let method = CompiledMethod {
            convention,
            sig: sig.clone(),
            addr,
            len: code.len(),
        };
        self.log.log(
            Verbosity::AdapterEvent,
            &format!("installed {convention} method{sig} at {addr:#x}"),
        );
        if let Some(adapter) = adapter {
            self.install_and_link(&method, &adapter)?;
        }
        Ok(method)
    }

    /// Point `method`'s adapter call at `adapter`, installing `adapter` if necessary.
    pub fn install_and_link(
        &self,
        method: &CompiledMethod,
        adapter: &Arc<GeneratedAdapter>,
    ) -> Result<(), CompilationError> {
        if adapter.direction() != Direction::entering(method.convention())
            || adapter.sig() != method.sig()
        {
            return Err(CompilationError::General(format!(
                "{} cannot adapt calls to a {} method{}",
                adapter.description(),
                method.convention(),
                method.sig()
            )));
        }
        let site = method.adapter_site().ok_or_else(|| {
            CompilationError::General(format!("method{} has no adapter call", method.sig()))
        })?;
        let addr = self.install(adapter)?;
        self.stats.timing_state(TimingState::Installing);
        let r = unsafe { patch::link(site, addr) };
        self.stats.timing_state(TimingState::None);
        r.map_err(|e| CompilationError::InternalError(e.to_string()))?;
        self.stats.call_site_linked();
        self.log.log(
            Verbosity::AdapterEvent,
            &format!("linked {site:#x} to {}", adapter.description()),
        );
        Ok(())
    }

    /// Redirect every future call to `old` to `new`, which must have the same signature. Threads
    /// already executing `old` are unaffected, and threads racing with the redirection reach
    /// either `old` or `new`.
    ///
    /// # Panics
    ///
    /// If an entry point of `old` cannot be atomically repointed.
    pub fn forward_method(
        &self,
        old: &CompiledMethod,
        new: &CompiledMethod,
    ) -> Result<(), CompilationError> {
        if old.sig() != new.sig() {
            return Err(CompilationError::General(format!(
                "cannot forward method{} to method{}",
                old.sig(),
                new.sig()
            )));
        }
        if !self.region.contains(old.addr()) || !self.region.contains(new.addr()) {
            return Err(CompilationError::General(
                "cannot forward methods installed by another registry".to_owned(),
            ));
        }
        for conv in [Convention::Baseline, Convention::Optimized] {
            let site = old.entry(conv);
            let target = new.entry(conv);
            let dest = match unsafe { *(site as *const u8) } {
                JMP_OPCODE => target,
                CALL_OPCODE => {
                    // The call pushes a return address `new` mustn't see: route it via a stub
                    // which discards it.
                    let size = self.cg.forwarding_stub_size();
                    self.region
                        .install_with(size, CODE_ALIGN, |addr| {
                            match self.cg.forwarding_stub(addr, target) {
                                Some(code) => code,
                                None => self.fatal(&format!(
                                    "forwarding stub at {addr:#x} cannot reach {target:#x}"
                                )),
                            }
                        })
                        .unwrap_or_else(|e| self.fatal(&e.to_string()))
                }
                x => self.fatal(&format!("unexpected opcode {x:#04x} at {site:#x}")),
            };
            if let Err(e) = unsafe { patch::repoint(site, dest) } {
                self.fatal(&format!("cannot forward {:#x}: {e}", old.addr()));
            }
            self.stats.call_site_patched();
        }
        self.stats.method_forwarded();
        self.log.log(
            Verbosity::AdapterEvent,
            &format!("forwarded {:#x} to {:#x}", old.addr(), new.addr()),
        );
        Ok(())
    }

    /// If `ip` is within an installed adapter, return the adapter's address and the adapter.
    pub fn adapter_at(&self, ip: usize) -> Option<(usize, Arc<GeneratedAdapter>)> {
        let lk = self.by_addr.read();
        let (start, adapter) = lk.range(..=ip).next_back()?;
        if ip < start + adapter.code().len() {
            Some((*start, Arc::clone(adapter)))
        } else {
            None
        }
    }

    /// Compute the cursor of the frame which called the adapter `cursor` is in.
    pub fn walk_through_adapter(
        &self,
        cursor: &Cursor,
        mem: &dyn MemoryReader,
    ) -> Result<Cursor, WalkError> {
        let (start, adapter) = self
            .adapter_at(cursor.ip)
            .ok_or(WalkError::NotAdapterCode(cursor.ip))?;
        walk::walk_through_adapter(&adapter, start, cursor, mem)
    }

    /// Describe the frame of the adapter `cursor` is in.
    pub fn describe_adapter_frame(
        &self,
        cursor: &Cursor,
        mem: &dyn MemoryReader,
    ) -> Result<FrameDescription, WalkError> {
        let (start, adapter) = self
            .adapter_at(cursor.ip)
            .ok_or(WalkError::NotAdapterCode(cursor.ip))?;
        walk::describe_adapter_frame(&adapter, start, cursor, mem)
    }

    /// Tell `preparer` which slots of the adapter frame `cursor` is in hold references.
    pub fn prepare_reference_map(
        &self,
        cursor: &Cursor,
        preparer: &mut dyn ReferenceMapPreparer,
    ) -> Result<(), WalkError> {
        let (start, adapter) = self
            .adapter_at(cursor.ip)
            .ok_or(WalkError::NotAdapterCode(cursor.ip))?;
        walk::prepare_reference_map(&adapter, start, cursor, preparer)
    }

    /// Log `msg` as an error and abort.
    fn fatal(&self, msg: &str) -> ! {
        self.log.log(Verbosity::Error, msg);
        panic!("{msg}");
    }
}

impl Drop for AdapterRegistry {
    fn drop(&mut self) {
        self.stats.output();
    }
}

fn resource_exhausted(e: CodeRegionError) -> CompilationError {
    CompilationError::ResourceExhausted(Box::new(e))
}
