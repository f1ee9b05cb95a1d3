//! # PDB Registry
//!
//! The process-wide table of known PDBs and the [`PdbContext`] that owns it.
//!
//! Entries are indexed twice: by fingerprint (the public handle) and by the
//! hash of their module name. Both indices, the load-slot counter and every
//! call into the symbol backend are guarded by one lock. Internal helpers
//! take `&mut RegistryState`, so code that already holds the lock (the
//! bootstrap worker, nested type displays) never locks twice.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use vmpdb_core::backend::PdbFileBackend;
//! use vmpdb_core::memory::SparseMemory;
//! use vmpdb_core::pe::MappedPe;
//! use vmpdb_core::symbols::{BootstrapMode, Capabilities, InitOptions, PdbContext, PdbHandle};
//! use vmpdb_core::types::{Address, TargetInfo};
//!
//! let memory = Arc::new(SparseMemory::new());
//! let capabilities = Capabilities {
//!     backend: Arc::new(PdbFileBackend::new()),
//!     pe: Arc::new(MappedPe::new(memory.clone())),
//!     memory,
//! };
//! let target = TargetInfo::new_64(Address::new(0xfffff800_00000000), 0x0100_0000);
//! let options = InitOptions { mode: BootstrapMode::Sync, ..InitOptions::default() };
//!
//! let ctx = PdbContext::initialize(capabilities, target, options)?;
//! let size = ctx.type_size(PdbHandle::KERNEL, "_EPROCESS")?;
//! println!("_EPROCESS is {size:#x} bytes");
//! # Ok::<(), vmpdb_core::PdbError>(())
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use super::bootstrap::{self, BootstrapState, InitOptions};
use super::entry::{PdbEntry, PdbHandle};
use super::hash;
use crate::backend::SymbolBackend;
use crate::error::{PdbError, PdbResult};
use crate::memory::MemoryAccess;
use crate::pe::{CodeViewInfo, PeIntrospection};
use crate::types::{Address, ProcessId, TargetInfo};

/// First synthetic base handed to the symbol backend.
pub const LOAD_SLOT_BASE: u64 = 0x0000_511f_0000_0000;

/// Distance between consecutive load slots.
pub const LOAD_SLOT_STRIDE: u64 = 0x1000_0000;

/// Modules larger than this are never auto-registered.
pub const MAX_MODULE_SIZE: u32 = 0x0400_0000;

/// Module name the kernel entry is registered under.
pub const KERNEL_MODULE_NAME: &str = "ntoskrnl";

/// Capabilities the hosting engine supplies
#[derive(Clone)]
pub struct Capabilities
{
    /// Debug database parser and query engine
    pub backend: Arc<dyn SymbolBackend>,
    /// PE header reader for mapped modules
    pub pe: Arc<dyn PeIntrospection>,
    /// Target memory reader
    pub memory: Arc<dyn MemoryAccess>,
}

/// Lock-protected registry state.
pub(crate) struct RegistryState
{
    by_fingerprint: HashMap<PdbHandle, Arc<PdbEntry>>,
    by_module: HashMap<u32, Arc<PdbEntry>>,
    next_slot: u64,
}

impl RegistryState
{
    fn new() -> Self
    {
        RegistryState { by_fingerprint: HashMap::new(), by_module: HashMap::new(), next_slot: LOAD_SLOT_BASE }
    }

    /// Register an entry unless its fingerprint is already known.
    ///
    /// The module-name index keeps the first entry registered under a name.
    pub(crate) fn insert(
        &mut self,
        module_base: Address,
        module_size: u32,
        module_name: &str,
        codeview: &CodeViewInfo,
    ) -> Option<PdbHandle>
    {
        let fingerprint = hash::fingerprint(&codeview.pdb_file_name, &codeview.guid, codeview.age);
        let handle = PdbHandle::from_raw(fingerprint);
        if fingerprint == 0 || handle.is_kernel() {
            warn!(module = module_name, "PDB fingerprint collides with a reserved handle value");
            return None;
        }
        if self.by_fingerprint.contains_key(&handle) {
            return Some(handle);
        }

        let entry = Arc::new(PdbEntry::new(handle, module_base, module_size, module_name, codeview));
        self.by_module.entry(hash::module_name_hash(module_name)).or_insert_with(|| Arc::clone(&entry));
        self.by_fingerprint.insert(handle, entry);
        debug!(
            module = module_name,
            pdb = codeview.file_name(),
            guid = %codeview.guid,
            age = codeview.age,
            base = %module_base,
            %handle,
            "registered PDB"
        );
        Some(handle)
    }

    pub(crate) fn get(&self, handle: PdbHandle) -> Option<Arc<PdbEntry>>
    {
        self.by_fingerprint.get(&handle).cloned()
    }

    pub(crate) fn by_module_name(&self, module_name: &str) -> Option<Arc<PdbEntry>>
    {
        self.by_module.get(&hash::module_name_hash(module_name)).cloned()
    }

    pub(crate) fn find_by_base(&self, module_base: Address) -> Option<PdbHandle>
    {
        self.by_fingerprint.values().find(|entry| entry.module_base() == module_base).map(|entry| entry.handle())
    }

    /// Resolve a handle (including the kernel sentinel) to its entry.
    pub(crate) fn resolve(&self, handle: PdbHandle) -> PdbResult<Arc<PdbEntry>>
    {
        if !handle.is_kernel() {
            return self.get(handle).ok_or(PdbError::UnknownHandle(handle.value()));
        }
        let entry = self.by_module_name(KERNEL_MODULE_NAME).ok_or(PdbError::UnknownHandle(handle.value()))?;
        if entry.is_load_failed() {
            return Err(PdbError::LoadFailed { module: entry.module_name().to_owned() });
        }
        Ok(entry)
    }

    /// Hand out the next load slot. The counter advances on every call.
    pub(crate) fn take_slot(&mut self) -> u64
    {
        let slot = self.next_slot;
        self.next_slot = self.next_slot.wrapping_add(LOAD_SLOT_STRIDE);
        slot
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &Arc<PdbEntry>>
    {
        self.by_fingerprint.values()
    }

    pub(crate) fn len(&self) -> usize
    {
        self.by_fingerprint.len()
    }

    fn clear(&mut self)
    {
        self.by_module.clear();
        self.by_fingerprint.clear();
        self.next_slot = LOAD_SLOT_BASE;
    }
}

/// Shared state of the PDB subsystem
///
/// Created by [`PdbContext::initialize`], which also starts the kernel
/// bootstrap. All queries fail with [`PdbError::Disabled`] until bootstrap
/// succeeds, and with [`PdbError::NotInitialized`] after [`PdbContext::close`].
pub struct PdbContext
{
    state: Mutex<RegistryState>,
    disabled: AtomicBool,
    closed: AtomicBool,
    bootstrap: AtomicU8,
    worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) backend: Arc<dyn SymbolBackend>,
    pub(crate) pe: Arc<dyn PeIntrospection>,
    pub(crate) memory: Arc<dyn MemoryAccess>,
    pub(crate) target: TargetInfo,
}

impl PdbContext
{
    /// Initialize the subsystem and start the kernel bootstrap.
    ///
    /// With [`BootstrapMode::Async`](super::BootstrapMode::Async) this returns
    /// once the worker has taken the registry lock (or after a 500 ms grace
    /// period); queries issued afterwards block until bootstrap completes.
    ///
    /// ## Errors
    ///
    /// Returns an error if the backend rejects the symbol path or the
    /// bootstrap worker cannot be spawned. Bootstrap failures are not errors:
    /// they leave the subsystem disabled and are logged.
    pub fn initialize(capabilities: Capabilities, target: TargetInfo, options: InitOptions) -> PdbResult<Arc<Self>>
    {
        capabilities.backend.initialize(&options.symbol_path)?;
        info!(symbol_path = %options.symbol_path, kernel_base = %target.kernel_base, "initializing PDB subsystem");

        let ctx = Arc::new(PdbContext {
            state: Mutex::new(RegistryState::new()),
            disabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            bootstrap: AtomicU8::new(BootstrapState::NotStarted as u8),
            worker: Mutex::new(None),
            backend: capabilities.backend,
            pe: capabilities.pe,
            memory: capabilities.memory,
            target,
        });
        bootstrap::launch(&ctx, options.codeview, options.mode)?;
        Ok(ctx)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RegistryState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail fast unless the subsystem is open and enabled.
    pub(crate) fn ensure_ready(&self) -> PdbResult<()>
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PdbError::NotInitialized);
        }
        if self.disabled.load(Ordering::Acquire) {
            return Err(PdbError::Disabled);
        }
        Ok(())
    }

    /// Flip the enabled flag. Callers must hold the registry lock.
    pub(crate) fn set_enabled(&self, _state: &RegistryState, enabled: bool)
    {
        self.disabled.store(!enabled, Ordering::Release);
    }

    pub(crate) fn set_bootstrap_state(&self, state: BootstrapState)
    {
        self.bootstrap.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_worker(&self, handle: JoinHandle<()>)
    {
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// `true` once the kernel bootstrap has succeeded (and until close).
    pub fn is_enabled(&self) -> bool
    {
        self.ensure_ready().is_ok()
    }

    /// Current phase of the kernel bootstrap.
    pub fn bootstrap_state(&self) -> BootstrapState
    {
        BootstrapState::from_u8(self.bootstrap.load(Ordering::Acquire))
    }

    /// The target this context was initialized for.
    pub fn target(&self) -> &TargetInfo
    {
        &self.target
    }

    /// Block until an in-flight bootstrap has released the registry lock.
    pub fn wait_bootstrap(&self)
    {
        drop(self.lock_state());
    }

    /// Register a PDB for a module without loading it.
    ///
    /// Registration is idempotent: an identity that is already known returns
    /// the existing handle and leaves the entry untouched. Returns `None` if
    /// the subsystem is closed or the identity hashes to a reserved value.
    pub fn add_module_entry(
        &self,
        module_base: Address,
        module_size: u32,
        module_name: &str,
        codeview: &CodeViewInfo,
    ) -> Option<PdbHandle>
    {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.lock_state().insert(module_base, module_size, module_name, codeview)
    }

    /// Handle for the module mapped at `module_base` in `process`.
    ///
    /// A known base address returns its existing handle (only one PDB per
    /// base, regardless of process). Otherwise the module's PE headers are
    /// read and a new entry is registered from its CodeView record. Modules
    /// of size zero or larger than [`MAX_MODULE_SIZE`] are refused.
    pub fn handle_from_module_address(&self, process: ProcessId, module_base: Address) -> Option<PdbHandle>
    {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        if let Some(handle) = self.lock_state().find_by_base(module_base) {
            return Some(handle);
        }

        let module_size = match self.pe.image_size(process, module_base) {
            Ok(size) if size != 0 && size <= MAX_MODULE_SIZE => size,
            Ok(size) => {
                debug!(base = %module_base, size, "refusing module with unsupported image size");
                return None;
            }
            Err(err) => {
                debug!(base = %module_base, error = %err, "unable to read module headers");
                return None;
            }
        };
        let codeview = match self.pe.codeview(process, module_base) {
            Ok(codeview) => codeview,
            Err(err) => {
                debug!(base = %module_base, error = %err, "module has no usable CodeView record");
                return None;
            }
        };
        self.add_module_entry(module_base, module_size, codeview.module_name(), &codeview)
    }

    /// Handle for an already registered module name.
    ///
    /// `None` and `"nt"` are synonyms for `"ntoskrnl"`. If several modules
    /// share a name the first one registered wins. Modules whose load has
    /// failed, and every lookup while the subsystem is disabled, yield `None`.
    pub fn handle_from_module_name(&self, module_name: Option<&str>) -> Option<PdbHandle>
    {
        self.ensure_ready().ok()?;
        let name = match module_name {
            None | Some("nt") => KERNEL_MODULE_NAME,
            Some(name) => name,
        };
        let entry = self.lock_state().by_module_name(name)?;
        (!entry.is_load_failed()).then(|| entry.handle())
    }

    /// Registered entry for a handle, if any. Does not trigger a load.
    pub fn entry(&self, handle: PdbHandle) -> Option<Arc<PdbEntry>>
    {
        self.lock_state().resolve(handle).ok()
    }

    /// Number of registered entries.
    pub fn entry_count(&self) -> usize
    {
        self.lock_state().len()
    }

    /// Tear the subsystem down: wait for bootstrap, unload every database
    /// and release all entries. Safe to call more than once.
    pub fn close(&self)
    {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.join_worker();

        let mut state = self.lock_state();
        self.set_enabled(&state, false);
        for entry in state.entries() {
            if let Some(base) = entry.loaded_base() {
                if let Err(err) = self.backend.unload_database(base) {
                    debug!(module = entry.module_name(), error = %err, "failed to unload database");
                }
            }
        }
        self.backend.cleanup();
        state.clear();
        drop(state);
        info!("PDB subsystem closed");
    }

    fn join_worker(&self)
    {
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("PDB bootstrap worker panicked");
            }
        }
    }
}

impl Drop for PdbContext
{
    fn drop(&mut self)
    {
        self.close();
    }
}
