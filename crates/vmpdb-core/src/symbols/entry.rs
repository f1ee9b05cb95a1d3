//! Registry entries and the handles that name them.

use std::fmt;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing::trace;

use crate::pe::{CodeViewInfo, Guid};
use crate::types::Address;

/// Opaque handle naming a registered PDB
///
/// The value is the entry's fingerprint. [`PdbHandle::KERNEL`] is a sentinel
/// that always resolves to whichever entry is registered under the module
/// name `ntoskrnl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PdbHandle(u64);

impl PdbHandle
{
    /// Sentinel naming the kernel PDB
    pub const KERNEL: Self = PdbHandle(u64::MAX);

    /// Wrap a raw handle value previously obtained from [`PdbHandle::value`].
    pub const fn from_raw(value: u64) -> Self
    {
        PdbHandle(value)
    }

    /// Raw handle value.
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// `true` for the kernel sentinel.
    pub const fn is_kernel(self) -> bool
    {
        self.0 == u64::MAX
    }
}

impl fmt::Display for PdbHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        if self.is_kernel() {
            write!(f, "nt")
        } else {
            write!(f, "0x{:016x}", self.0)
        }
    }
}

/// Outcome of materializing an entry's debug database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState
{
    /// The database is loaded in the backend at `base`.
    Loaded
    {
        /// Resolved local path of the debug file
        path: PathBuf,
        /// Synthetic base the backend loaded the database at
        base: u64,
    },
    /// Locating or loading the database failed; never retried.
    Failed,
}

/// One registered PDB
///
/// The identity fields never change after registration. The load outcome is
/// written exactly once, by the loader, while the registry lock is held.
pub struct PdbEntry
{
    handle: PdbHandle,
    module_base: Address,
    module_size: u32,
    module_name: String,
    debug_file_name: String,
    guid: Guid,
    age: u32,
    load: OnceCell<LoadState>,
}

impl PdbEntry
{
    pub(crate) fn new(handle: PdbHandle, module_base: Address, module_size: u32, module_name: &str, codeview: &CodeViewInfo)
        -> Self
    {
        PdbEntry {
            handle,
            module_base,
            module_size,
            module_name: module_name.to_owned(),
            debug_file_name: codeview.file_name().to_owned(),
            guid: codeview.guid,
            age: codeview.age,
            load: OnceCell::new(),
        }
    }

    pub fn handle(&self) -> PdbHandle
    {
        self.handle
    }

    /// Address the module is mapped at in the target.
    pub fn module_base(&self) -> Address
    {
        self.module_base
    }

    pub fn module_size(&self) -> u32
    {
        self.module_size
    }

    /// Short module name as registered (`ntoskrnl`, `tcpip`, ...).
    pub fn module_name(&self) -> &str
    {
        &self.module_name
    }

    /// PDB file name used to search the symbol path.
    pub fn debug_file_name(&self) -> &str
    {
        &self.debug_file_name
    }

    pub fn guid(&self) -> &Guid
    {
        &self.guid
    }

    pub fn age(&self) -> u32
    {
        self.age
    }

    /// Load outcome, or `None` if no load has been attempted yet.
    pub fn load_state(&self) -> Option<&LoadState>
    {
        self.load.get()
    }

    /// `true` once a load attempt has failed.
    pub fn is_load_failed(&self) -> bool
    {
        matches!(self.load.get(), Some(LoadState::Failed))
    }

    /// Synthetic backend base, if the database is loaded.
    pub fn loaded_base(&self) -> Option<u64>
    {
        match self.load.get() {
            Some(LoadState::Loaded { base, .. }) => Some(*base),
            _ => None,
        }
    }

    /// Local path of the debug file, if the database is loaded.
    pub fn resolved_path(&self) -> Option<&Path>
    {
        match self.load.get() {
            Some(LoadState::Loaded { path, .. }) => Some(path),
            _ => None,
        }
    }

    /// Record the load outcome. The first outcome sticks.
    pub(crate) fn finish_load(&self, state: LoadState) -> &LoadState
    {
        self.load.get_or_init(|| state)
    }
}

impl fmt::Debug for PdbEntry
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("PdbEntry")
            .field("handle", &self.handle)
            .field("module_base", &self.module_base)
            .field("module_size", &self.module_size)
            .field("module_name", &self.module_name)
            .field("debug_file_name", &self.debug_file_name)
            .field("guid", &format_args!("{}", self.guid))
            .field("age", &self.age)
            .field("load", &self.load.get())
            .finish()
    }
}

impl Drop for PdbEntry
{
    fn drop(&mut self)
    {
        trace!(module = %self.module_name, handle = %self.handle, "releasing PDB entry");
    }
}
