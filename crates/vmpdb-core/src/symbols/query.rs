//! # Symbol and Type Queries
//!
//! Lookups against a registered PDB. Every query follows the same prologue:
//! fail fast if the subsystem is closed or disabled, resolve the handle (the
//! kernel sentinel included), take the registry lock and make sure the
//! database is loaded. Names accept `*` / `?` wildcards except where noted;
//! on multiple matches the first one wins.

use std::ops::ControlFlow;

use super::entry::{PdbEntry, PdbHandle};
use super::loader;
use super::registry::PdbContext;
use crate::backend::{BackendError, TypeInfoKind};
use crate::error::{PdbError, PdbResult};
use crate::types::{Address, ProcessId};

/// Symbols whose module offset is at or beyond this are ignored by the
/// 32-bit enumeration path.
const MAX_SYMBOL_OFFSET: u64 = 0x1000_0000;

/// Longest symbol name returned by [`PdbContext::symbol_from_offset`].
const MAX_SYMBOL_NAME: usize = 259;

/// Nearest symbol at or before a module offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolAtOffset
{
    /// Symbol name
    pub name: String,
    /// Distance from the symbol start to the queried offset
    pub displacement: u32,
}

fn narrow(value: u32) -> PdbResult<u16>
{
    u16::try_from(value).map_err(|_| PdbError::Truncated(u64::from(value)))
}

impl PdbContext
{
    /// Run `query` against a loaded PDB while holding the registry lock.
    fn with_loaded<T>(
        &self,
        handle: PdbHandle,
        query: impl FnOnce(&PdbEntry, u64) -> PdbResult<T>,
    ) -> PdbResult<T>
    {
        self.ensure_ready()?;
        if handle.value() == 0 {
            return Err(PdbError::UnknownHandle(0));
        }
        let mut state = self.lock_state();
        let entry = state.resolve(handle)?;
        let base = loader::ensure_loaded(&mut state, &entry, self.backend.as_ref())?;
        query(&entry, base)
    }

    /// Make sure the PDB behind `handle` is loaded.
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::LoadFailed`] if the database could not be located
    /// or parsed, now or on an earlier attempt.
    pub fn ensure_loaded(&self, handle: PdbHandle) -> PdbResult<()>
    {
        self.with_loaded(handle, |_, _| Ok(()))
    }

    /// Short module name of a registered PDB. Does not load the database.
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::UnknownHandle`] if the handle is not registered.
    pub fn module_name(&self, handle: PdbHandle) -> PdbResult<String>
    {
        self.ensure_ready()?;
        let entry = self.lock_state().resolve(handle)?;
        Ok(entry.module_name().to_owned())
    }

    /// Offset of a symbol from its module base.
    ///
    /// On 32-bit targets the symbols matching the name are enumerated and
    /// only the first is considered; it must lie below 256 MiB into the
    /// module. On 64-bit targets the name is looked up directly.
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::SymbolNotFound`] if no usable symbol matches.
    pub fn symbol_offset(&self, handle: PdbHandle, name: &str) -> PdbResult<u32>
    {
        let is_32bit = self.target.is_32bit;
        self.with_loaded(handle, |_, base| {
            let offset = if is_32bit {
                let mut found = 0u64;
                self.backend.enumerate_symbols(base, name, &mut |symbol| {
                    let offset = symbol.address.wrapping_sub(symbol.module_base);
                    if offset < MAX_SYMBOL_OFFSET {
                        found = offset;
                    }
                    ControlFlow::Break(())
                })?;
                found
            } else {
                match self.backend.symbol_by_name(base, name) {
                    Ok(symbol) => symbol.address.wrapping_sub(symbol.module_base),
                    Err(BackendError::SymbolNotFound(_)) => 0,
                    Err(err) => return Err(err.into()),
                }
            };
            match u32::try_from(offset) {
                Ok(offset) if offset != 0 => Ok(offset),
                _ => Err(PdbError::SymbolNotFound(name.to_owned())),
            }
        })
    }

    /// Virtual address of a symbol: module base plus symbol offset.
    ///
    /// ## Errors
    ///
    /// Same as [`PdbContext::symbol_offset`].
    pub fn symbol_address(&self, handle: PdbHandle, name: &str) -> PdbResult<Address>
    {
        let offset = self.symbol_offset(handle, name)?;
        let entry = self.lock_state().resolve(handle)?;
        Ok(entry.module_base() + u64::from(offset))
    }

    /// Nearest symbol at or before `offset` from the module base.
    ///
    /// ## Errors
    ///
    /// Returns an error if no symbol precedes the offset.
    pub fn symbol_from_offset(&self, handle: PdbHandle, offset: u32) -> PdbResult<SymbolAtOffset>
    {
        self.with_loaded(handle, |_, base| {
            let (symbol, displacement) = self.backend.symbol_from_address(base, base + u64::from(offset))?;
            let name = symbol.name.chars().take(MAX_SYMBOL_NAME).collect();
            let displacement = u32::try_from(displacement).map_err(|_| PdbError::Truncated(displacement))?;
            Ok(SymbolAtOffset { name, displacement })
        })
    }

    /// Read `len` bytes of target memory at a symbol's address.
    ///
    /// The registry lock is released before memory is read.
    ///
    /// ## Errors
    ///
    /// Returns the lookup error of [`PdbContext::symbol_address`], or
    /// [`PdbError::Memory`] if fewer than `len` bytes could be read.
    pub fn read_symbol(&self, handle: PdbHandle, name: &str, process: ProcessId, len: usize) -> PdbResult<Vec<u8>>
    {
        let address = self.symbol_address(handle, name)?;
        let mut buf = vec![0u8; len];
        self.memory.read_exact(process, address, &mut buf)?;
        Ok(buf)
    }

    /// Size in bytes of a named type.
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::TypeNotFound`] if no type matches or its size is
    /// zero.
    pub fn type_size(&self, handle: PdbHandle, type_name: &str) -> PdbResult<u32>
    {
        self.with_loaded(handle, |_, base| {
            let symbol = self.backend.type_by_name(base, type_name).map_err(|err| match err {
                BackendError::TypeNotFound(_) => PdbError::TypeNotFound(type_name.to_owned()),
                other => other.into(),
            })?;
            match u32::try_from(symbol.size) {
                Ok(size) if size != 0 => Ok(size),
                _ => Err(PdbError::TypeNotFound(type_name.to_owned())),
            }
        })
    }

    /// [`PdbContext::type_size`] narrowed to 16 bits.
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::Truncated`] if the size exceeds `0xffff`.
    pub fn type_size_short(&self, handle: PdbHandle, type_name: &str) -> PdbResult<u16>
    {
        narrow(self.type_size(handle, type_name)?)
    }

    /// Offset of a named member inside a type.
    ///
    /// The type name may use wildcards; the member name must match exactly
    /// (case-sensitive).
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::TypeNotFound`] if no type matches or it has no
    /// children, and [`PdbError::FieldNotFound`] if no child has the name.
    pub fn type_child_offset(&self, handle: PdbHandle, type_name: &str, child: &str) -> PdbResult<u32>
    {
        self.with_loaded(handle, |_, base| {
            let not_found = || PdbError::TypeNotFound(type_name.to_owned());

            let mut type_id = 0;
            self.backend.enumerate_types(base, type_name, &mut |symbol| {
                type_id = symbol.type_id;
                ControlFlow::Break(())
            })?;
            if type_id == 0 {
                return Err(not_found());
            }

            let count = self
                .backend
                .type_info(base, type_id, TypeInfoKind::ChildrenCount)
                .ok()
                .and_then(|value| value.as_number())
                .unwrap_or(0);
            if count == 0 {
                return Err(not_found());
            }

            for child_id in self.backend.type_children(base, type_id)? {
                let Ok(name) = self.backend.type_info(base, child_id, TypeInfoKind::SymName) else {
                    continue;
                };
                if name.into_name().as_deref() != Some(child) {
                    continue;
                }
                if let Some(offset) = self
                    .backend
                    .type_info(base, child_id, TypeInfoKind::Offset)
                    .ok()
                    .and_then(|value| value.as_number())
                {
                    return u32::try_from(offset).map_err(|_| PdbError::Truncated(offset));
                }
            }
            Err(PdbError::FieldNotFound { type_name: type_name.to_owned(), field: child.to_owned() })
        })
    }

    /// [`PdbContext::type_child_offset`] narrowed to 16 bits.
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::Truncated`] if the offset exceeds `0xffff`.
    pub fn type_child_offset_short(&self, handle: PdbHandle, type_name: &str, child: &str) -> PdbResult<u16>
    {
        narrow(self.type_child_offset(handle, type_name, child)?)
    }
}
