//! # vmpdb-core
//!
//! Debug-symbol support for memory introspection of Windows targets.
//!
//! This crate keeps a lazily populated registry of PDB files for the kernel
//! and the modules found in an analyzed address space, and answers symbol,
//! type-layout and structure-display queries from them:
//!
//! - Kernel PDB discovery and loading at startup (optionally in background)
//! - Symbol offsets and addresses, nearest symbol for an offset
//! - Type sizes and member offsets
//! - `dt`-style structure dumps overlaid with live memory
//!
//! ## Capabilities
//!
//! The subsystem does not read target memory, parse PE headers or PDB files
//! on its own; it talks to three traits the hosting engine supplies:
//!
//! - [`backend::SymbolBackend`]: debug database parser and query engine
//!   ([`backend::PdbFileBackend`] on top of the `pdb` crate)
//! - [`pe::PeIntrospection`]: module size and CodeView record
//!   ([`pe::MappedPe`] on top of `object`)
//! - [`memory::MemoryAccess`]: target memory reads
//!   ([`memory::SparseMemory`] for image files and tests)

pub mod backend;
pub mod error;
pub mod memory;
pub mod pe;
pub mod symbols;
pub mod types;

pub use error::{MemoryError, PdbError, PdbResult, PeError, Result};
pub use symbols::{
    BootstrapMode, Capabilities, DisplayRequest, InitOptions, PdbContext, PdbHandle, PdbSubsystem, TypeDump,
};
pub use types::{Address, ProcessId, TargetInfo};
