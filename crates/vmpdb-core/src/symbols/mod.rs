//! # PDB Subsystem
//!
//! A lazily populated registry of debug databases for the modules of an
//! analyzed Windows target, and the queries answered from them.
//!
//! - [`registry`]: the shared [`PdbContext`], entry registration and lookup
//! - `loader`: locating and parsing a registered PDB on first use
//! - `bootstrap`: finding and loading the kernel PDB at startup
//! - `query`: symbol offsets, type sizes and member offsets
//! - `display`: `dt`-style structure dumps with live values
//! - [`subsystem`]: configuration-driven lifecycle

mod bootstrap;
mod display;
mod entry;
pub mod hash;
mod loader;
mod query;
pub mod registry;
pub mod subsystem;

pub use bootstrap::{BootstrapMode, BootstrapState, InitOptions, SCAN_WINDOW, STARTUP_WAIT, WORKER_NAME};
pub use display::{DisplayRequest, TypeDump, MAX_INSTANCE_SIZE, OUTPUT_LIMIT};
pub use entry::{LoadState, PdbEntry, PdbHandle};
pub use query::SymbolAtOffset;
pub use registry::{
    Capabilities, PdbContext, KERNEL_MODULE_NAME, LOAD_SLOT_BASE, LOAD_SLOT_STRIDE, MAX_MODULE_SIZE,
};
pub use subsystem::PdbSubsystem;
