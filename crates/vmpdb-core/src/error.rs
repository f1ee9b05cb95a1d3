//! # Error Types
//!
//! Error handling for the PDB registry, the symbol backend and the type
//! display engine.
//!
//! We use `thiserror` to derive `Error` implementations. Capability errors
//! ([`BackendError`], [`MemoryError`], [`PeError`]) convert into [`PdbError`]
//! with `?`, so public operations only ever surface a single error type.

use thiserror::Error;

use crate::backend::BackendError;
use crate::types::Address;

/// Main error type for PDB subsystem operations
///
/// ## Error Categories
///
/// 1. **Lifecycle errors**: NotInitialized, Disabled
/// 2. **Registry errors**: UnknownHandle, RegistrationFailed
/// 3. **Load errors**: LoadFailed, Discovery
/// 4. **Lookup errors**: SymbolNotFound, TypeNotFound, FieldNotFound, Truncated
/// 5. **Capability errors**: Backend, Memory, Pe, Config, Io
#[derive(Error, Debug)]
pub enum PdbError
{
    /// The subsystem was never initialized or has been closed.
    #[error("PDB subsystem is not initialized")]
    NotInitialized,

    /// The kernel bootstrap has not (yet) completed successfully.
    ///
    /// Every query fails with this error until the background worker has
    /// registered and loaded the kernel PDB. If bootstrap failed, the
    /// subsystem stays disabled until it is closed and initialized again.
    #[error("PDB subsystem is disabled")]
    Disabled,

    /// The handle does not name a registered PDB.
    ///
    /// The kernel sentinel handle also yields this error when no kernel
    /// entry has been registered.
    #[error("Unknown PDB handle: 0x{0:016x}")]
    UnknownHandle(u64),

    /// A registry entry could not be created for the module.
    #[error("Failed to register PDB for module {0}")]
    RegistrationFailed(String),

    /// Debug information for the module could not be located or loaded.
    ///
    /// This error is sticky: once an entry failed to load it is never retried
    /// for the lifetime of the registry.
    #[error("Debug symbols for module {module} could not be loaded")]
    LoadFailed
    {
        /// Short module name of the failed entry
        module: String,
    },

    /// The kernel image did not reveal any CodeView debug record.
    #[error("Unable to locate debugging information: {0}")]
    Discovery(String),

    /// No symbol matched the requested name.
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// No type matched the requested name, or the type is not displayable.
    #[error("Type not found: {0}")]
    TypeNotFound(String),

    /// The type exists but has no child with the requested name.
    #[error("Field {field} not found in type {type_name}")]
    FieldNotFound
    {
        /// Name of the containing type
        type_name: String,
        /// Name of the missing member
        field: String,
    },

    /// A value does not fit the 16-bit variant of an operation.
    #[error("Value 0x{0:x} does not fit in 16 bits")]
    Truncated(u64),

    /// The rendered type display was empty.
    #[error("Type display for {0} produced no output")]
    EmptyDisplay(String),

    /// The symbol backend reported an error.
    #[error("Symbol backend error: {0}")]
    Backend(#[from] BackendError),

    /// Target memory could not be read.
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// A PE image header could not be parsed.
    #[error("PE error: {0}")]
    Pe(#[from] PeError),

    /// The symbol configuration could not be persisted.
    #[error("Configuration error: {0}")]
    Config(#[from] vmpdb_utils::ConfigError),

    /// I/O error (spawning the bootstrap worker, reading image files, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a [`MemoryAccess`](crate::memory::MemoryAccess) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError
{
    /// Nothing is mapped at the address.
    #[error("No memory mapped at {0}")]
    Unmapped(Address),

    /// Only a prefix of the requested range could be read.
    #[error("Partial read at {address}: {read} of {requested} bytes")]
    Partial
    {
        /// Start of the requested range
        address: Address,
        /// Number of bytes actually read
        read: usize,
        /// Number of bytes requested
        requested: usize,
    },
}

/// Errors raised while inspecting PE images.
#[derive(Error, Debug)]
pub enum PeError
{
    /// The headers are malformed or not a PE image.
    #[error("Invalid PE image: {0}")]
    InvalidImage(String),

    /// The image has no debug data directory.
    #[error("PE image has no debug directory")]
    NoDebugDirectory,

    /// The debug directory holds no RSDS CodeView record.
    #[error("PE image has no CodeView debug record")]
    NoCodeView,

    /// Reading the image from target memory failed.
    #[error("Failed to read PE image: {0}")]
    Memory(#[from] MemoryError),
}

impl From<object::read::Error> for PeError
{
    fn from(err: object::read::Error) -> Self
    {
        PeError::InvalidImage(err.to_string())
    }
}

/// Result type alias for PDB subsystem operations
pub type PdbResult<T> = std::result::Result<T, PdbError>;

/// Alias kept for call sites that import `vmpdb_core::Result`.
pub type Result<T> = PdbResult<T>;
