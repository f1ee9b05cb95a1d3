//! # Symbol Backend
//!
//! Capability boundary between the PDB registry and whatever actually parses
//! debug databases.
//!
//! The registry never touches PDB files itself. It asks a [`SymbolBackend`] to
//! locate a database for a `(name, GUID, age)` identity, to load it at a
//! synthetic base address, and then to answer symbol and type queries against
//! that base. [`PdbFileBackend`] implements the trait on top of the `pdb`
//! crate; tests substitute in-memory doubles.
//!
//! ## Type information model
//!
//! Types are addressed by opaque [`TypeId`]s scoped to one loaded database.
//! Each id answers a fixed set of [`TypeInfoKind`] queries, mirroring what a
//! DIA/dbghelp style symbol engine exposes:
//!
//! - a UDT has a name, a byte length and children (its data members)
//! - a data member has a name, an offset, a type id and (for bitfields) a bit
//!   length
//! - pointers and arrays reference their pointee or element type
//! - base types carry a [`BaseType`] code

pub mod pdbfile;
pub mod wildcard;

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use pdbfile::PdbFileBackend;
pub use wildcard::Pattern;

use crate::pe::Guid;

/// Identifier of a type or data member inside one loaded database.
///
/// Zero never names a valid type.
pub type TypeId = u32;

/// Errors reported by a [`SymbolBackend`].
#[derive(Error, Debug)]
pub enum BackendError
{
    /// [`SymbolBackend::initialize`] has not been called.
    #[error("symbol backend is not initialized")]
    NotInitialized,

    /// No debug file matching the identity exists on the symbol path.
    #[error("debug file {name} ({key}) not found on symbol path")]
    FileNotFound
    {
        /// PDB file name
        name: String,
        /// Symbol store key (`GUID` + `age`)
        key: String,
    },

    /// No database is loaded at the given synthetic base.
    #[error("no database loaded at 0x{0:016x}")]
    UnknownDatabase(u64),

    /// A database is already loaded at the requested synthetic base.
    #[error("load slot 0x{0:016x} is already in use")]
    SlotInUse(u64),

    /// No symbol matched.
    #[error("symbol {0} not found")]
    SymbolNotFound(String),

    /// No symbol covers the address.
    #[error("no symbol at 0x{0:016x}")]
    NoSymbolAt(u64),

    /// No type matched.
    #[error("type {0} not found")]
    TypeNotFound(String),

    /// The type id is not part of the database.
    #[error("unknown type id {0}")]
    UnknownTypeId(TypeId),

    /// The type exists but does not carry the requested property.
    #[error("type {id} has no {kind:?}")]
    NotAvailable
    {
        /// Queried type id
        id: TypeId,
        /// Requested property
        kind: TypeInfoKind,
    },

    /// A wildcard pattern could not be compiled.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// The PDB file is malformed.
    #[error("PDB parse error: {0}")]
    Parse(#[from] pdb::Error),

    /// File system error while searching or reading debug files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Classification of a symbol or type record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymTag
{
    /// Unclassified record
    Null,
    /// Public symbol (name and address only)
    PublicSymbol,
    /// Function symbol
    Function,
    /// Data member or global variable
    Data,
    /// Structure, class or union
    Udt,
    /// Enumeration
    Enum,
    /// Function signature
    FunctionType,
    /// Pointer
    PointerType,
    /// Fixed-size array
    ArrayType,
    /// Primitive type
    BaseType,
    /// Base class of a UDT
    BaseClass,
}

/// Primitive type codes.
///
/// [`BaseType::Function`] and [`BaseType::Pointer`] are pseudo codes used when a
/// pointer or array element type is itself a function signature or a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType
{
    NoType,
    Void,
    Char,
    WChar,
    Int,
    UInt,
    Float,
    Bcd,
    Bool,
    Long,
    ULong,
    Currency,
    Date,
    Variant,
    Complex,
    Bit,
    Bstr,
    HResult,
    Function,
    Pointer,
}

impl BaseType
{
    /// Display name of a primitive of `size` bytes.
    ///
    /// ```rust
    /// use vmpdb_core::backend::BaseType;
    ///
    /// assert_eq!(BaseType::Int.display_name(4), "int32");
    /// assert_eq!(BaseType::ULong.display_name(8), "uint64");
    /// assert_eq!(BaseType::UInt.display_name(3), "uint??");
    /// ```
    pub const fn display_name(self, size: u64) -> &'static str
    {
        match self {
            BaseType::Void => "void",
            BaseType::Char => "char",
            BaseType::WChar => "wchar",
            BaseType::Float => "float",
            BaseType::Bcd => "bcd",
            BaseType::Bool => "bool",
            BaseType::Currency => "currency",
            BaseType::Date => "date",
            BaseType::Variant => "variant",
            BaseType::Complex => "complex",
            BaseType::Bit => "bit",
            BaseType::Bstr => "BSTR",
            BaseType::HResult => "HRESULT",
            BaseType::Function => "function",
            BaseType::Pointer => "pointer",
            BaseType::Int | BaseType::Long => match size {
                1 => "int8",
                2 => "int16",
                4 => "int32",
                8 => "int64",
                _ => "int??",
            },
            BaseType::UInt | BaseType::ULong => match size {
                1 => "byte",
                2 => "word",
                4 => "dword",
                8 => "uint64",
                _ => "uint??",
            },
            BaseType::NoType => "???",
        }
    }
}

/// A single property a type id can be queried for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeInfoKind
{
    /// Name of the type or member
    SymName,
    /// Byte length of a type, or bit length of a bitfield member
    Length,
    /// Byte offset of a member within its parent
    Offset,
    /// Type id of a member
    TypeId,
    /// Record classification
    SymTag,
    /// Element count of an array
    Count,
    /// Number of children of a UDT
    ChildrenCount,
    /// Pointee, element or underlying type
    Type,
    /// Index type of an array
    ArrayIndexTypeId,
    /// Primitive type code
    BaseType,
    /// Bit position of a bitfield member
    BitPosition,
}

/// Value returned for a [`TypeInfoKind`] query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeInfoValue
{
    Name(String),
    Number(u64),
    Id(TypeId),
    Tag(SymTag),
    Base(BaseType),
}

impl TypeInfoValue
{
    pub fn into_name(self) -> Option<String>
    {
        match self {
            TypeInfoValue::Name(name) => Some(name),
            _ => None,
        }
    }

    pub const fn as_number(&self) -> Option<u64>
    {
        match self {
            TypeInfoValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub const fn as_id(&self) -> Option<TypeId>
    {
        match self {
            TypeInfoValue::Id(id) => Some(*id),
            _ => None,
        }
    }

    pub const fn as_tag(&self) -> Option<SymTag>
    {
        match self {
            TypeInfoValue::Tag(tag) => Some(*tag),
            _ => None,
        }
    }

    pub const fn as_base(&self) -> Option<BaseType>
    {
        match self {
            TypeInfoValue::Base(base) => Some(*base),
            _ => None,
        }
    }
}

/// Properties of one type id gathered by a batch query.
///
/// Only the requested kinds are filled in; properties the type does not
/// carry stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeRecord
{
    pub id: TypeId,
    pub name: Option<String>,
    pub length: Option<u64>,
    pub offset: Option<u32>,
    pub type_id: Option<TypeId>,
    pub tag: Option<SymTag>,
    pub count: Option<u32>,
    pub children: Option<u32>,
    pub pointee: Option<TypeId>,
    pub array_index_type: Option<TypeId>,
    pub base_type: Option<BaseType>,
    pub bit_position: Option<u64>,
}

impl TypeRecord
{
    /// Store a query result in the matching field.
    pub fn apply(&mut self, kind: TypeInfoKind, value: TypeInfoValue)
    {
        match kind {
            TypeInfoKind::SymName => self.name = value.into_name(),
            TypeInfoKind::Length => self.length = value.as_number(),
            TypeInfoKind::Offset => self.offset = value.as_number().and_then(|v| u32::try_from(v).ok()),
            TypeInfoKind::TypeId => self.type_id = value.as_id(),
            TypeInfoKind::SymTag => self.tag = value.as_tag(),
            TypeInfoKind::Count => self.count = value.as_number().and_then(|v| u32::try_from(v).ok()),
            TypeInfoKind::ChildrenCount => self.children = value.as_number().and_then(|v| u32::try_from(v).ok()),
            TypeInfoKind::Type => self.pointee = value.as_id(),
            TypeInfoKind::ArrayIndexTypeId => self.array_index_type = value.as_id(),
            TypeInfoKind::BaseType => self.base_type = value.as_base(),
            TypeInfoKind::BitPosition => self.bit_position = value.as_number(),
        }
    }
}

/// Which ids a batch query covers.
#[derive(Debug, Clone, Copy)]
pub enum BatchTarget<'a>
{
    /// All children of the given type, in declaration order
    ChildrenOf(TypeId),
    /// An explicit list of type ids
    Types(&'a [TypeId]),
}

/// A symbol or named type found in a loaded database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord
{
    /// Symbol or type name
    pub name: String,
    /// Absolute address in the synthetic load space (zero for types)
    pub address: u64,
    /// Synthetic base the database was loaded at
    pub module_base: u64,
    /// Size in bytes (type length for types)
    pub size: u64,
    /// Type id of the symbol or of the type itself
    pub type_id: TypeId,
    /// Record classification
    pub tag: SymTag,
}

/// Parser and query engine for debug databases.
///
/// Implementations must be thread-safe, but the registry serializes all calls
/// through its global lock, so no two calls ever overlap.
pub trait SymbolBackend: Send + Sync
{
    /// Prepare the backend with a symbol search path (`srv*<cache>*<server>`).
    ///
    /// ## Errors
    ///
    /// Returns an error if the search path cannot be used.
    fn initialize(&self, symbol_path: &str) -> BackendResult<()>;

    /// Unload every database and forget the search path.
    fn cleanup(&self);

    /// Locate the debug file matching the identity on the search path.
    ///
    /// ## Errors
    ///
    /// Returns [`BackendError::FileNotFound`] if no matching file exists.
    fn find_debug_file(&self, name: &str, guid: &Guid, age: u32) -> BackendResult<PathBuf>;

    /// Load a database at a synthetic base address and return the base it
    /// was actually loaded at.
    ///
    /// ## Errors
    ///
    /// Returns an error if the file cannot be parsed or the slot is in use.
    fn load_database(&self, path: &Path, slot_base: u64, size: u32) -> BackendResult<u64>;

    /// Unload the database at `base`.
    ///
    /// ## Errors
    ///
    /// Returns [`BackendError::UnknownDatabase`] if nothing is loaded there.
    fn unload_database(&self, base: u64) -> BackendResult<()>;

    /// Visit every symbol whose name matches the wildcard pattern.
    ///
    /// ## Errors
    ///
    /// Returns an error if the database is unknown or the pattern is invalid.
    fn enumerate_symbols(
        &self,
        base: u64,
        pattern: &str,
        visit: &mut dyn FnMut(&SymbolRecord) -> ControlFlow<()>,
    ) -> BackendResult<()>;

    /// Visit every named type whose name matches the wildcard pattern.
    ///
    /// ## Errors
    ///
    /// Returns an error if the database is unknown or the pattern is invalid.
    fn enumerate_types(
        &self,
        base: u64,
        pattern: &str,
        visit: &mut dyn FnMut(&SymbolRecord) -> ControlFlow<()>,
    ) -> BackendResult<()>;

    /// Look up a symbol by (wildcard) name.
    ///
    /// ## Errors
    ///
    /// Returns [`BackendError::SymbolNotFound`] if nothing matches.
    fn symbol_by_name(&self, base: u64, name: &str) -> BackendResult<SymbolRecord>;

    /// Look up a named type by (wildcard) name.
    ///
    /// ## Errors
    ///
    /// Returns [`BackendError::TypeNotFound`] if nothing matches.
    fn type_by_name(&self, base: u64, name: &str) -> BackendResult<SymbolRecord>;

    /// Find the symbol covering `address` and the displacement into it.
    ///
    /// ## Errors
    ///
    /// Returns [`BackendError::NoSymbolAt`] if no symbol precedes the address.
    fn symbol_from_address(&self, base: u64, address: u64) -> BackendResult<(SymbolRecord, u64)>;

    /// Query a single property of a type id.
    ///
    /// ## Errors
    ///
    /// Returns [`BackendError::NotAvailable`] if the type does not carry the
    /// property, or [`BackendError::UnknownTypeId`] for foreign ids.
    fn type_info(&self, base: u64, id: TypeId, kind: TypeInfoKind) -> BackendResult<TypeInfoValue>;

    /// Children (data members) of a type, in declaration order.
    ///
    /// ## Errors
    ///
    /// Returns [`BackendError::UnknownTypeId`] for foreign ids.
    fn type_children(&self, base: u64, id: TypeId) -> BackendResult<Vec<TypeId>>;

    /// Query several properties for a set of type ids at once.
    ///
    /// Properties a type does not carry are left unset rather than failing
    /// the whole batch.
    ///
    /// ## Errors
    ///
    /// Returns an error if the child list of [`BatchTarget::ChildrenOf`]
    /// cannot be resolved.
    fn type_info_batch(&self, base: u64, target: BatchTarget<'_>, kinds: &[TypeInfoKind]) -> BackendResult<Vec<TypeRecord>>
    {
        let children;
        let ids = match target {
            BatchTarget::ChildrenOf(parent) => {
                children = self.type_children(base, parent)?;
                children.as_slice()
            }
            BatchTarget::Types(ids) => ids,
        };

        Ok(ids
            .iter()
            .map(|&id| {
                let mut record = TypeRecord { id, ..TypeRecord::default() };
                for &kind in kinds {
                    if let Ok(value) = self.type_info(base, id, kind) {
                        record.apply(kind, value);
                    }
                }
                record
            })
            .collect())
    }
}
