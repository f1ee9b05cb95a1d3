//! # Type Display
//!
//! Renders a kernel structure as an indented member listing, optionally
//! overlaid with the live values of an instance in kernel memory.
//!
//! ```text
//! dt nt!_LIST_ENTRY  0xFFFFF80012345000
//!   +0x000 Flink                    : Ptr: _LIST_ENTRY                       : 0xFFFFF80012345000
//!   +0x008 Blink                    : Ptr: _LIST_ENTRY                       : 0xFFFFF80012345000
//! ```
//!
//! Members of nested structures are expanded up to the requested depth.
//! Consecutive bitfields show their bit range, `UNICODE_STRING` members show
//! the string they point to, and a few opaque kernel types are printed as a
//! single line. In object-header mode the optional headers that precede an
//! `_OBJECT_HEADER` (and the pool header before them) are appended.

mod render;

pub use render::OUTPUT_LIMIT;

use render::{Renderer, TextSink};

use super::entry::PdbHandle;
use super::loader;
use super::registry::PdbContext;
use crate::backend::{BackendError, SymTag, TypeInfoKind};
use crate::error::{PdbError, PdbResult};
use crate::memory::format_hexdump;
use crate::types::Address;

/// Largest instance read from memory for a value overlay.
pub const MAX_INSTANCE_SIZE: u64 = 0x2000;

/// Depth used for the optional headers shown in object-header mode.
const SUB_HEADER_DEPTH: u8 = 2;

const OBJECT_HEADER: &str = "_OBJECT_HEADER";
const CREATOR_INFO: &str = "_OBJECT_HEADER_CREATOR_INFO";

/// Optional header type for an `InfoMask` bit. Bit 8 is the pool header,
/// which is always present.
fn sub_header(bit: u32) -> Option<&'static str>
{
    match bit {
        0 => Some(CREATOR_INFO),
        1 => Some("_OBJECT_HEADER_NAME_INFO"),
        2 => Some("_OBJECT_HEADER_HANDLE_INFO"),
        3 => Some("_OBJECT_HEADER_QUOTA_INFO"),
        4 => Some("_OBJECT_HEADER_PROCESS_INFO"),
        6 => Some("_OBJECT_HEADER_AUDIT_INFO"),
        8 => Some("_POOL_HEADER"),
        _ => None,
    }
}

/// What to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRequest<'a>
{
    /// Kernel type name
    pub type_name: &'a str,
    /// How many levels of nested structures to expand
    pub max_depth: u8,
    /// Instance whose member values are shown
    pub address: Option<Address>,
    /// Append a hex/ASCII dump of the instance
    pub hex_ascii: bool,
    /// Treat `address` as an object body: display its `_OBJECT_HEADER` and
    /// the optional headers in front of it
    pub object_header: bool,
}

impl<'a> DisplayRequest<'a>
{
    pub fn new(type_name: &'a str) -> Self
    {
        DisplayRequest { type_name, max_depth: 0, address: None, hex_ascii: false, object_header: false }
    }

    #[must_use]
    pub fn depth(mut self, max_depth: u8) -> Self
    {
        self.max_depth = max_depth;
        self
    }

    #[must_use]
    pub fn at(mut self, address: Address) -> Self
    {
        self.address = Some(address);
        self
    }

    #[must_use]
    pub fn hex_ascii(mut self, enabled: bool) -> Self
    {
        self.hex_ascii = enabled;
        self
    }

    #[must_use]
    pub fn object_header(mut self, enabled: bool) -> Self
    {
        self.object_header = enabled;
        self
    }
}

/// Rendered display of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDump
{
    pub text: String,
    /// Size of the displayed type in bytes
    pub type_size: u32,
}

impl PdbContext
{
    /// Render a kernel type, with live values if an address is given.
    ///
    /// Values are only read when the address is an aligned kernel address
    /// and the type is between 4 bytes and [`MAX_INSTANCE_SIZE`]; otherwise
    /// the layout alone is shown.
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::TypeNotFound`] if the name does not resolve to a
    /// structure with members, [`PdbError::EmptyDisplay`] if nothing could
    /// be rendered, and the usual readiness and load errors.
    pub fn display_type(&self, request: &DisplayRequest<'_>) -> PdbResult<TypeDump>
    {
        self.ensure_ready()?;
        let mut state = self.lock_state();
        let entry = state.resolve(PdbHandle::KERNEL)?;
        let base = loader::ensure_loaded(&mut state, &entry, self.backend.as_ref())?;
        let dump = self.display_locked(base, request);
        drop(state);
        dump
    }

    fn display_locked(&self, base: u64, request: &DisplayRequest<'_>) -> PdbResult<TypeDump>
    {
        let target = &self.target;
        let (type_name, address) = if request.object_header {
            (OBJECT_HEADER, request.address.map(|va| va - target.object_header_size()))
        } else {
            (request.type_name, request.address)
        };
        let not_found = || PdbError::TypeNotFound(type_name.to_owned());

        let symbol = self.backend.type_by_name(base, type_name).map_err(|err| match err {
            BackendError::TypeNotFound(_) => not_found(),
            other => other.into(),
        })?;
        if symbol.tag != SymTag::Udt {
            return Err(not_found());
        }
        let child_count = self
            .backend
            .type_info(base, symbol.type_id, TypeInfoKind::ChildrenCount)
            .ok()
            .and_then(|value| value.as_number())
            .and_then(|count| u32::try_from(count).ok())
            .filter(|&count| count > 0)
            .ok_or_else(not_found)?;
        let type_size = u32::try_from(symbol.size).map_err(|_| not_found())?;

        let instance = address.filter(|va| va.is_aligned_kernel(target.is_32bit)).and_then(|va| {
            if !(4..MAX_INSTANCE_SIZE).contains(&symbol.size) {
                return None;
            }
            let mut bytes = vec![0u8; symbol.size as usize];
            self.memory.read_exact(target.system_process, va, &mut bytes).ok()?;
            Some((va, bytes))
        });

        let mut renderer =
            Renderer::new(self.backend.as_ref(), self.memory.as_ref(), target, base, request.max_depth);
        match &instance {
            Some((va, _)) => renderer.push_str(&format!("dt nt!{}  {}\n", symbol.name, target.format_address(*va))),
            None => renderer.push_str(&format!("dt nt!{}\n", symbol.name)),
        }
        renderer.render_children(0, symbol.type_id, child_count, None, instance.as_ref().map(|(_, bytes)| bytes.as_slice()));
        let mut out = renderer.finish();

        if let Some((va, bytes)) = &instance {
            if request.hex_ascii && !out.is_empty() {
                out.push_str(&format!("\n---\n\ndb  {}  L{:03X}\n", target.format_address(*va), bytes.len()));
                out.push_str(&format_hexdump(*va, bytes, 16));
            }
            if request.object_header {
                self.append_sub_headers(base, &mut out, *va, bytes, request.hex_ascii);
            }
        }

        if out.is_empty() {
            return Err(PdbError::EmptyDisplay(type_name.to_owned()));
        }
        Ok(TypeDump { text: out.into_string(), type_size })
    }

    /// Append the optional headers that precede an object header, nearest
    /// first, as selected by its `InfoMask` byte.
    fn append_sub_headers(&self, base: u64, out: &mut TextSink, header: Address, bytes: &[u8], hex_ascii: bool)
    {
        if self.named_type_size(base, CREATOR_INFO) == 0 {
            return;
        }
        let mask = bytes.get(self.target.object_info_mask_offset()).copied().map_or(0, u32::from);

        let mut va = header;
        for bit in 0..9 {
            if mask & (1 << bit) == 0 && bit != 8 {
                continue;
            }
            let Some(name) = sub_header(bit) else {
                break;
            };
            let size = self.named_type_size(base, name);
            if size == 0 {
                break;
            }
            va = va - size;
            let request = DisplayRequest::new(name).depth(SUB_HEADER_DEPTH).at(va).hex_ascii(hex_ascii);
            if let Ok(dump) = self.display_locked(base, &request) {
                out.push_str("\n======\n\n");
                out.push_str(&dump.text);
            }
        }
    }

    fn named_type_size(&self, base: u64, type_name: &str) -> u64
    {
        self.backend.type_by_name(base, type_name).map_or(0, |symbol| symbol.size)
    }
}
