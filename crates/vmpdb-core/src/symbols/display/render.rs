//! Line-by-line rendering of UDT members.

use crate::backend::{BaseType, BatchTarget, SymTag, SymbolBackend, TypeId, TypeInfoKind, TypeRecord};
use crate::memory::MemoryAccess;
use crate::types::{Address, TargetInfo};

/// Maximum size in bytes of a rendered display.
pub const OUTPUT_LIMIT: usize = 0x10000;

/// Maximum characters in one rendered line.
const LINE_LIMIT: usize = 259;

/// Column the live value separator is aligned to.
const VALUE_COLUMN: usize = 60;

/// Width reserved for the member name at nesting level zero.
const NAME_WIDTH: usize = 24;

/// Longest `UNICODE_STRING` buffer (in bytes) read inline.
const MAX_INLINE_STRING: usize = 520;

const MEMBER_KINDS: [TypeInfoKind; 4] =
    [TypeInfoKind::SymName, TypeInfoKind::Length, TypeInfoKind::Offset, TypeInfoKind::TypeId];

const TYPE_KINDS: [TypeInfoKind; 8] = [
    TypeInfoKind::SymName,
    TypeInfoKind::Length,
    TypeInfoKind::SymTag,
    TypeInfoKind::Count,
    TypeInfoKind::ChildrenCount,
    TypeInfoKind::Type,
    TypeInfoKind::ArrayIndexTypeId,
    TypeInfoKind::BaseType,
];

/// Structs shown as a single scalar line instead of being expanded.
fn is_opaque(type_name: &str) -> bool
{
    type_name == "_LARGE_INTEGER"
        || type_name == "_KEVENT"
        || type_name.get(..4).is_some_and(|prefix| prefix.eq_ignore_ascii_case("_EX_"))
}

/// Bit position tracker for consecutive bitfield members.
///
/// Consecutive bitfields sharing a storage unit are numbered from the low
/// bit upwards. The position restarts at zero when the storage size changes,
/// the unit is exhausted, or the storage size is not 1, 2, 4 or 8 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BitCursor
{
    position: u64,
    storage: u64,
}

impl BitCursor
{
    /// Place a member of `storage` bytes and `bit_length` bits.
    ///
    /// Returns the member's bit position and the cursor for the next member.
    pub(crate) fn place(self, storage: u64, bit_length: u64) -> (u64, BitCursor)
    {
        let restart = self.position != 0
            && (self.storage != storage || self.position >= storage * 8 || !matches!(storage, 1 | 2 | 4 | 8));
        let position = if restart { 0 } else { self.position };
        (position, BitCursor { position: position + bit_length, storage })
    }
}

/// Output buffer with a hard byte limit.
///
/// Text beyond the limit is dropped (cut at a character boundary).
#[derive(Debug)]
pub(crate) struct TextSink
{
    text: String,
    limit: usize,
}

impl TextSink
{
    pub(crate) fn new(limit: usize) -> Self
    {
        TextSink { text: String::new(), limit }
    }

    pub(crate) fn push_str(&mut self, s: &str)
    {
        let room = self.limit.saturating_sub(self.text.len());
        if s.len() <= room {
            self.text.push_str(s);
            return;
        }
        let mut end = room;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&s[..end]);
    }

    pub(crate) fn is_empty(&self) -> bool
    {
        self.text.is_empty()
    }

    pub(crate) fn into_string(self) -> String
    {
        self.text
    }
}

/// One output line, capped at [`LINE_LIMIT`] characters.
#[derive(Debug, Default)]
struct Line
{
    text: String,
    chars: usize,
}

impl Line
{
    fn push(&mut self, s: &str)
    {
        for ch in s.chars() {
            if self.chars >= LINE_LIMIT {
                return;
            }
            self.text.push(ch);
            self.chars += 1;
        }
    }

    fn is_empty(&self) -> bool
    {
        self.text.is_empty()
    }
}

/// A member and the properties of its type, merged from two batch queries.
#[derive(Debug)]
struct Field
{
    name: String,
    bit_length: u64,
    offset: u32,
    type_id: TypeId,
    type_name: Option<String>,
    length: u64,
    tag: SymTag,
    count: u32,
    children: u32,
    pointee: Option<TypeId>,
    /// The type references another one (pointee, element or enum underlying type).
    has_type_index: bool,
    base_type: Option<BaseType>,
}

impl Field
{
    fn new(member: TypeRecord, ty: TypeRecord) -> Self
    {
        let pointee = ty.pointee.filter(|&id| id != 0);
        Field {
            name: member.name.unwrap_or_default(),
            bit_length: member.length.unwrap_or(0),
            offset: member.offset.unwrap_or(0),
            type_id: member.type_id.unwrap_or(0),
            type_name: ty.name,
            length: ty.length.unwrap_or(0),
            tag: ty.tag.unwrap_or(SymTag::Null),
            count: ty.count.unwrap_or(0),
            children: ty.children.unwrap_or(0),
            pointee,
            has_type_index: pointee.is_some(),
            base_type: ty.base_type,
        }
    }

    /// Size of one element (the whole member unless it is an array).
    fn storage_size(&self) -> u64
    {
        if self.count > 0 {
            self.length / u64::from(self.count)
        } else {
            self.length
        }
    }
}

fn format_value(value: u64, size: u64) -> String
{
    if value < 10 {
        return format!("{value:X}");
    }
    match size {
        1 => format!("0x{value:02X}"),
        2 => format!("0x{value:04X}"),
        4 => format!("0x{value:08X}"),
        _ => format!("0x{value:016X}"),
    }
}

fn read_le(bytes: &[u8]) -> u64
{
    let mut raw = [0u8; 8];
    raw[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

/// Recursive member renderer for one loaded database.
pub(crate) struct Renderer<'a>
{
    backend: &'a dyn SymbolBackend,
    memory: &'a dyn MemoryAccess,
    target: &'a TargetInfo,
    base: u64,
    max_depth: u8,
    out: TextSink,
}

impl<'a> Renderer<'a>
{
    pub(crate) fn new(
        backend: &'a dyn SymbolBackend,
        memory: &'a dyn MemoryAccess,
        target: &'a TargetInfo,
        base: u64,
        max_depth: u8,
    ) -> Self
    {
        Renderer { backend, memory, target, base, max_depth, out: TextSink::new(OUTPUT_LIMIT) }
    }

    pub(crate) fn push_str(&mut self, s: &str)
    {
        self.out.push_str(s);
    }

    pub(crate) fn finish(self) -> TextSink
    {
        self.out
    }

    /// Render the `child_count` members of `type_id` at nesting `level`.
    ///
    /// `parent_name` is the name of the type being expanded and `memory` the
    /// live bytes of its instance, if any. Rendering of a level stops
    /// silently if the backend cannot describe the members.
    pub(crate) fn render_children(
        &mut self,
        level: u8,
        type_id: TypeId,
        child_count: u32,
        parent_name: Option<&str>,
        memory: Option<&[u8]>,
    )
    {
        let Some(fields) = self.fetch_fields(type_id, child_count) else {
            return;
        };
        let mut cursor = BitCursor::default();
        for (index, field) in fields.into_iter().enumerate() {
            cursor = self.render_field(level, index, child_count, field, cursor, parent_name, memory);
        }
    }

    fn fetch_fields(&self, type_id: TypeId, child_count: u32) -> Option<Vec<Field>>
    {
        let members = self.backend.type_info_batch(self.base, BatchTarget::ChildrenOf(type_id), &MEMBER_KINDS).ok()?;
        if members.len() != child_count as usize {
            return None;
        }
        let ids: Vec<TypeId> = members.iter().map(|member| member.type_id.unwrap_or(0)).collect();
        let types = self.backend.type_info_batch(self.base, BatchTarget::Types(&ids), &TYPE_KINDS).ok()?;
        if types.len() != members.len() {
            return None;
        }
        Some(members.into_iter().zip(types).map(|(member, ty)| Field::new(member, ty)).collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn render_field(
        &mut self,
        level: u8,
        index: usize,
        sibling_count: u32,
        mut field: Field,
        cursor: BitCursor,
        parent_name: Option<&str>,
        memory: Option<&[u8]>,
    ) -> BitCursor
    {
        let size = field.storage_size();
        if field.type_name.is_none() && matches!(field.tag, SymTag::ArrayType | SymTag::PointerType) {
            if let Some(pointee) = field.pointee {
                field.type_name = self.type_name(pointee);
            }
        }
        let (bit_position, next) = cursor.place(size, field.bit_length);

        let indent = usize::from(level) * 2;
        let mut line = Line::default();
        line.push(&format!(
            "{:indent$}  +0x{:03x} {:<width$} : ",
            "",
            field.offset,
            field.name,
            width = NAME_WIDTH.saturating_sub(indent)
        ));
        if field.count > 0 {
            line.push(&format!("[{}] ", field.count));
        }
        if field.has_type_index {
            line.push("Ptr: ");
        }
        if field.type_name.is_none() {
            if let Some(pointee) = field.pointee {
                field.base_type = self.meta_kind(pointee);
            }
        }
        if field.tag == SymTag::Udt && field.type_name.as_deref().is_some_and(is_opaque) {
            field.tag = SymTag::BaseType;
        }

        if field.tag == SymTag::Udt {
            line.push(field.type_name.as_deref().unwrap_or_default());
            self.commit(&line);

            let offset = field.offset as usize;
            let fits = memory.map_or(true, |bytes| offset as u64 + field.length <= bytes.len() as u64);
            if field.children > 0 && level < self.max_depth && fits {
                let nested = memory.map(|bytes| &bytes[offset..]);
                self.render_children(level + 1, field.type_id, field.children, field.type_name.as_deref(), nested);
            }
            return next;
        }

        let name = match field.type_name.as_deref() {
            Some(name) => name,
            None => field.base_type.unwrap_or(BaseType::NoType).display_name(size),
        };
        line.push(name);
        if field.bit_length > 0 {
            line.push(&format!(" bit[{}:{}]", bit_position, bit_position + field.bit_length - 1));
        }

        if let Some(bytes) = memory {
            if matches!(field.tag, SymTag::BaseType | SymTag::PointerType) && matches!(size, 1 | 2 | 4 | 8) {
                let start = field.offset as usize;
                if let Some(raw) = bytes.get(start..start + size as usize) {
                    let mut value = read_le(raw);
                    if field.bit_length > 0 {
                        value = value.checked_shr(bit_position as u32).unwrap_or(0);
                        value &= 1u64.checked_shl(field.bit_length as u32).map_or(u64::MAX, |bit| bit - 1);
                    }
                    let pad = VALUE_COLUMN.saturating_sub(line.chars);
                    line.push(&format!("{:pad$} : {}", "", format_value(value, size)));
                }
            }
            if sibling_count == 3 && index == 2 && parent_name == Some("_UNICODE_STRING") {
                if let Some(text) = self.inline_unicode_string(bytes) {
                    let mut suffix = String::from(" - ");
                    suffix.push_str(&text);
                    line.push(&suffix);
                }
            }
        }

        if !line.is_empty() {
            self.commit(&line);
        }
        next
    }

    fn commit(&mut self, line: &Line)
    {
        self.out.push_str(&line.text);
        self.out.push_str("\n");
    }

    fn type_name(&self, id: TypeId) -> Option<String>
    {
        self.backend.type_info(self.base, id, TypeInfoKind::SymName).ok()?.into_name()
    }

    /// Base type of a pointee or element, falling back to the `function` and
    /// `pointer` pseudo kinds when it is not a primitive.
    fn meta_kind(&self, pointee: TypeId) -> Option<BaseType>
    {
        let base = self
            .backend
            .type_info(self.base, pointee, TypeInfoKind::BaseType)
            .ok()
            .and_then(|value| value.as_base())
            .filter(|&base| base != BaseType::NoType);
        if base.is_some() {
            return base;
        }
        match self.backend.type_info(self.base, pointee, TypeInfoKind::SymTag).ok()?.as_tag()? {
            SymTag::FunctionType => Some(BaseType::Function),
            SymTag::PointerType => Some(BaseType::Pointer),
            _ => None,
        }
    }

    /// Text of a `_UNICODE_STRING` instance, read from the system process.
    fn inline_unicode_string(&self, bytes: &[u8]) -> Option<String>
    {
        let is_32bit = self.target.is_32bit;
        let length = usize::from(u16::from_le_bytes(bytes.get(0..2)?.try_into().ok()?));
        let buffer = if is_32bit {
            u64::from(u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?))
        } else {
            u64::from_le_bytes(bytes.get(8..16)?.try_into().ok()?)
        };
        let buffer = Address::new(buffer);
        if !buffer.is_kernel(is_32bit) || length == 0 || length % 2 != 0 || length >= MAX_INLINE_STRING {
            return None;
        }

        let mut raw = vec![0u8; length];
        self.memory.read_exact(self.target.system_process, buffer, &mut raw).ok()?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();
        Some(String::from_utf16_lossy(&units))
    }
}
