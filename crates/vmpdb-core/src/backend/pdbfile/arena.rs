//! Owned type graph built from a PDB type stream.
//!
//! The `pdb` crate hands out borrowed, lazily parsed records. Queries need
//! stable ids and random access long after the file is closed, so every
//! type reachable from a named structure, union or enumeration is copied
//! into a flat arena once, at load time. Data members and base classes get
//! their own nodes so they can be queried like any other id.
//!
//! Modifiers (`const`, `volatile`) and forward references are resolved while
//! interning, so they never show up as nodes of their own.

use std::collections::HashMap;

use pdb::{BaseClassType, FallibleIterator, MemberType, RawString, TypeData, TypeFinder, TypeIndex, TypeInformation};

use crate::backend::{BackendError, BackendResult, BaseType, SymTag, TypeId, TypeInfoKind, TypeInfoValue};

/// Indices below this encode a primitive type in the index itself.
const FIRST_COMPOUND_INDEX: u32 = 0x1000;

/// Upper bound on modifier and forward-reference chains.
const MAX_ALIAS_HOPS: usize = 16;

/// Upper bound on field-list continuation chains.
const MAX_FIELD_LISTS: usize = 4096;

#[derive(Debug)]
pub(super) struct Node
{
    pub(super) name: Option<String>,
    pub(super) tag: SymTag,
    /// Byte length of a type, bit length of a bitfield member
    pub(super) length: Option<u64>,
    pub(super) offset: Option<u32>,
    pub(super) type_id: Option<TypeId>,
    pub(super) pointee: Option<TypeId>,
    pub(super) index_type: Option<TypeId>,
    pub(super) base_type: Option<BaseType>,
    pub(super) bit_position: Option<u64>,
    pub(super) children: Vec<TypeId>,
}

impl Node
{
    fn new(tag: SymTag) -> Self
    {
        Node {
            name: None,
            tag,
            length: None,
            offset: None,
            type_id: None,
            pointee: None,
            index_type: None,
            base_type: None,
            bit_position: None,
            children: Vec::new(),
        }
    }

    fn named(tag: SymTag, name: RawString<'_>) -> Self
    {
        let name = name.to_string();
        let mut node = Node::new(tag);
        node.name = (!name.is_empty()).then(|| name.into_owned());
        node
    }
}

/// Byte size of a primitive kind (low byte of a primitive type index).
pub(super) const fn primitive_size(kind: u32) -> u64
{
    match kind {
        0x10 | 0x20 | 0x68 | 0x69 | 0x70 | 0x30 | 0x7c => 1,
        0x11 | 0x21 | 0x72 | 0x73 | 0x71 | 0x7a | 0x31 | 0x46 => 2,
        0x12 | 0x22 | 0x74 | 0x75 | 0x7b | 0x32 | 0x40 | 0x45 | 0x08 => 4,
        0x44 => 6,
        0x13 | 0x23 | 0x76 | 0x77 | 0x33 | 0x41 | 0x50 => 8,
        0x42 => 10,
        0x14 | 0x24 | 0x78 | 0x79 | 0x43 | 0x51 => 16,
        _ => 0,
    }
}

/// Base type code of a primitive kind.
pub(super) const fn primitive_base(kind: u32) -> BaseType
{
    match kind {
        0x03 => BaseType::Void,
        0x08 => BaseType::HResult,
        0x10 | 0x70 => BaseType::Char,
        0x71 | 0x7a => BaseType::WChar,
        0x12 => BaseType::Long,
        0x22 => BaseType::ULong,
        0x11 | 0x13 | 0x14 | 0x68 | 0x72 | 0x74 | 0x76 | 0x78 => BaseType::Int,
        0x20 | 0x21 | 0x23 | 0x24 | 0x69 | 0x73 | 0x75 | 0x77 | 0x79 | 0x7b | 0x7c => BaseType::UInt,
        0x30..=0x33 => BaseType::Bool,
        0x40..=0x46 => BaseType::Float,
        0x50..=0x53 => BaseType::Complex,
        _ => BaseType::NoType,
    }
}

/// Pointer width implied by a primitive indirection mode.
const fn indirection_size(mode: u32, pointer_size: u64) -> u64
{
    match mode {
        1 => 2,
        4 | 5 => 4,
        6 => 8,
        7 => 16,
        _ => pointer_size,
    }
}

pub(super) struct TypeArena
{
    nodes: Vec<Node>,
    named: Vec<TypeId>,
}

impl TypeArena
{
    /// Copy every named definition (and everything it references) out of
    /// the type stream. The first definition of a name wins.
    pub(super) fn build(info: &TypeInformation<'_>, pointer_size: u64) -> BackendResult<Self>
    {
        let mut finder = info.finder();
        let mut definitions = HashMap::new();
        let mut roots = Vec::new();

        let mut iter = info.iter();
        while let Some(item) = iter.next()? {
            finder.update(&iter);
            let (name, forward) = match item.parse() {
                Ok(TypeData::Class(class)) => (class.name, class.properties.forward_reference()),
                Ok(TypeData::Union(union)) => (union.name, union.properties.forward_reference()),
                Ok(TypeData::Enumeration(enumeration)) => (enumeration.name, enumeration.properties.forward_reference()),
                _ => continue,
            };
            let name = name.to_string();
            if forward || name.is_empty() || definitions.contains_key(name.as_ref()) {
                continue;
            }
            definitions.insert(name.into_owned(), item.index());
            roots.push(item.index());
        }

        let mut builder = Builder {
            finder: &finder,
            definitions: &definitions,
            pointer_size,
            nodes: Vec::new(),
            ids: HashMap::new(),
            pending: Vec::new(),
        };
        let named = roots.into_iter().map(|index| builder.intern(index)).collect();
        builder.drain();
        Ok(TypeArena { nodes: builder.nodes, named })
    }

    pub(super) fn node(&self, id: TypeId) -> BackendResult<&Node>
    {
        id.checked_sub(1)
            .and_then(|slot| self.nodes.get(slot as usize))
            .ok_or(BackendError::UnknownTypeId(id))
    }

    /// Named definitions in type-stream order.
    pub(super) fn named(&self) -> impl Iterator<Item = (TypeId, &Node)>
    {
        self.named.iter().filter_map(|&id| self.node(id).ok().map(|node| (id, node)))
    }

    pub(super) fn len(&self) -> usize
    {
        self.nodes.len()
    }

    pub(super) fn info(&self, id: TypeId, kind: TypeInfoKind) -> BackendResult<TypeInfoValue>
    {
        let node = self.node(id)?;
        let value = match kind {
            TypeInfoKind::SymName => node.name.clone().map(TypeInfoValue::Name),
            TypeInfoKind::Length => node.length.map(TypeInfoValue::Number),
            TypeInfoKind::Offset => node.offset.map(|offset| TypeInfoValue::Number(u64::from(offset))),
            TypeInfoKind::TypeId => node.type_id.map(TypeInfoValue::Id),
            TypeInfoKind::SymTag => Some(TypeInfoValue::Tag(node.tag)),
            TypeInfoKind::Count => self.element_count(node).map(TypeInfoValue::Number),
            TypeInfoKind::ChildrenCount => matches!(node.tag, SymTag::Udt | SymTag::Enum)
                .then(|| TypeInfoValue::Number(node.children.len() as u64)),
            TypeInfoKind::Type => node.pointee.map(TypeInfoValue::Id),
            TypeInfoKind::ArrayIndexTypeId => node.index_type.map(TypeInfoValue::Id),
            TypeInfoKind::BaseType => node.base_type.map(TypeInfoValue::Base),
            TypeInfoKind::BitPosition => node.bit_position.map(TypeInfoValue::Number),
        };
        value.ok_or(BackendError::NotAvailable { id, kind })
    }

    fn element_count(&self, node: &Node) -> Option<u64>
    {
        if node.tag != SymTag::ArrayType {
            return None;
        }
        let element = self.node(node.pointee?).ok()?.length.filter(|&length| length > 0)?;
        Some(node.length? / element)
    }
}

/// Worklist-driven copier. Interning allocates an id immediately and defers
/// the description, so self-referencing structures never recurse.
struct Builder<'a, 't>
{
    finder: &'a TypeFinder<'t>,
    definitions: &'a HashMap<String, TypeIndex>,
    pointer_size: u64,
    nodes: Vec<Node>,
    ids: HashMap<u32, TypeId>,
    pending: Vec<(TypeId, TypeIndex)>,
}

impl<'t> Builder<'_, 't>
{
    fn parse(&self, index: TypeIndex) -> Option<TypeData<'t>>
    {
        if index.0 < FIRST_COMPOUND_INDEX {
            return None;
        }
        self.finder.find(index).ok()?.parse().ok()
    }

    fn definition(&self, name: RawString<'_>) -> Option<TypeIndex>
    {
        self.definitions.get(name.to_string().as_ref()).copied()
    }

    /// Follow modifiers, bitfield wrappers and forward references to the
    /// index that actually describes the type.
    fn canonical(&self, mut index: TypeIndex) -> TypeIndex
    {
        for _ in 0..MAX_ALIAS_HOPS {
            let next = match self.parse(index) {
                Some(TypeData::Modifier(modifier)) => Some(modifier.underlying_type),
                Some(TypeData::Bitfield(bitfield)) => Some(bitfield.underlying_type),
                Some(TypeData::Class(class)) if class.properties.forward_reference() => self.definition(class.name),
                Some(TypeData::Union(union)) if union.properties.forward_reference() => self.definition(union.name),
                Some(TypeData::Enumeration(enumeration)) if enumeration.properties.forward_reference() => {
                    self.definition(enumeration.name)
                }
                _ => None,
            };
            match next {
                Some(next) if next != index => index = next,
                _ => break,
            }
        }
        index
    }

    fn push(&mut self, node: Node) -> TypeId
    {
        self.nodes.push(node);
        TypeId::try_from(self.nodes.len()).unwrap_or(TypeId::MAX)
    }

    fn intern(&mut self, index: TypeIndex) -> TypeId
    {
        let index = self.canonical(index);
        if let Some(&id) = self.ids.get(&index.0) {
            return id;
        }
        let id = self.push(Node::new(SymTag::Null));
        self.ids.insert(index.0, id);
        self.pending.push((id, index));
        id
    }

    fn drain(&mut self)
    {
        while let Some((id, index)) = self.pending.pop() {
            let node = self.describe(index);
            if let Some(slot) = id.checked_sub(1).and_then(|slot| self.nodes.get_mut(slot as usize)) {
                *slot = node;
            }
        }
    }

    fn describe(&mut self, index: TypeIndex) -> Node
    {
        if index.0 < FIRST_COMPOUND_INDEX {
            return self.primitive(index.0);
        }
        let Some(data) = self.parse(index) else {
            return Node::new(SymTag::Null);
        };

        match data {
            TypeData::Class(class) => {
                let mut node = Node::named(SymTag::Udt, class.name);
                node.length = Some(u64::from(class.size));
                if let Some(fields) = class.fields {
                    node.children = self.members(fields);
                }
                node
            }
            TypeData::Union(union) => {
                let mut node = Node::named(SymTag::Udt, union.name);
                node.length = Some(u64::from(union.size));
                node.children = self.members(union.fields);
                node
            }
            TypeData::Enumeration(enumeration) => {
                let mut node = Node::named(SymTag::Enum, enumeration.name);
                let underlying = enumeration.underlying_type.0;
                if underlying < FIRST_COMPOUND_INDEX {
                    node.length = Some(primitive_size(underlying & 0xff));
                    node.base_type = Some(primitive_base(underlying & 0xff));
                }
                node.pointee = Some(self.intern(enumeration.underlying_type));
                node
            }
            TypeData::Pointer(pointer) => {
                let mut node = Node::new(SymTag::PointerType);
                node.length = Some(match pointer.attributes.size() {
                    0 => self.pointer_size,
                    size => u64::from(size),
                });
                node.pointee = Some(self.intern(pointer.underlying_type));
                node
            }
            TypeData::Array(array) => {
                let mut node = Node::new(SymTag::ArrayType);
                node.length = Some(array.dimensions.iter().copied().map(u64::from).max().unwrap_or(0));
                node.pointee = Some(self.intern(array.element_type));
                node.index_type = Some(self.intern(array.indexing_type));
                node
            }
            TypeData::Procedure(_) | TypeData::MemberFunction(_) => Node::new(SymTag::FunctionType),
            _ => Node::new(SymTag::Null),
        }
    }

    fn primitive(&mut self, raw: u32) -> Node
    {
        let kind = raw & 0xff;
        let mode = (raw >> 8) & 0xf;
        if mode != 0 {
            let mut node = Node::new(SymTag::PointerType);
            node.length = Some(indirection_size(mode, self.pointer_size));
            node.pointee = Some(self.intern(TypeIndex(kind)));
            return node;
        }
        let mut node = Node::new(SymTag::BaseType);
        node.length = Some(primitive_size(kind));
        node.base_type = Some(primitive_base(kind));
        node
    }

    fn members(&mut self, fields: TypeIndex) -> Vec<TypeId>
    {
        let mut children = Vec::new();
        let mut next = Some(fields);
        for _ in 0..MAX_FIELD_LISTS {
            let Some(index) = next.take() else {
                break;
            };
            let Some(TypeData::FieldList(list)) = self.parse(index) else {
                break;
            };
            for field in &list.fields {
                match field {
                    TypeData::Member(member) => children.push(self.member(member)),
                    TypeData::BaseClass(base) => children.push(self.base_class(base)),
                    _ => {}
                }
            }
            next = list.continuation;
        }
        children
    }

    fn member(&mut self, member: &MemberType<'t>) -> TypeId
    {
        let mut node = Node::named(SymTag::Data, member.name);
        node.offset = u32::try_from(member.offset).ok();
        if let Some(TypeData::Bitfield(bitfield)) = self.parse(member.field_type) {
            node.type_id = Some(self.intern(bitfield.underlying_type));
            node.length = Some(u64::from(bitfield.length));
            node.bit_position = Some(u64::from(bitfield.position));
        } else {
            node.type_id = Some(self.intern(member.field_type));
        }
        self.push(node)
    }

    fn base_class(&mut self, base: &BaseClassType) -> TypeId
    {
        let mut node = Node::new(SymTag::BaseClass);
        let ty = self.intern(base.base_class);
        node.offset = u32::try_from(base.offset).ok();
        node.type_id = Some(ty);
        self.push(node)
    }
}
