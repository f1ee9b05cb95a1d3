//! Shared test doubles for the integration tests.
//!
//! [`MockBackend`] serves one in-memory type table and symbol list for every
//! database it loads and counts the calls the registry makes into it.
//! [`ScriptedPe`] answers PE queries from a fixed table of modules.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vmpdb_core::backend::{
    BackendError, BackendResult, BaseType, Pattern, SymTag, SymbolBackend, SymbolRecord, TypeId, TypeInfoKind,
    TypeInfoValue,
};
use vmpdb_core::memory::SparseMemory;
use vmpdb_core::pe::{CodeViewInfo, Guid, PeError, PeIntrospection};
use vmpdb_core::symbols::{BootstrapMode, Capabilities, InitOptions, PdbContext};
use vmpdb_core::types::{Address, ProcessId, TargetInfo};

pub const KERNEL_BASE: u64 = 0xffff_f800_0000_0000;
pub const KERNEL_SIZE: u32 = 0x0080_0000;
pub const KERNEL_PDB: &str = "ntkrnlmp.pdb";

pub fn kernel_codeview() -> CodeViewInfo
{
    CodeViewInfo { pdb_file_name: KERNEL_PDB.to_owned(), guid: Guid([0x42; 16]), age: 1 }
}

pub fn module_codeview(pdb_file_name: &str, seed: u8) -> CodeViewInfo
{
    CodeViewInfo { pdb_file_name: pdb_file_name.to_owned(), guid: Guid([seed; 16]), age: 1 }
}

pub fn kernel_target() -> TargetInfo
{
    TargetInfo::new_64(Address::new(KERNEL_BASE), KERNEL_SIZE)
}

#[derive(Debug, Clone, Default)]
struct MockType
{
    name: Option<String>,
    tag: Option<SymTag>,
    length: Option<u64>,
    offset: Option<u32>,
    type_id: Option<TypeId>,
    pointee: Option<TypeId>,
    base_type: Option<BaseType>,
    count: Option<u64>,
    children: Vec<TypeId>,
}

/// Type table builder. Ids start at 1 in insertion order.
#[derive(Debug, Default)]
pub struct TypeTable
{
    nodes: Vec<MockType>,
}

impl TypeTable
{
    pub fn new() -> Self
    {
        Self::default()
    }

    fn push(&mut self, node: MockType) -> TypeId
    {
        self.nodes.push(node);
        self.nodes.len() as TypeId
    }

    fn node(&self, id: TypeId) -> Option<&MockType>
    {
        self.nodes.get((id as usize).checked_sub(1)?)
    }

    pub fn base(&mut self, base: BaseType, size: u64) -> TypeId
    {
        self.push(MockType {
            tag: Some(SymTag::BaseType),
            length: Some(size),
            base_type: Some(base),
            ..MockType::default()
        })
    }

    pub fn pointer(&mut self, pointee: TypeId) -> TypeId
    {
        self.push(MockType {
            tag: Some(SymTag::PointerType),
            length: Some(8),
            pointee: Some(pointee),
            ..MockType::default()
        })
    }

    pub fn function(&mut self) -> TypeId
    {
        self.push(MockType { tag: Some(SymTag::FunctionType), ..MockType::default() })
    }

    pub fn array(&mut self, element: TypeId, count: u64) -> TypeId
    {
        let element_length = self.node(element).and_then(|node| node.length).unwrap_or(0);
        self.push(MockType {
            tag: Some(SymTag::ArrayType),
            length: Some(element_length * count),
            pointee: Some(element),
            count: Some(count),
            ..MockType::default()
        })
    }

    pub fn enumeration(&mut self, name: &str, underlying: TypeId) -> TypeId
    {
        let length = self.node(underlying).and_then(|node| node.length);
        self.push(MockType {
            name: Some(name.to_owned()),
            tag: Some(SymTag::Enum),
            length,
            pointee: Some(underlying),
            ..MockType::default()
        })
    }

    pub fn udt(&mut self, name: &str, length: u64) -> TypeId
    {
        self.push(MockType {
            name: Some(name.to_owned()),
            tag: Some(SymTag::Udt),
            length: Some(length),
            ..MockType::default()
        })
    }

    pub fn member(&mut self, parent: TypeId, name: &str, offset: u32, ty: TypeId) -> TypeId
    {
        self.add_member(parent, name, offset, ty, None)
    }

    pub fn bitfield(&mut self, parent: TypeId, name: &str, offset: u32, ty: TypeId, bits: u64) -> TypeId
    {
        self.add_member(parent, name, offset, ty, Some(bits))
    }

    fn add_member(&mut self, parent: TypeId, name: &str, offset: u32, ty: TypeId, bits: Option<u64>) -> TypeId
    {
        let id = self.push(MockType {
            name: Some(name.to_owned()),
            tag: Some(SymTag::Data),
            length: bits,
            offset: Some(offset),
            type_id: Some(ty),
            ..MockType::default()
        });
        if let Some(parent) = self.nodes.get_mut(parent as usize - 1) {
            parent.children.push(id);
        }
        id
    }

    fn info(&self, id: TypeId, kind: TypeInfoKind) -> BackendResult<TypeInfoValue>
    {
        let node = self.node(id).ok_or(BackendError::UnknownTypeId(id))?;
        let value = match kind {
            TypeInfoKind::SymName => node.name.clone().map(TypeInfoValue::Name),
            TypeInfoKind::Length => node.length.map(TypeInfoValue::Number),
            TypeInfoKind::Offset => node.offset.map(|offset| TypeInfoValue::Number(u64::from(offset))),
            TypeInfoKind::TypeId => node.type_id.map(TypeInfoValue::Id),
            TypeInfoKind::SymTag => node.tag.map(TypeInfoValue::Tag),
            TypeInfoKind::Count => node.count.map(TypeInfoValue::Number),
            TypeInfoKind::ChildrenCount => {
                (node.tag == Some(SymTag::Udt)).then(|| TypeInfoValue::Number(node.children.len() as u64))
            }
            TypeInfoKind::Type => node.pointee.map(TypeInfoValue::Id),
            TypeInfoKind::BaseType => node.base_type.map(TypeInfoValue::Base),
            TypeInfoKind::ArrayIndexTypeId | TypeInfoKind::BitPosition => None,
        };
        value.ok_or(BackendError::NotAvailable { id, kind })
    }

    fn named(&self) -> impl Iterator<Item = (TypeId, &MockType)>
    {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.tag == Some(SymTag::Udt) && node.name.is_some())
            .map(|(index, node)| (index as TypeId + 1, node))
    }
}

/// In-memory [`SymbolBackend`] that counts calls.
pub struct MockBackend
{
    files: HashMap<String, PathBuf>,
    corrupt: HashSet<PathBuf>,
    unmapped: HashSet<PathBuf>,
    types: TypeTable,
    symbols: Vec<(String, u64)>,
    loaded: Mutex<HashMap<u64, PathBuf>>,
    symbol_path: Mutex<Option<String>>,
    pub find_calls: AtomicUsize,
    pub load_calls: AtomicUsize,
    pub unload_calls: AtomicUsize,
    pub cleanup_calls: AtomicUsize,
}

impl MockBackend
{
    pub fn new(types: TypeTable) -> Self
    {
        MockBackend {
            files: HashMap::new(),
            corrupt: HashSet::new(),
            unmapped: HashSet::new(),
            types,
            symbols: Vec::new(),
            loaded: Mutex::new(HashMap::new()),
            symbol_path: Mutex::new(None),
            find_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
            unload_calls: AtomicUsize::new(0),
            cleanup_calls: AtomicUsize::new(0),
        }
    }

    /// Make `pdb_file_name` resolvable on the symbol path.
    pub fn with_file(mut self, pdb_file_name: &str) -> Self
    {
        let path = PathBuf::from(format!("/symbols/{pdb_file_name}"));
        self.files.insert(pdb_file_name.to_ascii_lowercase(), path);
        self
    }

    /// Make `pdb_file_name` resolvable but fail to parse it.
    pub fn with_corrupt_file(mut self, pdb_file_name: &str) -> Self
    {
        self = self.with_file(pdb_file_name);
        self.corrupt.insert(PathBuf::from(format!("/symbols/{pdb_file_name}")));
        self
    }

    /// Make `pdb_file_name` resolvable but have its load report base 0.
    pub fn with_unmapped_file(mut self, pdb_file_name: &str) -> Self
    {
        self = self.with_file(pdb_file_name);
        self.unmapped.insert(PathBuf::from(format!("/symbols/{pdb_file_name}")));
        self
    }

    /// Add a symbol at `rva` from the module base.
    pub fn with_symbol(mut self, name: &str, rva: u64) -> Self
    {
        self.symbols.push((name.to_owned(), rva));
        self
    }

    pub fn symbol_path(&self) -> Option<String>
    {
        self.symbol_path.lock().unwrap().clone()
    }

    pub fn loaded_count(&self) -> usize
    {
        self.loaded.lock().unwrap().len()
    }

    pub fn count(counter: &AtomicUsize) -> usize
    {
        counter.load(Ordering::SeqCst)
    }

    fn check_loaded(&self, base: u64) -> BackendResult<()>
    {
        if self.loaded.lock().unwrap().contains_key(&base) {
            Ok(())
        } else {
            Err(BackendError::UnknownDatabase(base))
        }
    }

    fn symbol_record(base: u64, name: &str, rva: u64) -> SymbolRecord
    {
        SymbolRecord {
            name: name.to_owned(),
            address: base + rva,
            module_base: base,
            size: 0,
            type_id: 0,
            tag: SymTag::PublicSymbol,
        }
    }
}

impl SymbolBackend for MockBackend
{
    fn initialize(&self, symbol_path: &str) -> BackendResult<()>
    {
        *self.symbol_path.lock().unwrap() = Some(symbol_path.to_owned());
        Ok(())
    }

    fn cleanup(&self)
    {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        self.loaded.lock().unwrap().clear();
    }

    fn find_debug_file(&self, name: &str, guid: &Guid, age: u32) -> BackendResult<PathBuf>
    {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.files.get(&name.to_ascii_lowercase()).cloned().ok_or_else(|| BackendError::FileNotFound {
            name: name.to_owned(),
            key: guid.symstore_key(age),
        })
    }

    fn load_database(&self, path: &Path, slot_base: u64, _size: u32) -> BackendResult<u64>
    {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if self.corrupt.contains(path) {
            return Err(BackendError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt PDB")));
        }
        if self.unmapped.contains(path) {
            return Ok(0);
        }
        let mut loaded = self.loaded.lock().unwrap();
        if loaded.contains_key(&slot_base) {
            return Err(BackendError::SlotInUse(slot_base));
        }
        loaded.insert(slot_base, path.to_path_buf());
        Ok(slot_base)
    }

    fn unload_database(&self, base: u64) -> BackendResult<()>
    {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        self.loaded.lock().unwrap().remove(&base).map(|_| ()).ok_or(BackendError::UnknownDatabase(base))
    }

    fn enumerate_symbols(
        &self,
        base: u64,
        pattern: &str,
        visit: &mut dyn FnMut(&SymbolRecord) -> ControlFlow<()>,
    ) -> BackendResult<()>
    {
        self.check_loaded(base)?;
        let pattern = Pattern::new(pattern)?;
        for (name, rva) in self.symbols.iter().filter(|(name, _)| pattern.matches(name)) {
            if visit(&Self::symbol_record(base, name, *rva)).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn enumerate_types(
        &self,
        base: u64,
        pattern: &str,
        visit: &mut dyn FnMut(&SymbolRecord) -> ControlFlow<()>,
    ) -> BackendResult<()>
    {
        self.check_loaded(base)?;
        let pattern = Pattern::new(pattern)?;
        for (id, node) in self.types.named() {
            let name = node.name.as_deref().unwrap_or_default();
            if !pattern.matches(name) {
                continue;
            }
            let record = SymbolRecord {
                name: name.to_owned(),
                address: 0,
                module_base: base,
                size: node.length.unwrap_or(0),
                type_id: id,
                tag: SymTag::Udt,
            };
            if visit(&record).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn symbol_by_name(&self, base: u64, name: &str) -> BackendResult<SymbolRecord>
    {
        let mut found = None;
        self.enumerate_symbols(base, name, &mut |symbol| {
            found = Some(symbol.clone());
            ControlFlow::Break(())
        })?;
        found.ok_or_else(|| BackendError::SymbolNotFound(name.to_owned()))
    }

    fn type_by_name(&self, base: u64, name: &str) -> BackendResult<SymbolRecord>
    {
        let mut found = None;
        self.enumerate_types(base, name, &mut |symbol| {
            found = Some(symbol.clone());
            ControlFlow::Break(())
        })?;
        found.ok_or_else(|| BackendError::TypeNotFound(name.to_owned()))
    }

    fn symbol_from_address(&self, base: u64, address: u64) -> BackendResult<(SymbolRecord, u64)>
    {
        self.check_loaded(base)?;
        let rva = address.checked_sub(base).ok_or(BackendError::NoSymbolAt(address))?;
        self.symbols
            .iter()
            .filter(|(_, start)| *start <= rva)
            .max_by_key(|(_, start)| *start)
            .map(|(name, start)| (Self::symbol_record(base, name, *start), rva - start))
            .ok_or(BackendError::NoSymbolAt(address))
    }

    fn type_info(&self, base: u64, id: TypeId, kind: TypeInfoKind) -> BackendResult<TypeInfoValue>
    {
        self.check_loaded(base)?;
        self.types.info(id, kind)
    }

    fn type_children(&self, base: u64, id: TypeId) -> BackendResult<Vec<TypeId>>
    {
        self.check_loaded(base)?;
        self.types.node(id).map(|node| node.children.clone()).ok_or(BackendError::UnknownTypeId(id))
    }
}

/// [`PeIntrospection`] answering from a fixed module table.
#[derive(Default)]
pub struct ScriptedPe
{
    modules: Mutex<HashMap<Address, (u32, Option<CodeViewInfo>)>>,
}

impl ScriptedPe
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn with_module(self, base: u64, size: u32, codeview: Option<CodeViewInfo>) -> Self
    {
        self.modules.lock().unwrap().insert(Address::new(base), (size, codeview));
        self
    }
}

impl PeIntrospection for ScriptedPe
{
    fn image_size(&self, _process: ProcessId, base: Address) -> Result<u32, PeError>
    {
        self.modules
            .lock()
            .unwrap()
            .get(&base)
            .map(|(size, _)| *size)
            .ok_or_else(|| PeError::InvalidImage(format!("nothing mapped at {base}")))
    }

    fn codeview(&self, _process: ProcessId, base: Address) -> Result<CodeViewInfo, PeError>
    {
        match self.modules.lock().unwrap().get(&base) {
            Some((_, Some(codeview))) => Ok(codeview.clone()),
            Some((_, None)) => Err(PeError::NoCodeView),
            None => Err(PeError::InvalidImage(format!("nothing mapped at {base}"))),
        }
    }
}

/// Everything a test needs to poke at a context.
pub struct Fixture
{
    pub backend: Arc<MockBackend>,
    pub memory: Arc<SparseMemory>,
    pub ctx: Arc<PdbContext>,
}

impl Fixture
{
    /// Context bootstrapped on the calling thread with the kernel PE
    /// reporting [`kernel_codeview`].
    pub fn kernel(backend: MockBackend) -> Self
    {
        let pe = ScriptedPe::new().with_module(KERNEL_BASE, KERNEL_SIZE, Some(kernel_codeview()));
        Self::with_pe(backend, pe, Arc::new(SparseMemory::new()), None)
    }

    pub fn with_pe(backend: MockBackend, pe: ScriptedPe, memory: Arc<SparseMemory>, codeview: Option<CodeViewInfo>)
        -> Self
    {
        Self::build(backend, pe, memory, codeview, kernel_target())
    }

    pub fn build(
        backend: MockBackend,
        pe: ScriptedPe,
        memory: Arc<SparseMemory>,
        codeview: Option<CodeViewInfo>,
        target: TargetInfo,
    ) -> Self
    {
        let backend = Arc::new(backend);
        let capabilities = Capabilities { backend: backend.clone(), pe: Arc::new(pe), memory: memory.clone() };
        let options =
            InitOptions { symbol_path: "srv*/tmp/Symbols".to_owned(), codeview, mode: BootstrapMode::Sync };
        let ctx = PdbContext::initialize(capabilities, target, options).unwrap();
        Fixture { backend, memory, ctx }
    }
}

/// Backend with the kernel PDB available and a handful of symbols.
pub fn kernel_backend(types: TypeTable) -> MockBackend
{
    MockBackend::new(types)
        .with_file(KERNEL_PDB)
        .with_symbol("KiSystemCall64", 0x1000)
        .with_symbol("PsInitialSystemProcess", 0x2000)
        .with_symbol("PsLoadedModuleList", 0x2100)
}
