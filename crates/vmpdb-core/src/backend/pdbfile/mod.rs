//! [`SymbolBackend`] on top of the `pdb` crate.
//!
//! Debug files are looked up in local directories taken from the symbol
//! path, using the symbol-store layout `<dir>/<name>/<KEY>/<name>` with a
//! plain `<dir>/<name>` fallback. Remote server elements of the path are
//! accepted but never contacted. A loaded database is fully parsed into
//! owned tables (public and global data symbols, plus a type arena) and the
//! file is closed again.

mod arena;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use pdb::{FallibleIterator, Rva, SymbolData};
use tracing::{debug, trace};

use self::arena::TypeArena;
use super::{
    BackendError, BackendResult, Pattern, SymTag, SymbolBackend, SymbolRecord, TypeId, TypeInfoKind, TypeInfoValue,
};
use crate::pe::Guid;

/// Split a symbol path into the local directories it names.
///
/// Elements are separated by `;`. `srv*` and `cache*` elements contribute
/// every `*`-separated part that is not an `http(s)://` URL; any other
/// element is taken as a directory.
///
/// ```rust
/// use std::path::PathBuf;
/// use vmpdb_core::backend::pdbfile::search_dirs;
///
/// let dirs = search_dirs("srv*C:\\Symbols*https://msdl.microsoft.com/download/symbols;D:\\pdbs");
/// assert_eq!(dirs, vec![PathBuf::from("C:\\Symbols"), PathBuf::from("D:\\pdbs")]);
/// ```
pub fn search_dirs(symbol_path: &str) -> Vec<PathBuf>
{
    let mut dirs = Vec::new();
    for element in symbol_path.split(';').map(str::trim).filter(|element| !element.is_empty()) {
        let mut parts = element.split('*');
        let head = parts.next().unwrap_or_default();
        if head.eq_ignore_ascii_case("srv") || head.eq_ignore_ascii_case("cache") {
            dirs.extend(parts.filter(|part| !part.is_empty() && !is_remote(part)).map(PathBuf::from));
        } else if !is_remote(element) {
            dirs.push(PathBuf::from(element));
        }
    }
    dirs
}

fn is_remote(element: &str) -> bool
{
    let lower = element.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[derive(Debug)]
struct GlobalSymbol
{
    name: String,
    rva: u32,
    tag: SymTag,
}

/// One parsed debug database.
struct Database
{
    path: PathBuf,
    size: u32,
    symbols: Vec<GlobalSymbol>,
    by_rva: BTreeMap<u32, usize>,
    types: TypeArena,
}

impl Database
{
    fn open(path: &Path, size: u32) -> BackendResult<Self>
    {
        let file = File::open(path)?;
        let mut pdb = pdb::PDB::open(file)?;

        let pointer_size = match pdb.debug_information().and_then(|dbi| dbi.machine_type()) {
            Ok(pdb::MachineType::X86) => 4,
            _ => 8,
        };

        let address_map = pdb.address_map()?;
        let globals = pdb.global_symbols()?;
        let mut symbols = Vec::new();
        let mut iter = globals.iter();
        while let Some(symbol) = iter.next()? {
            let (name, offset, tag) = match symbol.parse() {
                Ok(SymbolData::Public(public)) => {
                    let tag = if public.function { SymTag::Function } else { SymTag::PublicSymbol };
                    (public.name, public.offset, tag)
                }
                Ok(SymbolData::Data(data)) => (data.name, data.offset, SymTag::Data),
                _ => continue,
            };
            let Some(Rva(rva)) = offset.to_rva(&address_map) else {
                continue;
            };
            symbols.push(GlobalSymbol { name: name.to_string().into_owned(), rva, tag });
        }

        let mut by_rva = BTreeMap::new();
        for (slot, symbol) in symbols.iter().enumerate() {
            by_rva.entry(symbol.rva).or_insert(slot);
        }

        let type_information = pdb.type_information()?;
        let types = TypeArena::build(&type_information, pointer_size)?;

        Ok(Database { path: path.to_path_buf(), size, symbols, by_rva, types })
    }

    fn symbol_record(symbol: &GlobalSymbol, base: u64) -> SymbolRecord
    {
        SymbolRecord {
            name: symbol.name.clone(),
            address: base + u64::from(symbol.rva),
            module_base: base,
            size: 0,
            type_id: 0,
            tag: symbol.tag,
        }
    }
}

/// PDB file backend
#[derive(Default)]
pub struct PdbFileBackend
{
    search_dirs: RwLock<Option<Vec<PathBuf>>>,
    databases: RwLock<HashMap<u64, Arc<Database>>>,
}

impl PdbFileBackend
{
    pub fn new() -> Self
    {
        Self::default()
    }

    fn database(&self, base: u64) -> BackendResult<Arc<Database>>
    {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&base)
            .cloned()
            .ok_or(BackendError::UnknownDatabase(base))
    }
}

impl SymbolBackend for PdbFileBackend
{
    fn initialize(&self, symbol_path: &str) -> BackendResult<()>
    {
        let dirs = search_dirs(symbol_path);
        debug!(symbol_path, dirs = dirs.len(), "symbol backend initialized");
        *self.search_dirs.write().unwrap_or_else(PoisonError::into_inner) = Some(dirs);
        Ok(())
    }

    fn cleanup(&self)
    {
        self.databases.write().unwrap_or_else(PoisonError::into_inner).clear();
        *self.search_dirs.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn find_debug_file(&self, name: &str, guid: &Guid, age: u32) -> BackendResult<PathBuf>
    {
        let dirs = self
            .search_dirs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BackendError::NotInitialized)?;
        let key = guid.symstore_key(age);

        for dir in &dirs {
            let stored = dir.join(name).join(&key).join(name);
            if stored.is_file() {
                return Ok(stored);
            }
            let flat = dir.join(name);
            if flat.is_file() {
                debug!(path = %flat.display(), "using debug file outside symbol-store layout");
                return Ok(flat);
            }
        }
        Err(BackendError::FileNotFound { name: name.to_owned(), key })
    }

    fn load_database(&self, path: &Path, slot_base: u64, size: u32) -> BackendResult<u64>
    {
        if self.databases.read().unwrap_or_else(PoisonError::into_inner).contains_key(&slot_base) {
            return Err(BackendError::SlotInUse(slot_base));
        }
        let database = Database::open(path, size)?;
        debug!(
            path = %database.path.display(),
            base = format_args!("0x{slot_base:016x}"),
            symbols = database.symbols.len(),
            types = database.types.len(),
            "parsed debug database"
        );
        self.databases.write().unwrap_or_else(PoisonError::into_inner).insert(slot_base, Arc::new(database));
        Ok(slot_base)
    }

    fn unload_database(&self, base: u64) -> BackendResult<()>
    {
        let removed = self.databases.write().unwrap_or_else(PoisonError::into_inner).remove(&base);
        match removed {
            Some(database) => {
                trace!(path = %database.path.display(), "unloaded debug database");
                Ok(())
            }
            None => Err(BackendError::UnknownDatabase(base)),
        }
    }

    fn enumerate_symbols(
        &self,
        base: u64,
        pattern: &str,
        visit: &mut dyn FnMut(&SymbolRecord) -> ControlFlow<()>,
    ) -> BackendResult<()>
    {
        let database = self.database(base)?;
        let pattern = Pattern::new(pattern)?;
        for symbol in database.symbols.iter().filter(|symbol| pattern.matches(&symbol.name)) {
            if visit(&Database::symbol_record(symbol, base)).is_break() {
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
        let database = self.database(base)?;
        let pattern = Pattern::new(pattern)?;
        for (id, node) in database.types.named() {
            let Some(name) = node.name.as_deref().filter(|name| pattern.matches(name)) else {
                continue;
            };
            let record = SymbolRecord {
                name: name.to_owned(),
                address: 0,
                module_base: base,
                size: node.length.unwrap_or(0),
                type_id: id,
                tag: node.tag,
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
        let database = self.database(base)?;
        let rva = address
            .checked_sub(base)
            .and_then(|rva| u32::try_from(rva).ok())
            .filter(|&rva| database.size == 0 || rva < database.size)
            .ok_or(BackendError::NoSymbolAt(address))?;
        let (&start, &slot) = database.by_rva.range(..=rva).next_back().ok_or(BackendError::NoSymbolAt(address))?;
        let symbol = database.symbols.get(slot).ok_or(BackendError::NoSymbolAt(address))?;
        Ok((Database::symbol_record(symbol, base), u64::from(rva - start)))
    }

    fn type_info(&self, base: u64, id: TypeId, kind: TypeInfoKind) -> BackendResult<TypeInfoValue>
    {
        self.database(base)?.types.info(id, kind)
    }

    fn type_children(&self, base: u64, id: TypeId) -> BackendResult<Vec<TypeId>>
    {
        Ok(self.database(base)?.types.node(id)?.children.clone())
    }
}

#[cfg(test)]
mod tests
{
    use std::fs;

    use super::*;

    fn guid() -> Guid
    {
        Guid([0xf7, 0x4d, 0x2b, 0x1c, 0xe9, 0xee, 0x2f, 0x4f, 0x85, 0x6c, 0x5a, 0x6c, 0xb3, 0x94, 0x8e, 0x31])
    }

    #[test]
    fn test_search_dirs()
    {
        assert_eq!(search_dirs("srv*/tmp/sym"), vec![PathBuf::from("/tmp/sym")]);
        assert_eq!(
            search_dirs("SRV*/tmp/a*/tmp/b*http://example.com/symbols"),
            vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]
        );
        assert_eq!(search_dirs("https://example.com;;/opt/pdb"), vec![PathBuf::from("/opt/pdb")]);
        assert!(search_dirs("").is_empty());
    }

    #[test]
    fn test_find_debug_file_requires_initialize()
    {
        let backend = PdbFileBackend::new();
        let result = backend.find_debug_file("ntkrnlmp.pdb", &guid(), 1);
        assert!(matches!(result, Err(BackendError::NotInitialized)));
    }

    #[test]
    fn test_find_debug_file_in_symbol_store()
    {
        let cache = tempfile::tempdir().unwrap();
        let dir = cache.path().join("ntkrnlmp.pdb").join(guid().symstore_key(1));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("ntkrnlmp.pdb"), b"stub").unwrap();

        let backend = PdbFileBackend::new();
        backend.initialize(&format!("srv*{}", cache.path().display())).unwrap();
        let path = backend.find_debug_file("ntkrnlmp.pdb", &guid(), 1).unwrap();
        assert_eq!(path, dir.join("ntkrnlmp.pdb"));

        let missing = backend.find_debug_file("ntkrnlmp.pdb", &guid(), 2);
        assert!(matches!(missing, Err(BackendError::FileNotFound { .. })));
    }

    #[test]
    fn test_load_rejects_garbage()
    {
        let cache = tempfile::tempdir().unwrap();
        let path = cache.path().join("broken.pdb");
        fs::write(&path, b"not a pdb file").unwrap();

        let backend = PdbFileBackend::new();
        backend.initialize("").unwrap();
        assert!(backend.load_database(&path, 0x1000_0000, 0).is_err());
        assert!(matches!(backend.unload_database(0x1000_0000), Err(BackendError::UnknownDatabase(_))));
    }

    #[test]
    fn test_queries_on_unknown_base()
    {
        let backend = PdbFileBackend::new();
        assert!(matches!(backend.type_info(1, 1, TypeInfoKind::SymTag), Err(BackendError::UnknownDatabase(1))));
        assert!(matches!(backend.symbol_by_name(1, "PsInitialSystemProcess"), Err(BackendError::UnknownDatabase(1))));
    }
}
