//! Lazy materialization of registered PDBs.

use tracing::{debug, warn};

use super::entry::{LoadState, PdbEntry};
use super::registry::RegistryState;
use crate::backend::{BackendError, SymbolBackend};
use crate::error::{PdbError, PdbResult};

/// Make sure the entry's database is loaded and return its synthetic base.
///
/// Requires the registry lock (witnessed by `&mut RegistryState`). The first
/// call locates the debug file on the symbol path and loads it at the next
/// free slot; the slot counter advances even if the load then fails. Any
/// failure is recorded on the entry and returned again on every later call
/// without touching the backend.
pub(crate) fn ensure_loaded(state: &mut RegistryState, entry: &PdbEntry, backend: &dyn SymbolBackend) -> PdbResult<u64>
{
    match entry.load_state() {
        Some(LoadState::Loaded { base, .. }) => return Ok(*base),
        Some(LoadState::Failed) => {
            return Err(PdbError::LoadFailed { module: entry.module_name().to_owned() });
        }
        None => {}
    }

    let outcome = materialize(state, entry, backend);
    let recorded = match outcome {
        Ok((path, base)) => {
            debug!(module = entry.module_name(), path = %path.display(), base = format_args!("0x{base:016x}"), "loaded PDB");
            entry.finish_load(LoadState::Loaded { path, base })
        }
        Err(err) => {
            warn!(module = entry.module_name(), pdb = entry.debug_file_name(), error = %err, "failed to load PDB");
            entry.finish_load(LoadState::Failed)
        }
    };

    match recorded {
        LoadState::Loaded { base, .. } => Ok(*base),
        LoadState::Failed => Err(PdbError::LoadFailed { module: entry.module_name().to_owned() }),
    }
}

fn materialize(
    state: &mut RegistryState,
    entry: &PdbEntry,
    backend: &dyn SymbolBackend,
) -> Result<(std::path::PathBuf, u64), BackendError>
{
    let path = backend.find_debug_file(entry.debug_file_name(), entry.guid(), entry.age())?;
    let slot = state.take_slot();
    let base = backend.load_database(&path, slot, entry.module_size())?;
    if base == 0 {
        return Err(BackendError::UnknownDatabase(slot));
    }
    Ok((path, base))
}
