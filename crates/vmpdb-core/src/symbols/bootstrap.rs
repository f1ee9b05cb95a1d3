//! # Kernel Bootstrap
//!
//! Discovers, registers and loads the kernel PDB, then enables the
//! subsystem.
//!
//! Loading the kernel PDB may mean waiting on a symbol server, so by default
//! this runs on a background worker. The worker takes the registry lock
//! before anything else and holds it until it is done, which is what makes
//! every later query wait for it. The launcher only waits (at most 500 ms)
//! for that lock to be taken.
//!
//! ## Discovery order
//!
//! 1. CodeView information supplied by the caller
//! 2. The CodeView record referenced by the kernel's PE debug directory
//! 3. A brute-force scan of the first 8 MiB of the kernel image
//!
//! ## Phases
//!
//! ```text
//! NotStarted -> Discovering -> Registering -> Loading -> Enabled
//!                    \               \            \
//!                     +---------------+------------+--> Failed
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::entry::PdbHandle;
use super::loader;
use super::registry::{PdbContext, RegistryState, KERNEL_MODULE_NAME};
use crate::error::{PdbError, PdbResult};
use crate::pe::{scan_for_kernel_codeview, CodeViewInfo};

/// How long the launcher waits for the worker to take the registry lock.
pub const STARTUP_WAIT: Duration = Duration::from_millis(500);

/// Bytes of the kernel image searched for an RSDS record.
pub const SCAN_WINDOW: usize = 0x0080_0000;

/// Name of the bootstrap worker thread.
pub const WORKER_NAME: &str = "pdb-kernel-init";

const WARN_DEFAULT: &str = "WARNING: Functionality may be limited. Extended debug information disabled.";

/// Where the kernel bootstrap runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapMode
{
    /// On a background worker; initialization returns immediately.
    #[default]
    Async,
    /// On the calling thread; initialization returns when bootstrap is done.
    Sync,
}

/// Phase of the kernel bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootstrapState
{
    NotStarted = 0,
    Discovering = 1,
    Registering = 2,
    Loading = 3,
    Enabled = 4,
    Failed = 5,
}

impl BootstrapState
{
    pub(crate) const fn from_u8(value: u8) -> Self
    {
        match value {
            1 => BootstrapState::Discovering,
            2 => BootstrapState::Registering,
            3 => BootstrapState::Loading,
            4 => BootstrapState::Enabled,
            5 => BootstrapState::Failed,
            _ => BootstrapState::NotStarted,
        }
    }
}

/// Options for [`PdbContext::initialize`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions
{
    /// Symbol search path handed to the backend (`srv*<cache>[*<server>]`)
    pub symbol_path: String,
    /// Kernel CodeView record, if the caller already knows it
    pub codeview: Option<CodeViewInfo>,
    /// Where the bootstrap runs
    pub mode: BootstrapMode,
}

/// Start the bootstrap according to `mode`.
pub(crate) fn launch(ctx: &Arc<PdbContext>, codeview: Option<CodeViewInfo>, mode: BootstrapMode) -> PdbResult<()>
{
    match mode {
        BootstrapMode::Sync => {
            run(ctx, codeview, None);
            Ok(())
        }
        BootstrapMode::Async => {
            let (started_tx, started_rx) = mpsc::channel();
            let worker_ctx = Arc::clone(ctx);
            let handle = thread::Builder::new()
                .name(WORKER_NAME.to_owned())
                .spawn(move || run(&worker_ctx, codeview, Some(started_tx)))?;
            ctx.set_worker(handle);
            if started_rx.recv_timeout(STARTUP_WAIT).is_err() {
                debug!("bootstrap worker did not report start within {STARTUP_WAIT:?}");
            }
            Ok(())
        }
    }
}

fn run(ctx: &PdbContext, codeview: Option<CodeViewInfo>, started: Option<mpsc::Sender<()>>)
{
    let mut state = ctx.lock_state();
    if let Some(started) = started {
        let _ = started.send(());
    }

    match bootstrap_locked(ctx, &mut state, codeview) {
        Ok(handle) => {
            ctx.set_enabled(&state, true);
            ctx.set_bootstrap_state(BootstrapState::Enabled);
            info!(%handle, "initialization of debug symbol functionality completed");
        }
        Err(err) => {
            ctx.set_bootstrap_state(BootstrapState::Failed);
            warn!("{WARN_DEFAULT}");
            warn!("         Reason: {}", failure_reason(&err));
            debug!(error = %err, "kernel bootstrap failed");
        }
    }
}

fn bootstrap_locked(ctx: &PdbContext, state: &mut RegistryState, codeview: Option<CodeViewInfo>) -> PdbResult<PdbHandle>
{
    ctx.set_bootstrap_state(BootstrapState::Discovering);
    let codeview = codeview
        .or_else(|| discover_from_headers(ctx))
        .or_else(|| discover_by_scan(ctx))
        .ok_or_else(|| PdbError::Discovery("no CodeView record in kernel image".into()))?;
    debug!(pdb = %codeview.pdb_file_name, guid = %codeview.guid, age = codeview.age, "located kernel debug information");

    ctx.set_bootstrap_state(BootstrapState::Registering);
    let target = ctx.target;
    let handle = state
        .insert(target.kernel_base, target.kernel_size, KERNEL_MODULE_NAME, &codeview)
        .ok_or_else(|| PdbError::RegistrationFailed(KERNEL_MODULE_NAME.into()))?;
    let entry = state.get(handle).ok_or_else(|| PdbError::RegistrationFailed(KERNEL_MODULE_NAME.into()))?;

    ctx.set_bootstrap_state(BootstrapState::Loading);
    loader::ensure_loaded(state, &entry, ctx.backend.as_ref())?;
    Ok(handle)
}

fn discover_from_headers(ctx: &PdbContext) -> Option<CodeViewInfo>
{
    let target = ctx.target;
    if target.kernel_base.is_null() {
        return None;
    }
    match ctx.pe.codeview(target.system_process, target.kernel_base) {
        Ok(codeview) => Some(codeview),
        Err(err) => {
            debug!(error = %err, "kernel PE headers carry no CodeView record, scanning image");
            None
        }
    }
}

fn discover_by_scan(ctx: &PdbContext) -> Option<CodeViewInfo>
{
    let target = ctx.target;
    if target.kernel_base.is_null() {
        return None;
    }
    let image = ctx.memory.read_zero_pad(target.system_process, target.kernel_base, SCAN_WINDOW);
    scan_for_kernel_codeview(&image)
}

fn failure_reason(err: &PdbError) -> &'static str
{
    match err {
        PdbError::Discovery(_) => "Unable to locate debugging information in kernel image.",
        PdbError::RegistrationFailed(_) => "Failed creating initial PDB entry.",
        _ => "Unable to download kernel symbols to cache from Symbol Server.",
    }
}
