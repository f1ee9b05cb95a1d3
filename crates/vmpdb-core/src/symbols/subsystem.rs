//! Configuration-driven lifecycle around a [`PdbContext`].
//!
//! The subsystem owns the current symbol configuration and, if one is
//! supplied, the store it is persisted in. Initialization is skipped when
//! symbols are disabled by configuration. A configuration change persists
//! the new values, closes the current context and initializes a fresh one
//! synchronously.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::info;
use vmpdb_utils::{ConfigStore, SymbolConfig};

use super::bootstrap::{BootstrapMode, InitOptions};
use super::registry::{Capabilities, PdbContext};
use crate::error::{PdbError, PdbResult};
use crate::pe::CodeViewInfo;
use crate::types::TargetInfo;

pub struct PdbSubsystem
{
    capabilities: Capabilities,
    target: TargetInfo,
    codeview: Option<CodeViewInfo>,
    mode: BootstrapMode,
    config: Mutex<SymbolConfig>,
    store: Option<ConfigStore>,
    context: RwLock<Option<Arc<PdbContext>>>,
}

impl PdbSubsystem
{
    pub fn new(capabilities: Capabilities, target: TargetInfo, config: SymbolConfig) -> Self
    {
        PdbSubsystem {
            capabilities,
            target,
            codeview: None,
            mode: BootstrapMode::default(),
            config: Mutex::new(config),
            store: None,
            context: RwLock::new(None),
        }
    }

    /// Load the configuration from `store` and persist later changes there.
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::Config`] if the stored file is unreadable.
    pub fn with_store(capabilities: Capabilities, target: TargetInfo, store: ConfigStore) -> PdbResult<Self>
    {
        let config = store.load()?;
        let mut subsystem = PdbSubsystem::new(capabilities, target, config);
        subsystem.store = Some(store);
        Ok(subsystem)
    }

    /// Use this kernel CodeView record instead of discovering it.
    #[must_use]
    pub fn codeview(mut self, codeview: CodeViewInfo) -> Self
    {
        self.codeview = Some(codeview);
        self
    }

    /// Bootstrap mode for the first initialization.
    #[must_use]
    pub fn mode(mut self, mode: BootstrapMode) -> Self
    {
        self.mode = mode;
        self
    }

    /// Initialize the subsystem unless it already is, or symbols are
    /// disabled by configuration.
    ///
    /// ## Errors
    ///
    /// Propagates [`PdbContext::initialize`] errors.
    pub fn initialize(&self) -> PdbResult<()>
    {
        self.initialize_with(self.mode)
    }

    fn initialize_with(&self, mode: BootstrapMode) -> PdbResult<()>
    {
        let config = self.config();
        let mut slot = self.context.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        if !config.enable {
            info!("debug symbol support disabled by configuration");
            return Ok(());
        }

        let options = InitOptions { symbol_path: config.symbol_path(), codeview: self.codeview.clone(), mode };
        *slot = Some(PdbContext::initialize(self.capabilities.clone(), self.target, options)?);
        Ok(())
    }

    /// The live context.
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::NotInitialized`] if the subsystem is closed or
    /// disabled by configuration.
    pub fn context(&self) -> PdbResult<Arc<PdbContext>>
    {
        self.context.read().unwrap_or_else(PoisonError::into_inner).clone().ok_or(PdbError::NotInitialized)
    }

    pub fn close(&self)
    {
        let context = self.context.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(context) = context {
            context.close();
        }
    }

    pub fn config(&self) -> SymbolConfig
    {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Apply a new configuration: persist it, close the current context and
    /// initialize again on the calling thread.
    ///
    /// The startup server override only ever applies to the first
    /// initialization and is cleared here.
    ///
    /// ## Errors
    ///
    /// Returns [`PdbError::Config`] if the configuration cannot be saved, or
    /// the error of the re-initialization.
    pub fn config_change(&self, mut config: SymbolConfig) -> PdbResult<()>
    {
        config.disable_server_on_startup = false;
        if let Some(store) = &self.store {
            store.save(&config)?;
        }
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
        info!("symbol configuration changed, reinitializing");

        self.close();
        self.initialize_with(BootstrapMode::Sync)
    }

    /// Block until the kernel bootstrap has finished. Returns immediately if
    /// the subsystem is not initialized.
    pub fn wait_complete(&self)
    {
        if let Ok(context) = self.context() {
            context.wait_bootstrap();
        }
    }
}

impl Drop for PdbSubsystem
{
    fn drop(&mut self)
    {
        self.close();
    }
}
