//! # Symbol Configuration
//!
//! Where debug symbols come from: a local symbol-store cache and, optionally,
//! a symbol server. The configuration is persisted as TOML:
//!
//! ```toml
//! enable = true
//! server_enable = true
//! local_cache = "/var/cache/vmpdb/Symbols"
//! server_url = "https://symbols.example.com"
//! ```
//!
//! Only values that differ from the defaults are written back, so a stored
//! file keeps following the defaults unless the user changed them.

use std::path::{Path, PathBuf};
use std::{env, fs, io};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Public Microsoft symbol server.
pub const DEFAULT_SERVER: &str = "https://msdl.microsoft.com/download/symbols";

/// Stored strings shorter than this are treated as unset.
const MIN_VALUE_LEN: usize = 3;

const CONFIG_DIR: &str = "vmpdb";
const CONFIG_FILE: &str = "symbols.toml";

/// `Symbols` next to the running binary.
pub fn default_cache_dir() -> PathBuf
{
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("Symbols")))
        .unwrap_or_else(|| PathBuf::from("Symbols"))
}

fn is_http_url(value: &str) -> bool
{
    let lower = value.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Symbol subsystem configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolConfig
{
    /// Enable debug symbol support at all
    pub enable: bool,
    /// Allow the symbol server in the symbol path
    pub server_enable: bool,
    /// Local symbol-store directory (default: [`default_cache_dir`])
    pub local_cache: Option<PathBuf>,
    /// Symbol server URL (default: [`DEFAULT_SERVER`])
    pub server_url: Option<String>,
    /// Keep the server out of the symbol path for the first initialization
    #[serde(skip)]
    pub disable_server_on_startup: bool,
}

impl Default for SymbolConfig
{
    fn default() -> Self
    {
        SymbolConfig {
            enable: true,
            server_enable: true,
            local_cache: None,
            server_url: None,
            disable_server_on_startup: false,
        }
    }
}

impl SymbolConfig
{
    /// Effective local cache directory.
    pub fn cache_dir(&self) -> PathBuf
    {
        self.local_cache
            .clone()
            .filter(|dir| dir.as_os_str().len() >= MIN_VALUE_LEN)
            .unwrap_or_else(default_cache_dir)
    }

    /// Effective symbol server URL.
    pub fn server(&self) -> &str
    {
        self.server_url.as_deref().filter(|url| url.len() >= MIN_VALUE_LEN).unwrap_or(DEFAULT_SERVER)
    }

    /// `true` if the server is part of the symbol path right now.
    pub fn server_active(&self) -> bool
    {
        self.server_enable && !self.disable_server_on_startup
    }

    /// Symbol search path: `srv*<cache>` or `srv*<cache>*<server>`.
    ///
    /// ```rust
    /// use std::path::PathBuf;
    /// use vmpdb_utils::config::SymbolConfig;
    ///
    /// let config = SymbolConfig {
    ///     local_cache: Some(PathBuf::from("/sym")),
    ///     server_enable: false,
    ///     ..SymbolConfig::default()
    /// };
    /// assert_eq!(config.symbol_path(), "srv*/sym");
    /// ```
    pub fn symbol_path(&self) -> String
    {
        let cache = self.cache_dir();
        if self.server_active() {
            format!("srv*{}*{}", cache.display(), self.server())
        } else {
            format!("srv*{}", cache.display())
        }
    }

    /// The subset of this configuration worth persisting.
    ///
    /// The cache directory is kept only if it exists and is not the default;
    /// the server URL only if it is an `http(s)` URL other than the default.
    pub fn for_storage(&self) -> SymbolConfig
    {
        let default_cache = default_cache_dir();
        let local_cache = self
            .local_cache
            .clone()
            .filter(|dir| dir.as_os_str().len() >= MIN_VALUE_LEN && *dir != default_cache && dir.is_dir());
        let server_url = self.server_url.clone().filter(|url| is_http_url(url) && url != DEFAULT_SERVER);
        SymbolConfig {
            enable: self.enable,
            server_enable: self.server_enable,
            local_cache,
            server_url,
            disable_server_on_startup: false,
        }
    }
}

/// Configuration persistence error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError
{
    #[error("config file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unable to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// TOML file holding a [`SymbolConfig`].
#[derive(Debug, Clone)]
pub struct ConfigStore
{
    path: PathBuf,
}

impl ConfigStore
{
    pub fn new(path: impl Into<PathBuf>) -> Self
    {
        ConfigStore { path: path.into() }
    }

    /// `<config dir>/vmpdb/symbols.toml`, if the platform has a config dir.
    pub fn default_location() -> Option<Self>
    {
        dirs::config_dir().map(|dir| ConfigStore::new(dir.join(CONFIG_DIR).join(CONFIG_FILE)))
    }

    pub fn path(&self) -> &Path
    {
        &self.path
    }

    /// Load the stored configuration. A missing file yields the defaults.
    ///
    /// ## Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<SymbolConfig, ConfigError>
    {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(toml::from_str(&text)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(SymbolConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Persist `config` following the write-back rules of
    /// [`SymbolConfig::for_storage`].
    ///
    /// ## Errors
    ///
    /// Returns an error if the file or its directory cannot be written.
    pub fn save(&self, config: &SymbolConfig) -> Result<(), ConfigError>
    {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let text = toml::to_string_pretty(&config.for_storage())?;
        fs::write(&self.path, text)?;
        debug!(path = %self.path.display(), "saved symbol configuration");
        Ok(())
    }
}
