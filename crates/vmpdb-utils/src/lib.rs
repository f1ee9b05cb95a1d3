//! # vmpdb Utilities
//!
//! Logging setup and the persistent symbol configuration shared by the
//! vmpdb crates.

pub mod config;
pub mod logging;

pub use config::{ConfigError, ConfigStore, SymbolConfig};
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogGuard, LogLevel, LoggingError};
pub use tracing::{debug, error, info, trace, warn};
