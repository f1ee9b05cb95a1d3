//! # Logging Utilities
//!
//! Logging for vmpdb is built on `tracing`.
//!
//! - Pretty output for interactive use, JSON output for log collection
//! - Level filtering through `RUST_LOG`
//! - Optional file output next to the console
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vmpdb_utils::init_logging;
//!
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("symbol subsystem starting");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level filter (e.g. `RUST_LOG=debug`, `RUST_LOG=vmpdb_core=trace`)
//! - `VMPDB_LOG_FORMAT`: `json` or `pretty` (default: `pretty`)
//! - `VMPDB_LOG_FILE`: optional log file. If it names an existing directory,
//!   a dated file `YYYY-MM-DD-vmpdb.log` is created inside it; otherwise the
//!   path is used as the prefix of a daily rolling file.
//!
//! Keep the returned [`LogGuard`] alive for as long as file output is
//! wanted; dropping it flushes and stops the background writer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const FORMAT_VAR: &str = "VMPDB_LOG_FORMAT";
const FILE_VAR: &str = "VMPDB_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default)
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_owned())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    /// Default
    Info,
    Debug,
    /// Most verbose
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_owned())),
        }
    }
}

/// Keeps the background file writer alive.
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug)]
pub struct LogGuard
{
    _file: Option<WorkerGuard>,
}

/// Initialize logging from the environment.
///
/// Reads `RUST_LOG`, `VMPDB_LOG_FORMAT` and `VMPDB_LOG_FILE`.
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed or the log
/// file directory cannot be created.
pub fn init_logging() -> Result<LogGuard, LoggingError>
{
    let format = env::var(FORMAT_VAR)
        .ok()
        .and_then(|s| LogFormat::from_str(&s).ok())
        .unwrap_or(LogFormat::Pretty);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));
    install(format, filter)
}

/// Initialize logging with an explicit level and format.
///
/// `RUST_LOG` is ignored; `VMPDB_LOG_FILE` is still honored.
///
/// ## Errors
///
/// Same as [`init_logging`].
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LogGuard, LoggingError>
{
    install(format, EnvFilter::new(Level::from(level).to_string()))
}

fn install(format: LogFormat, filter: EnvFilter) -> Result<LogGuard, LoggingError>
{
    let mut layers = vec![console_layer(format, filter.clone())];
    let mut guard = LogGuard { _file: None };
    if let Some(path) = env::var(FILE_VAR).ok().map(PathBuf::from) {
        let (layer, worker) = file_layer(&path, format, filter)?;
        layers.push(layer);
        guard._file = Some(worker);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(guard)
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);
    match format {
        LogFormat::Pretty => layer.with_ansi(true).with_filter(filter).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(true).with_filter(filter).boxed(),
    }
}

fn file_layer(path: &Path, format: LogFormat, filter: EnvFilter) -> Result<(BoxedLayer, WorkerGuard), LoggingError>
{
    let appender = if path.is_dir() {
        let name = format!("{}-vmpdb.log", Utc::now().format("%Y-%m-%d"));
        tracing_appender::rolling::never(path, name)
    } else {
        let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        tracing_appender::rolling::daily(dir, path.file_name().unwrap_or_default())
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false);
    let layer = match format {
        LogFormat::Pretty => layer.with_filter(filter).boxed(),
        LogFormat::Json => layer.json().with_current_span(true).with_span_list(true).with_filter(filter).boxed(),
    };
    Ok((layer, guard))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Unknown log format: {0}. Use 'pretty' or 'json'")]
    InvalidFormat(String),

    #[error("Unknown log level: {0}. Use 'error', 'warn', 'info', 'debug', or 'trace'")]
    InvalidLevel(String),

    /// A global subscriber is already installed
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("dev").unwrap(), LogFormat::Pretty);
        assert!(matches!(LogFormat::from_str("xml"), Err(LoggingError::InvalidFormat(_))));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("error").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert!(matches!(LogLevel::from_str("loud"), Err(LoggingError::InvalidLevel(_))));
    }

    #[test]
    fn test_log_level_to_tracing_level()
    {
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }
}
