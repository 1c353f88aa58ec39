//! # Logging Utilities
//!
//! Logging infrastructure for createdump using `tracing`.
//!
//! This module provides structured logging with support for:
//! - Two output formats (JSON for collection pipelines, pretty for people)
//! - Environment variable configuration
//! - An optional log file next to the console output
//!
//! Console output goes to stderr. The dump tool may be run by a crash
//! handler that captures stdout, and the two must not mix.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use createdump_utils::{init_logging, LoggingOptions};
//!
//! // Keep the guard alive until the program exits so file output is flushed
//! let _guard = init_logging(&LoggingOptions::default()).expect("Failed to initialize logging");
//!
//! tracing::info!("Gathering state for process 1234");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Log level filter (e.g., `RUST_LOG=debug`, `RUST_LOG=createdump_core=trace`)
//! - `CREATEDUMP_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
//! - `CREATEDUMP_LOG_FILE`: Optional path to a log file, used when `--logtofile` is absent
//!
//! ## Level Selection
//!
//! 1. An explicit level in [`LoggingOptions`] (`--verbose` → trace, `--diag` → debug)
//! 2. `RUST_LOG`, which also accepts per-crate filters
//! 3. `info`

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fs, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format
pub const LOG_FORMAT_ENV: &str = "CREATEDUMP_LOG_FORMAT";

/// Environment variable naming a log file
pub const LOG_FILE_ENV: &str = "CREATEDUMP_LOG_FILE";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default)
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(format!("Unknown log format: {s}. Use 'pretty' or 'json'")),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
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
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!(
                "Unknown log level: {s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            )),
        }
    }
}

/// How the command line asked for logging to be set up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingOptions
{
    /// Level forced by a flag; `None` defers to `RUST_LOG`
    pub level: Option<LogLevel>,
    /// Console (and file) format; `None` reads `CREATEDUMP_LOG_FORMAT`
    pub format: Option<LogFormat>,
    /// Log file; `None` reads `CREATEDUMP_LOG_FILE`
    pub file: Option<PathBuf>,
}

impl LoggingOptions
{
    /// Options for the `--verbose` and `--diag` flags.
    ///
    /// `--verbose` wins when both are given.
    pub fn from_flags(verbose: bool, diag: bool, file: Option<PathBuf>) -> Self
    {
        let level = if verbose {
            Some(LogLevel::Trace)
        } else if diag {
            Some(LogLevel::Debug)
        } else {
            None
        };
        Self {
            level,
            format: None,
            file,
        }
    }

    fn resolved_format(&self) -> LogFormat
    {
        self.format.unwrap_or_else(|| {
            env::var(LOG_FORMAT_ENV)
                .ok()
                .and_then(|s| LogFormat::from_str(&s).ok())
                .unwrap_or_default()
        })
    }

    fn resolved_file(&self) -> Option<PathBuf>
    {
        self.file
            .clone()
            .or_else(|| env::var(LOG_FILE_ENV).ok().filter(|s| !s.is_empty()).map(PathBuf::from))
    }
}

/// Filter directive for an explicit level or the `RUST_LOG` value.
fn filter_directive(level: Option<LogLevel>, rust_log: Option<&str>) -> String
{
    match (level, rust_log) {
        (Some(level), _) => Level::from(level).to_string(),
        (None, Some(filter)) if !filter.trim().is_empty() => filter.to_string(),
        _ => Level::INFO.to_string(),
    }
}

fn build_filter(level: Option<LogLevel>) -> EnvFilter
{
    let rust_log = env::var("RUST_LOG").ok();
    let directive = filter_directive(level, rust_log.as_deref());
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
}

/// Initialize logging for the process.
///
/// Returns the file writer's guard when a log file is configured. Dropping
/// it flushes and stops the background writer, so hold it until exit.
///
/// ## Example
///
/// ```rust,no_run
/// use createdump_utils::{init_logging, LogLevel, LoggingOptions};
///
/// let options = LoggingOptions {
///     level: Some(LogLevel::Debug),
///     ..LoggingOptions::default()
/// };
/// let _guard = init_logging(&options).expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - The log file's directory cannot be created
pub fn init_logging(options: &LoggingOptions) -> Result<Option<WorkerGuard>, LoggingError>
{
    let format = options.resolved_format();
    let env_filter = build_filter(options.level);

    let (file_writer, guard) = match options.resolved_file() {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(open_appender(&path)?);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    match format {
        LogFormat::Pretty => {
            let console_layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_ansi(true)
                .with_writer(io::stderr)
                .with_filter(env_filter.clone());

            if let Some(non_blocking) = file_writer {
                let file_layer = fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false) // No ANSI in files
                    .with_filter(env_filter);

                Registry::default()
                    .with(console_layer)
                    .with(file_layer)
                    .try_init()
                    .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
            } else {
                Registry::default()
                    .with(console_layer)
                    .try_init()
                    .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
            }
        }
        LogFormat::Json => {
            let console_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(io::stderr)
                .with_filter(env_filter.clone());

            if let Some(non_blocking) = file_writer {
                let file_layer = fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_filter(env_filter);

                Registry::default()
                    .with(console_layer)
                    .with(file_layer)
                    .try_init()
                    .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
            } else {
                Registry::default()
                    .with(console_layer)
                    .try_init()
                    .map_err(|e| LoggingError::InitializationFailed(e.to_string()))?;
            }
        }
    }

    Ok(guard)
}

/// Appender writing to exactly `path`, without rotation.
fn open_appender(path: &Path) -> Result<tracing_appender::rolling::RollingFileAppender, LoggingError>
{
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&directory)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidPath(path.display().to_string()))?;
    Ok(tracing_appender::rolling::never(directory, file_name))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// The log file path has no file name
    #[error("Invalid log file path: {0}")]
    InvalidPath(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
